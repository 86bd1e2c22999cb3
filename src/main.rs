mod cache;
mod config;
mod error;
mod guard;
mod notify;
mod poller;
mod store;
mod sync;
mod upstream;
mod webhook;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cache::TtlCache;
use guard::{CircuitBreaker, RateLimiter, RetryPolicy};
use store::{DurableStore, NoopStore, SqliteStore};
use sync::SyncOrchestrator;
use upstream::{GuardedUpstream, HttpUpstream};
use webhook::{WebhookPayload, WebhookProcessor};

#[derive(Parser, Debug)]
#[command(name = "boardsync")]
#[command(about = "Mirrors a kanban board into a local cache for dashboards")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/boardsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Run one full sync, print the health summary, and exit
  #[arg(long)]
  once: bool,

  /// Search the mirrored records once and exit
  #[arg(long, value_name = "QUERY")]
  search: Option<String>,

  /// Log to stderr instead of the rolling log file
  #[arg(long)]
  log_stderr: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let _log_guard = init_logging(args.log_stderr)?;

  // Shared services. Everything downstream holds Arcs into this set.
  let cache = Arc::new(TtlCache::new(config.cache.capacity));
  let upstream = Arc::new(GuardedUpstream::new(
    Arc::new(HttpUpstream::new(&config)?),
    Arc::new(RateLimiter::new(
      config.rate_limit.ceiling,
      config.rate_window(),
    )),
    Arc::new(CircuitBreaker::new(
      config.breaker.threshold,
      config.breaker_cooldown(),
    )),
    RetryPolicy::standard(),
  ));

  let store: Arc<dyn DurableStore> = match SqliteStore::open() {
    Ok(store) => Arc::new(store),
    Err(err) => {
      warn!(error = %err, "durable store unavailable, running without persistence");
      Arc::new(NoopStore)
    }
  };
  match store.prune_history(chrono::Duration::days(config.history.retention_days)) {
    Ok(0) => {}
    Ok(pruned) => info!(pruned, "pruned old sync history"),
    Err(err) => warn!(error = %err, "history pruning failed"),
  }

  let notifier = Arc::new(notify::Notifier::new());
  let orchestrator = Arc::new(SyncOrchestrator::new(
    Arc::clone(&upstream),
    Arc::clone(&cache),
    Arc::clone(&store),
    Arc::clone(&notifier),
    config.list_ttl(),
    config.record_ttl(),
    config.always_refresh,
  ));

  let sweeper = cache.spawn_sweeper(config.sweep_interval());

  if let Some(query) = args.search {
    let matches = orchestrator.search(&query).await?;
    for record in &matches {
      println!("{}  [{}]  {}", record.external_id, record.status_raw, record.title);
    }
    println!("{} matching records", matches.len());
    sweeper.abort();
    return Ok(());
  }

  match orchestrator.full_sync().await {
    Ok(outcome) => info!(
      records = outcome.records.len(),
      degraded = outcome.stats.degraded,
      "initial sync complete"
    ),
    Err(err) => error!(error = %err, "initial sync failed"),
  }

  if args.once {
    print_health(&orchestrator);
    sweeper.abort();
    return Ok(());
  }

  let processor = Arc::new(WebhookProcessor::new(
    Arc::clone(&upstream),
    Arc::clone(&cache),
    Arc::clone(&store),
    Arc::clone(&notifier),
    config.record_ttl(),
    config.webhook.batch_size,
    config.webhook_batch_pause(),
  ));

  // Webhook ingress: an upstream relay pipes one JSON payload per line
  // into stdin. Malformed lines are logged and skipped.
  let ingress_processor = Arc::clone(&processor);
  let ingress = tokio::spawn(async move {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
      let line = line.trim().to_string();
      if line.is_empty() {
        continue;
      }
      match serde_json::from_str::<WebhookPayload>(&line) {
        Ok(payload) => {
          ingress_processor.submit(payload);
          ingress_processor.drain().await;
        }
        Err(err) => warn!(error = %err, "discarding malformed webhook payload"),
      }
    }
  });

  let poller = poller::PollingScheduler::new(
    Arc::clone(&upstream),
    Arc::clone(&cache),
    Arc::clone(&store),
    Arc::clone(&notifier),
    config.list_ttl(),
  );
  poller.start(config.poll_interval(), |changes| {
    info!(count = changes.len(), "poll applied upstream changes");
  });

  info!(
    board = %config.upstream.board_id,
    poll_secs = config.polling.interval_secs,
    "boardsync running, press Ctrl-C to stop"
  );
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("failed to listen for shutdown signal: {}", e))?;

  info!("shutting down");
  poller.stop();
  ingress.abort();
  sweeper.abort();
  print_health(&orchestrator);

  Ok(())
}

fn init_logging(to_stderr: bool) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("could not determine data directory for logs"))?
    .join("boardsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "boardsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}

fn print_health(orchestrator: &SyncOrchestrator) {
  let cache = orchestrator.cache_stats();
  let breaker = orchestrator.circuit_breaker_status();
  let metrics = orchestrator.sync_metrics();

  println!("cache: {}/{} entries, hit rate {:.1}%", cache.entries, cache.capacity, cache.hit_rate * 100.0);
  println!(
    "breaker: {:?}, consecutive failures {}",
    breaker.state, breaker.consecutive_failures
  );
  for key in [
    upstream::guarded::endpoint::RECORDS,
    upstream::guarded::endpoint::CHANGES,
    upstream::guarded::endpoint::RECORD,
  ] {
    let limiter = orchestrator.rate_limiter_status(key);
    println!(
      "rate limit '{}': {}/{} in window",
      key, limiter.in_window, limiter.ceiling
    );
  }
  println!(
    "syncs: {} total, {} failed, avg {:.0} ms",
    metrics.total, metrics.failed, metrics.avg_duration_ms
  );
}
