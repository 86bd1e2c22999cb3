use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub upstream: UpstreamConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub rate_limit: RateLimitConfig,
  #[serde(default)]
  pub breaker: BreakerConfig,
  #[serde(default)]
  pub polling: PollingConfig,
  #[serde(default)]
  pub webhook: WebhookConfig,
  #[serde(default)]
  pub history: HistoryConfig,
  /// Always refetch on full sync even when the list cache is fresh.
  /// Useful when debugging staleness; leave off in normal operation.
  #[serde(default)]
  pub always_refresh: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  /// Base URL of the board/CRM API, e.g. "https://boards.example.com/api/1/"
  pub url: String,
  /// Identifier of the monitored board.
  pub board_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_cache_capacity")]
  pub capacity: usize,
  /// TTL for the record list and pipelines entries.
  #[serde(default = "default_list_ttl_secs")]
  pub list_ttl_secs: u64,
  /// TTL for individual record entries.
  #[serde(default = "default_record_ttl_secs")]
  pub record_ttl_secs: u64,
  #[serde(default = "default_sweep_interval_secs")]
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: default_cache_capacity(),
      list_ttl_secs: default_list_ttl_secs(),
      record_ttl_secs: default_record_ttl_secs(),
      sweep_interval_secs: default_sweep_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
  /// Max calls per endpoint key inside one window.
  #[serde(default = "default_rate_ceiling")]
  pub ceiling: usize,
  #[serde(default = "default_rate_window_secs")]
  pub window_secs: u64,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      ceiling: default_rate_ceiling(),
      window_secs: default_rate_window_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
  /// Consecutive failures before the breaker opens.
  #[serde(default = "default_breaker_threshold")]
  pub threshold: u32,
  #[serde(default = "default_breaker_cooldown_secs")]
  pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      threshold: default_breaker_threshold(),
      cooldown_secs: default_breaker_cooldown_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
  #[serde(default = "default_poll_interval_secs")]
  pub interval_secs: u64,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_poll_interval_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
  /// Events processed per drain batch.
  #[serde(default = "default_webhook_batch_size")]
  pub batch_size: usize,
  /// Pause between batches while the queue is non-empty.
  #[serde(default = "default_webhook_batch_pause_ms")]
  pub batch_pause_ms: u64,
}

impl Default for WebhookConfig {
  fn default() -> Self {
    Self {
      batch_size: default_webhook_batch_size(),
      batch_pause_ms: default_webhook_batch_pause_ms(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
  /// Audit entries older than this are pruned on startup.
  #[serde(default = "default_history_retention_days")]
  pub retention_days: i64,
}

impl Default for HistoryConfig {
  fn default() -> Self {
    Self {
      retention_days: default_history_retention_days(),
    }
  }
}

fn default_cache_capacity() -> usize {
  500
}
fn default_list_ttl_secs() -> u64 {
  300
}
fn default_record_ttl_secs() -> u64 {
  300
}
fn default_sweep_interval_secs() -> u64 {
  60
}
fn default_rate_ceiling() -> usize {
  90
}
fn default_rate_window_secs() -> u64 {
  10
}
fn default_breaker_threshold() -> u32 {
  5
}
fn default_breaker_cooldown_secs() -> u64 {
  30
}
fn default_poll_interval_secs() -> u64 {
  60
}
fn default_webhook_batch_size() -> usize {
  10
}
fn default_webhook_batch_pause_ms() -> u64 {
  100
}
fn default_history_retention_days() -> i64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./boardsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/boardsync/config.yaml
  /// 4. ~/.config/boardsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/boardsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("boardsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("boardsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the upstream API token from environment variables.
  ///
  /// Checks BOARDSYNC_API_TOKEN first, then BOARD_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("BOARDSYNC_API_TOKEN")
      .or_else(|_| std::env::var("BOARD_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "API token not found. Set BOARDSYNC_API_TOKEN or BOARD_API_TOKEN environment variable."
        )
      })
  }

  pub fn list_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.list_ttl_secs)
  }

  pub fn record_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.record_ttl_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.cache.sweep_interval_secs)
  }

  pub fn rate_window(&self) -> Duration {
    Duration::from_secs(self.rate_limit.window_secs)
  }

  pub fn breaker_cooldown(&self) -> Duration {
    Duration::from_secs(self.breaker.cooldown_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.polling.interval_secs)
  }

  pub fn webhook_batch_pause(&self) -> Duration {
    Duration::from_millis(self.webhook.batch_pause_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_applies_defaults() {
    let config: Config = serde_yaml::from_str(
      "upstream:\n  url: https://boards.example.com/api/1/\n  board_id: brd-1\n",
    )
    .unwrap();

    assert_eq!(config.cache.capacity, 500);
    assert_eq!(config.rate_limit.ceiling, 90);
    assert_eq!(config.breaker.threshold, 5);
    assert_eq!(config.polling.interval_secs, 60);
    assert_eq!(config.webhook.batch_size, 10);
    assert_eq!(config.history.retention_days, 30);
    assert!(!config.always_refresh);
  }

  #[test]
  fn test_overrides_win_over_defaults() {
    let config: Config = serde_yaml::from_str(
      "upstream:\n  url: https://boards.example.com/api/1/\n  board_id: brd-1\n\
       cache:\n  capacity: 50\n  list_ttl_secs: 30\n\
       breaker:\n  threshold: 3\n\
       always_refresh: true\n",
    )
    .unwrap();

    assert_eq!(config.cache.capacity, 50);
    assert_eq!(config.list_ttl(), Duration::from_secs(30));
    // Unset fields inside an overridden section still default.
    assert_eq!(config.record_ttl(), Duration::from_secs(300));
    assert_eq!(config.breaker.threshold, 3);
    assert!(config.always_refresh);
  }

  #[test]
  fn test_missing_upstream_section_is_an_error() {
    let result: std::result::Result<Config, _> = serde_yaml::from_str("always_refresh: true\n");
    assert!(result.is_err());
  }
}
