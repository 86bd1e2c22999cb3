//! In-memory TTL cache with LRU eviction.
//!
//! The cache is the single serialization point for freshness decisions:
//! a `get` answers "is this data still trustworthy" and an expired entry is
//! logically absent even before the background sweep removes it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// How many recent lookups the rolling hit rate is computed over.
const RECENT_WINDOW: usize = 100;

#[derive(Debug)]
struct Entry<V> {
  value: V,
  stored_at: Instant,
  ttl: Duration,
  hit_count: u64,
  last_accessed: Instant,
  /// Insertion order, used to break LRU ties.
  inserted_seq: u64,
}

impl<V> Entry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    now.duration_since(self.stored_at) > self.ttl
  }
}

/// Aggregate cache statistics for the health surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
  pub entries: usize,
  pub capacity: usize,
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  /// Hit rate over the last `RECENT_WINDOW` lookups, 0.0..=1.0.
  pub hit_rate: f64,
}

struct Inner<V> {
  entries: HashMap<String, Entry<V>>,
  seq: u64,
  hits: u64,
  misses: u64,
  evictions: u64,
  recent: VecDeque<bool>,
}

impl<V> Inner<V> {
  fn record_lookup(&mut self, hit: bool) {
    if hit {
      self.hits += 1;
    } else {
      self.misses += 1;
    }
    if self.recent.len() == RECENT_WINDOW {
      self.recent.pop_front();
    }
    self.recent.push_back(hit);
  }
}

/// TTL cache with a hard capacity and pure-LRU eviction.
pub struct TtlCache<V> {
  inner: Mutex<Inner<V>>,
  capacity: usize,
}

impl<V: Clone> TtlCache<V> {
  /// Create a cache holding at most `capacity` entries.
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        seq: 0,
        hits: 0,
        misses: 0,
        evictions: 0,
        recent: VecDeque::with_capacity(RECENT_WINDOW),
      }),
      capacity: capacity.max(1),
    }
  }

  /// Look up a value. Expired entries are deleted on read and count as
  /// misses. A hit refreshes `last_accessed` and bumps the hit counter.
  pub fn get(&self, key: &str) -> Option<V> {
    let now = Instant::now();
    let mut inner = self.inner.lock().expect("cache lock poisoned");

    let expired = match inner.entries.get(key) {
      Some(entry) => entry.is_expired(now),
      None => {
        inner.record_lookup(false);
        return None;
      }
    };

    if expired {
      inner.entries.remove(key);
      inner.record_lookup(false);
      trace!(key, "cache entry expired on read");
      return None;
    }

    let entry = inner.entries.get_mut(key).expect("checked above");
    entry.last_accessed = now;
    entry.hit_count += 1;
    let value = entry.value.clone();
    inner.record_lookup(true);
    Some(value)
  }

  /// Insert a value with the given TTL, evicting the least-recently-used
  /// entry first when the cache is at capacity. Replacing an existing key
  /// never evicts.
  pub fn set(&self, key: &str, value: V, ttl: Duration) {
    let now = Instant::now();
    let mut inner = self.inner.lock().expect("cache lock poisoned");

    if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
      if let Some(victim) = inner
        .entries
        .iter()
        .min_by_key(|(_, e)| (e.last_accessed, e.inserted_seq))
        .map(|(k, _)| k.clone())
      {
        inner.entries.remove(&victim);
        inner.evictions += 1;
        debug!(evicted = %victim, "cache at capacity, evicted LRU entry");
      }
    }

    inner.seq += 1;
    let seq = inner.seq;
    inner.entries.insert(
      key.to_string(),
      Entry {
        value,
        stored_at: now,
        ttl,
        hit_count: 0,
        last_accessed: now,
        inserted_seq: seq,
      },
    );
  }

  /// Remove a single entry. Returns whether it was present.
  pub fn delete(&self, key: &str) -> bool {
    let mut inner = self.inner.lock().expect("cache lock poisoned");
    inner.entries.remove(key).is_some()
  }

  /// Delete every key matching the pattern. A trailing `*` matches by
  /// prefix, anything else matches exactly. All matches are removed under
  /// one lock acquisition, so readers never see a partially-cleared region.
  pub fn invalidate_by_pattern(&self, pattern: &str) -> usize {
    let mut inner = self.inner.lock().expect("cache lock poisoned");

    let matching: Vec<String> = match pattern.strip_suffix('*') {
      Some(prefix) => inner
        .entries
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
      None => inner
        .entries
        .keys()
        .filter(|k| k.as_str() == pattern)
        .cloned()
        .collect(),
    };

    for key in &matching {
      inner.entries.remove(key);
    }
    if !matching.is_empty() {
      debug!(pattern, removed = matching.len(), "invalidated cache region");
    }
    matching.len()
  }

  /// Drop every entry. Counters are retained.
  pub fn invalidate_all(&self) {
    let mut inner = self.inner.lock().expect("cache lock poisoned");
    let removed = inner.entries.len();
    inner.entries.clear();
    debug!(removed, "invalidated entire cache");
  }

  /// Snapshot aggregate statistics.
  pub fn stats(&self) -> CacheStats {
    let inner = self.inner.lock().expect("cache lock poisoned");
    let recent_hits = inner.recent.iter().filter(|h| **h).count();
    let hit_rate = if inner.recent.is_empty() {
      0.0
    } else {
      recent_hits as f64 / inner.recent.len() as f64
    };
    CacheStats {
      entries: inner.entries.len(),
      capacity: self.capacity,
      hits: inner.hits,
      misses: inner.misses,
      evictions: inner.evictions,
      hit_rate,
    }
  }

  /// Remove every expired entry. Returns how many were swept. Bounds
  /// memory for entries that are never read again.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut inner = self.inner.lock().expect("cache lock poisoned");
    let expired: Vec<String> = inner
      .entries
      .iter()
      .filter(|(_, e)| e.is_expired(now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in &expired {
      inner.entries.remove(key);
    }
    if !expired.is_empty() {
      debug!(swept = expired.len(), "cache sweep removed expired entries");
    }
    expired.len()
  }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
  /// Spawn the background sweep loop. The task runs until aborted; `main`
  /// holds the handle for the lifetime of the process.
  pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let cache = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      // First tick completes immediately.
      ticker.tick().await;
      loop {
        ticker.tick().await;
        cache.sweep();
      }
    })
  }
}
