//! TTL/LRU caching for mirrored upstream data.
//!
//! The cache decides when locally-held data is still trustworthy; every
//! other component funnels freshness questions through it.

mod key;
mod ttl;

pub use key::CacheKey;
pub use ttl::{CacheStats, TtlCache};
