//! HTTP response cache
//!
//! Keeps successful response bodies on disk, keyed by request URL, with
//! in-memory metadata, TTL expiration and oldest-first eviction once the
//! configured size is exceeded. Entries only live for the lifetime of the
//! process: leftovers from a previous run are swept on [`ResponseCache::init`].

mod cache;
mod types;

pub use cache::ResponseCache;
pub use types::{CacheStats, CachedResponse, ResponseEntry};
