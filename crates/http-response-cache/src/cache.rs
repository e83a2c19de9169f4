//! File-backed response storage with in-memory metadata

use crate::types::{CacheStats, CachedResponse, ResponseEntry};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A response cache with in-memory metadata and file-based storage
pub struct ResponseCache {
    /// Stored responses by `cache_key(url)`
    entries: RwLock<HashMap<String, ResponseEntry>>,
    /// One body file per entry
    cache_dir: PathBuf,
    /// Byte budget shared by every body
    max_size: u64,
    /// Seconds a response stays servable
    ttl_secs: u64,
    current_size: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(cache_dir: PathBuf, max_size: u64, ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cache_dir,
            max_size,
            ttl_secs,
            current_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create the cache directory and sweep bodies left by a previous process
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.cache_dir).await?;

        let mut swept = 0usize;
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!(path = ?entry.path(), error = %e, "Failed to sweep stale response");
                } else {
                    swept += 1;
                }
            }
        }

        info!(cache_dir = ?self.cache_dir, swept, "Response cache initialized");
        Ok(())
    }

    /// Hashed file name for a request URL
    pub fn cache_key(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up the stored body for `url`
    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        let key = Self::cache_key(url);

        let entry = {
            let entries = self.entries.read().await;
            entries.get(&key).cloned()
        };

        if let Some(entry) = entry {
            let age_secs = (Utc::now() - entry.created_at).num_seconds().max(0) as u64;
            if age_secs > self.ttl_secs {
                debug!(url, age_secs, ttl_secs = self.ttl_secs, "Cached response expired");
                self.forget(&key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            match fs::read(&entry.path).await {
                Ok(data) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(url, "Response cache hit");
                    return Some(CachedResponse {
                        data: Bytes::from(data),
                        content_type: entry.content_type,
                    });
                }
                Err(e) => {
                    warn!(url, error = %e, "Failed to read cached response, removing entry");
                    self.forget(&key).await;
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store the body of a successful response to `url`
    pub async fn put(&self, url: &str, data: &[u8], content_type: Option<&str>) -> io::Result<()> {
        let key = Self::cache_key(url);
        let size = data.len() as u64;

        if size > self.max_size {
            debug!(url, size, max_size = self.max_size, "Response too large to cache");
            return Ok(());
        }

        // Replacing an entry must not double count its size
        self.forget(&key).await;
        self.make_room(size).await;

        let path = self.cache_dir.join(&key);
        fs::write(&path, data).await?;

        let entry = ResponseEntry {
            url: url.to_string(),
            path,
            content_type: content_type.map(str::to_string),
            size,
            created_at: Utc::now(),
        };

        {
            let mut entries = self.entries.write().await;
            entries.insert(key, entry);
        }

        self.current_size.fetch_add(size, Ordering::Relaxed);
        debug!(url, size, "Cached response");

        Ok(())
    }

    /// Whether a live entry exists for `url`, without touching counters
    pub async fn contains(&self, url: &str) -> bool {
        let key = Self::cache_key(url);
        let entries = self.entries.read().await;
        entries
            .get(&key)
            .is_some_and(|e| (Utc::now() - e.created_at).num_seconds() as u64 <= self.ttl_secs)
    }

    /// Drop every stored response
    pub async fn clear(&self) {
        let drained: Vec<ResponseEntry> = {
            let mut entries = self.entries.write().await;
            entries.drain().map(|(_, e)| e).collect()
        };

        for entry in &drained {
            self.current_size.fetch_sub(entry.size, Ordering::Relaxed);
            if let Err(e) = fs::remove_file(&entry.path).await {
                warn!(path = ?entry.path, error = %e, "Failed to remove cached response");
            }
        }

        info!(removed = drained.len(), "Cleared response cache");
    }

    /// Drop the responses stored longest ago until `incoming` more bytes fit
    async fn make_room(&self, incoming: u64) {
        let budget = self.max_size.saturating_sub(incoming);
        if self.current_size.load(Ordering::Relaxed) <= budget {
            return;
        }

        // Newest first, so popping yields the oldest response
        let mut by_age: Vec<(DateTime<Utc>, String)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .map(|(key, entry)| (entry.created_at, key.clone()))
                .collect()
        };
        by_age.sort_unstable_by_key(|(stored_at, _)| Reverse(*stored_at));

        let mut evicted = 0usize;
        while self.current_size.load(Ordering::Relaxed) > budget {
            let Some((_, key)) = by_age.pop() else {
                break;
            };
            self.forget(&key).await;
            evicted += 1;
        }
        debug!(evicted, incoming, "Made room in response cache");
    }

    /// Drop the entry stored under a hashed URL along with its body file
    async fn forget(&self, key: &str) {
        let Some(entry) = self.entries.write().await.remove(key) else {
            return;
        };

        self.current_size.fetch_sub(entry.size, Ordering::Relaxed);
        if let Err(e) = fs::remove_file(&entry.path).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(url = %entry.url, error = %e, "Failed to remove response body");
            }
        }
    }

    /// Entry count, stored bytes and lookup counters
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await.len();
        CacheStats {
            entries,
            total_size: self.current_size.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
