//! Cache types

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata for a cached response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub url: String,
    pub path: PathBuf,
    pub content_type: Option<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// A response body read back from the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
}
