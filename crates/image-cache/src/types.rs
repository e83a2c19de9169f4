//! Core types for the image cache

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image_cache_key::{CacheKey, ImageCacheKey, Variant};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A permanently cached blob, unique by `(key, variant)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CacheItem {
    pub id: i64,
    pub key: String,
    pub variant: Variant,
    pub created_at: DateTime<Utc>,
}

impl CacheItem {
    pub fn image_key(&self) -> ImageCacheKey {
        ImageCacheKey::new(CacheKey::new(&self.key), self.variant)
    }
}

/// A caller-chosen namespace owning a set of cache items
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct CacheGroup {
    pub id: i64,
    pub key: String,
}

/// Scheduling hint passed to the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Raw image bytes with the MIME type they were served as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedData {
    pub data: Bytes,
    pub mime_type: Option<String>,
}

/// Row counts of the metadata store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub items: i64,
    pub groups: i64,
    pub memberships: i64,
}
