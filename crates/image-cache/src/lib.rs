//! Multi-tier image cache
//!
//! Images are served from three tiers:
//!
//! - an in-memory cache of decoded images, bounded by total pixel count
//! - the HTTP transport's response cache, which lives for the session
//! - permanent storage: blob files plus SQLite metadata recording which
//!   caller-chosen groups own each image
//!
//! [`ImageCacheController`] is the entry point. Construct it with a
//! [`Transport`] (usually [`ReqwestTransport`]) and the [`TransportCache`]
//! the transport writes to.
//!
//! # Example
//!
//! ```ignore
//! let config = ImageCacheConfig::from_env();
//! let responses = Arc::new(ResponseCache::new(
//!     config.response_dir(),
//!     config.response_max_size,
//!     config.response_ttl_secs,
//! ));
//! responses.init().await?;
//! let transport = Arc::new(ReqwestTransport::new(&config, responses.clone())?);
//! transport.init().await?;
//!
//! let cache = ImageCacheController::open(&config, transport, responses).await?;
//! cache.permanently_cache(url, "Article_title", Priority::Normal).await?;
//! ```

pub mod attributes;
pub mod blob_store;
pub mod config;
pub mod controller;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use attributes::{AttributeStore, SidecarAttributes};
pub use blob_store::BlobStore;
pub use config::ImageCacheConfig;
pub use controller::ImageCacheController;
pub use error::{ImageCacheError, Result, TransportError};
pub use image_cache_key::{CacheKey, ImageCacheKey, Variant};
pub use memory::{CachedImage, MemoryImageCache};
pub use metadata::{MetadataStore, StoreContext};
pub use transport::{Download, Fetched, ReqwestTransport, Transport, TransportCache};
pub use types::{CacheGroup, CacheItem, Priority, StoreStats, TypedData};
