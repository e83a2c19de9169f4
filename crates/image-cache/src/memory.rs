//! In-memory cache of decoded images, bounded by total pixel count

use crate::error::Result;
use image::DynamicImage;
use image_cache_key::ImageCacheKey;
use moka::future::Cache;
use std::sync::Arc;

/// A decoded image ready for rendering
#[derive(Debug)]
pub struct CachedImage {
    pub image: DynamicImage,
}

impl CachedImage {
    /// Decode PNG, JPEG, GIF or WebP bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(data)?;
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Pixel count, the unit the memory cache is bounded by
    pub fn cost(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }
}

/// Cost-weighted cache of decoded images keyed by `(key, variant)`
pub struct MemoryImageCache {
    images: Cache<ImageCacheKey, Arc<CachedImage>>,
}

impl MemoryImageCache {
    pub fn new(cost_limit: u64) -> Self {
        let images = Cache::builder()
            .max_capacity(cost_limit)
            .weigher(|_key: &ImageCacheKey, image: &Arc<CachedImage>| -> u32 {
                image.cost().min(u64::from(u32::MAX)) as u32
            })
            .build();

        Self { images }
    }

    pub async fn get(&self, key: &ImageCacheKey) -> Option<Arc<CachedImage>> {
        self.images.get(key).await
    }

    pub async fn put(&self, key: ImageCacheKey, image: Arc<CachedImage>) {
        self.images.insert(key, image).await;
    }

    pub async fn invalidate(&self, key: &ImageCacheKey) {
        self.images.invalidate(key).await;
    }

    pub async fn clear(&self) {
        self.images.invalidate_all();
        self.images.run_pending_tasks().await;
    }

    /// Total cost of held images, after pending evictions are applied
    pub async fn total_cost(&self) -> u64 {
        self.images.run_pending_tasks().await;
        self.images.weighted_size()
    }
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    DynamicImage::new_rgba8(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}
