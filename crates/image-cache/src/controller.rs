//! Image cache controller
//!
//! Ties the tiers together:
//!
//! - permanent caching of URLs under caller-chosen groups, with downloads
//!   coalesced per `(key, variant)` and group-scoped removal
//! - a layered, network-free read path (memory, then the transport's
//!   response cache, then the permanent blob store)
//! - transient fetches, coalesced at the byte level and cancellable per URL
//!
//! Work for a coalesced request runs in a spawned task. The task only keeps
//! a weak reference to the controller while it waits on the network, so
//! dropping the controller is observed as
//! [`ImageCacheError::ControllerDeinitialized`] rather than kept alive by
//! in-flight downloads.

use crate::attributes::SidecarAttributes;
use crate::blob_store::BlobStore;
use crate::config::ImageCacheConfig;
use crate::error::{ImageCacheError, Result};
use crate::memory::{CachedImage, MemoryImageCache};
use crate::metadata::{MetadataStore, StoreContext};
use crate::transport::{discard, Download, Transport, TransportCache};
use crate::types::{Priority, StoreStats, TypedData};
use bytes::Bytes;
use completion_coalescer::Coalescer;
use futures::future::join_all;
use image_cache_key::ImageCacheKey;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type PermanentWaiter = oneshot::Sender<Result<()>>;
type DataWaiter = oneshot::Sender<Result<Bytes>>;

/// Entry point to the image cache. Cheap to clone.
#[derive(Clone)]
pub struct ImageCacheController {
    inner: Arc<Inner>,
}

struct Inner {
    store: MetadataStore,
    blobs: BlobStore,
    memory: MemoryImageCache,
    transport: Arc<dyn Transport>,
    transport_cache: Arc<dyn TransportCache>,
    permanent: Arc<Coalescer<PermanentWaiter>>,
    data_fetches: Arc<Coalescer<DataWaiter>>,
}

struct PermanentRequest {
    url: String,
    group_key: String,
    priority: Priority,
    key: ImageCacheKey,
    identifier: String,
}

impl ImageCacheController {
    /// Open the permanent store under `config.root` and wire up the tiers.
    ///
    /// Fails with [`ImageCacheError::StoreUnavailable`] when the metadata
    /// store cannot be opened even after recreating it.
    pub async fn open(
        config: &ImageCacheConfig,
        transport: Arc<dyn Transport>,
        transport_cache: Arc<dyn TransportCache>,
    ) -> Result<Self> {
        let blobs = BlobStore::new(config.blob_dir(), Arc::new(SidecarAttributes));
        blobs.init().await?;
        let store = MetadataStore::open(&config.metadata_path()).await?;

        let inner = Inner {
            store,
            blobs,
            memory: MemoryImageCache::new(config.memory_cost_limit),
            transport,
            transport_cache,
            permanent: Arc::new(Coalescer::new()),
            data_fetches: Arc::new(Coalescer::new()),
        };

        info!(root = ?config.root, "Image cache controller ready");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Download `url` into permanent storage (once) and record it under
    /// `group_key`.
    ///
    /// Concurrent calls for the same image share one download.
    pub async fn permanently_cache(
        &self,
        url: &str,
        group_key: &str,
        priority: Priority,
    ) -> Result<()> {
        if url.is_empty() {
            return Err(ImageCacheError::InvalidOrEmptyUrl);
        }

        let key = ImageCacheKey::from_url(url);
        let identifier = key.identifier();

        loop {
            let (reply, response) = oneshot::channel();
            let is_first = self.inner.permanent.add(reply, &identifier);
            if is_first {
                self.spawn_permanent(PermanentRequest {
                    url: url.to_string(),
                    group_key: group_key.to_string(),
                    priority,
                    key: key.clone(),
                    identifier: identifier.clone(),
                });
            }

            let result = response.await.unwrap_or(Err(ImageCacheError::Cancelled));
            if is_first || result.is_err() {
                return result;
            }

            // The shared download was recorded under the first caller's group
            if self.inner.link_existing(&key, group_key).await? {
                return Ok(());
            }
            debug!(identifier = %identifier, group = %group_key, "Shared download removed before linking, retrying");
        }
    }

    /// Permanently cache every URL under `group_key`.
    ///
    /// All URLs are attempted; the first failure (in URL order) is reported.
    /// Cancelled requests are not failures.
    pub async fn permanently_cache_in_background<S: AsRef<str>>(
        &self,
        urls: &[S],
        group_key: &str,
    ) -> Result<()> {
        let results = join_all(
            urls.iter()
                .map(|url| self.permanently_cache(url.as_ref(), group_key, Priority::Low)),
        )
        .await;

        let mut failures = results
            .into_iter()
            .filter_map(|result| result.err())
            .filter(|e| !matches!(e, ImageCacheError::Cancelled));

        match failures.next() {
            None => Ok(()),
            Some(first) => {
                warn!(
                    group = %group_key,
                    failed = 1 + failures.count(),
                    total = urls.len(),
                    "Some images could not be cached"
                );
                Err(first)
            }
        }
    }

    /// Drop a group, cancelling its in-flight downloads.
    ///
    /// Items only this group owned are deleted along with their blobs; items
    /// shared with other groups are just unlinked.
    pub async fn remove_permanently_cached_images(&self, group_key: &str) -> Result<()> {
        self.inner.permanent.cancel_group(group_key);

        let blobs = self.inner.blobs.clone();
        let owned_key = group_key.to_string();
        let removed = self
            .inner
            .store
            .perform(move |ctx| Box::pin(async move { remove_group(ctx, &blobs, &owned_key).await }))
            .await?;

        for key in &removed {
            self.inner.memory.invalidate(key).await;
        }

        info!(group = %group_key, removed = removed.len(), "Removed cache group");
        Ok(())
    }

    /// Bytes and MIME type from permanent storage
    pub async fn permanently_cached_typed_disk_data(&self, url: &str) -> Option<TypedData> {
        if url.is_empty() {
            return None;
        }

        let path = self.inner.blobs.path_for(&ImageCacheKey::from_url(url));
        let data = self.inner.blobs.read(&path).await?;
        let mime_type = self.inner.blobs.mime_type(&path).await;
        Some(TypedData { data, mime_type })
    }

    pub async fn permanently_cached_data(&self, url: &str) -> Option<Bytes> {
        if url.is_empty() {
            return None;
        }

        let path = self.inner.blobs.path_for(&ImageCacheKey::from_url(url));
        self.inner.blobs.read(&path).await
    }

    /// Bytes the transport kept from an earlier fetch in this session
    pub async fn session_cached_data(&self, url: &str) -> Option<TypedData> {
        if url.is_empty() {
            return None;
        }

        let response = self.inner.transport_cache.lookup(url).await?;
        Some(TypedData {
            data: response.data,
            mime_type: response.content_type,
        })
    }

    /// Cached bytes from the session cache, else from permanent storage
    pub async fn data(&self, url: &str) -> Result<TypedData> {
        if url.is_empty() {
            return Err(ImageCacheError::InvalidOrEmptyUrl);
        }

        if let Some(data) = self.session_cached_data(url).await {
            return Ok(data);
        }
        self.permanently_cached_typed_disk_data(url)
            .await
            .ok_or(ImageCacheError::DataNotFound)
    }

    /// Decoded image from whichever tier has it, without touching the network.
    ///
    /// Hits below the memory tier are decoded and kept in memory.
    pub async fn cached_image(&self, url: &str) -> Option<Arc<CachedImage>> {
        if url.is_empty() {
            return None;
        }

        let key = ImageCacheKey::from_url(url);
        if let Some(image) = self.inner.memory.get(&key).await {
            debug!(url = %url, "Memory cache hit");
            return Some(image);
        }

        if let Some(response) = self.inner.transport_cache.lookup(url).await {
            match self.inner.remember(&key, response.data).await {
                Ok(image) => {
                    debug!(url = %url, "Session cache hit");
                    return Some(image);
                }
                Err(e) => warn!(url = %url, error = %e, "Failed to decode session cached image"),
            }
        }

        let path = self.inner.blobs.path_for(&key);
        if let Some(data) = self.inner.blobs.read(&path).await {
            match self.inner.remember(&key, data).await {
                Ok(image) => {
                    debug!(url = %url, "Permanent cache hit");
                    return Some(image);
                }
                Err(e) => warn!(url = %url, error = %e, "Failed to decode permanently cached image"),
            }
        }

        debug!(url = %url, "Image not cached");
        None
    }

    /// Decoded image from memory, else fetched from the network
    pub async fn fetch_image(&self, url: Option<&str>, priority: Priority) -> Result<Arc<CachedImage>> {
        let url = match url {
            Some(url) if !url.is_empty() => url,
            _ => return Err(ImageCacheError::InvalidOrEmptyUrl),
        };

        let key = ImageCacheKey::from_url(url);
        if let Some(image) = self.inner.memory.get(&key).await {
            return Ok(image);
        }

        let data = self.fetch_data(url, priority).await?;
        self.inner.remember(&key, data).await
    }

    /// Raw bytes from the network.
    ///
    /// Concurrent calls for the same image share one request.
    pub async fn fetch_data(&self, url: &str, priority: Priority) -> Result<Bytes> {
        if url.is_empty() {
            return Err(ImageCacheError::InvalidOrEmptyUrl);
        }

        let identifier = ImageCacheKey::from_url(url).identifier();
        let (reply, response) = oneshot::channel();
        if self.inner.data_fetches.add(reply, &identifier) {
            self.spawn_fetch(url, priority, &identifier);
        }

        response.await.unwrap_or(Err(ImageCacheError::Cancelled))
    }

    /// Abort the transient fetch for `url`; permanent downloads are untouched
    pub fn cancel_fetch(&self, url: &str) {
        if url.is_empty() {
            return;
        }
        self.inner
            .data_fetches
            .cancel(&ImageCacheKey::from_url(url).identifier());
    }

    /// Warm the session cache for `url` at low priority.
    ///
    /// Failures are logged, never returned.
    pub fn prefetch(&self, url: &str) -> JoinHandle<()> {
        let controller = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            match controller.fetch_data(&url, Priority::Low).await {
                Ok(data) => debug!(url = %url, size = data.len(), "Prefetched"),
                Err(e) => debug!(url = %url, error = %e, "Prefetch failed"),
            }
        })
    }

    /// Clear the transport's response cache; permanent storage is untouched
    pub async fn delete_temporary_cache(&self) {
        self.inner.transport_cache.clear_all().await;
        info!("Cleared temporary image cache");
    }

    pub async fn metadata_stats(&self) -> Result<StoreStats> {
        self.inner.store.stats().await
    }

    /// Blob reads attempted so far
    pub fn blob_read_count(&self) -> u64 {
        self.inner.blobs.read_count()
    }

    /// Pixels held by the memory tier
    pub async fn memory_cost(&self) -> u64 {
        self.inner.memory.total_cost().await
    }

    fn spawn_permanent(&self, request: PermanentRequest) {
        let inner = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        let coalescer = Arc::clone(&self.inner.permanent);
        let group_key = request.group_key.clone();
        let identifier = request.identifier.clone();

        spawn_coalesced(
            &self.inner.permanent,
            Some(&group_key),
            &identifier,
            async move {
                let result = cache_permanently(&inner, transport.as_ref(), &request).await;
                if let Err(e) = &result {
                    warn!(
                        url = %request.url,
                        group = %request.group_key,
                        error = %e,
                        "Failed to cache image permanently"
                    );
                }
                coalescer.complete(Some(&request.group_key), &request.identifier, |waiter| {
                    let _ = waiter.send(result.clone());
                });
            },
        );
    }

    fn spawn_fetch(&self, url: &str, priority: Priority, identifier: &str) {
        let transport = Arc::clone(&self.inner.transport);
        let coalescer = Arc::clone(&self.inner.data_fetches);
        let url = url.to_string();
        let owned_identifier = identifier.to_string();

        spawn_coalesced(&self.inner.data_fetches, None, identifier, async move {
            let result = match transport.fetch(&url, priority).await {
                Ok(fetched) if fetched.data.is_empty() => Err(ImageCacheError::InvalidResponse),
                Ok(fetched) => Ok(fetched.data),
                Err(e) => {
                    debug!(url = %url, error = %e, "Fetch failed");
                    Err(e.into())
                }
            };
            coalescer.complete(None, &owned_identifier, |waiter| {
                let _ = waiter.send(result.clone());
            });
        });
    }
}

/// Spawn `work` and register its abort handle with `coalescer`.
///
/// The work waits until its handle is registered, so it can never complete
/// before the coalescer knows about it.
fn spawn_coalesced<T, F>(coalescer: &Coalescer<T>, group: Option<&str>, identifier: &str, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (arm, armed) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        if armed.await.is_ok() {
            work.await;
        }
    });

    coalescer.add_handle(task.abort_handle(), group, identifier);
    let _ = arm.send(());
}

fn upgrade(inner: &Weak<Inner>) -> Result<Arc<Inner>> {
    inner
        .upgrade()
        .ok_or(ImageCacheError::ControllerDeinitialized)
}

async fn cache_permanently(
    inner: &Weak<Inner>,
    transport: &dyn Transport,
    request: &PermanentRequest,
) -> Result<()> {
    let linked = upgrade(inner)?
        .link_existing(&request.key, &request.group_key)
        .await?;
    if linked {
        debug!(identifier = %request.identifier, group = %request.group_key, "Already cached, linked to group");
        return Ok(());
    }

    let download = transport.download(&request.url, request.priority).await?;
    if download.len == 0 {
        discard(&download.path).await;
        return Err(ImageCacheError::InvalidResponse);
    }

    let Some(inner) = inner.upgrade() else {
        discard(&download.path).await;
        return Err(ImageCacheError::ControllerDeinitialized);
    };
    inner.persist_download(request, download).await
}

async fn remove_group(
    ctx: &mut StoreContext,
    blobs: &BlobStore,
    group_key: &str,
) -> Vec<ImageCacheKey> {
    let group = match ctx.fetch_group(group_key).await {
        Ok(Some(group)) => group,
        Ok(None) => {
            debug!(group = %group_key, "No such cache group");
            return Vec::new();
        }
        Err(e) => {
            warn!(group = %group_key, error = %e, "Failed to look up cache group");
            return Vec::new();
        }
    };

    let items = ctx.group_items(&group).await.unwrap_or_else(|e| {
        warn!(group = %group_key, error = %e, "Failed to list cache group items");
        Vec::new()
    });

    let mut removed = Vec::new();
    for item in items {
        match ctx.membership_count(&item).await {
            Ok(count) if count <= 1 => {
                let key = item.image_key();
                // Blob first: a record without a blob is worse than an orphaned file
                if let Err(e) = blobs.delete(&blobs.path_for(&key)).await {
                    warn!(identifier = %key, error = %e, "Failed to delete blob");
                }
                if let Err(e) = ctx.delete_item(&item).await {
                    warn!(identifier = %key, error = %e, "Failed to delete cache item");
                }
                removed.push(key);
            }
            Ok(_) => {
                if let Err(e) = ctx.unlink_item_from_group(&item, &group).await {
                    warn!(group = %group_key, item = item.id, error = %e, "Failed to unlink cache item");
                }
            }
            Err(e) => {
                warn!(group = %group_key, item = item.id, error = %e, "Failed to count item memberships");
            }
        }
    }

    if let Err(e) = ctx.delete_group(&group).await {
        warn!(group = %group_key, error = %e, "Failed to delete cache group");
    }
    ctx.save().await;
    removed
}

impl Inner {
    /// Link the stored item for `key` to `group_key`.
    ///
    /// Returns `false` when no item exists; a failed lookup counts as absent.
    async fn link_existing(&self, key: &ImageCacheKey, group_key: &str) -> Result<bool> {
        let item_key = key.key.as_str().to_string();
        let variant = key.variant;
        let group_key = group_key.to_string();

        self.store
            .perform(move |ctx| {
                Box::pin(async move {
                    let item = match ctx.fetch_item(&item_key, variant).await {
                        Ok(Some(item)) => item,
                        Ok(None) => return false,
                        Err(e) => {
                            warn!(key = %item_key, variant, error = %e, "Failed to look up cache item");
                            return false;
                        }
                    };

                    match ctx.fetch_or_create_group(&group_key).await {
                        Ok(group) => {
                            if let Err(e) = ctx.link_item_to_group(&item, &group).await {
                                warn!(group = %group_key, error = %e, "Failed to link cache item");
                            }
                        }
                        Err(e) => warn!(group = %group_key, error = %e, "Failed to create cache group"),
                    }
                    ctx.save().await;
                    true
                })
            })
            .await
    }

    /// Move a finished download into the blob store and record it
    async fn persist_download(&self, request: &PermanentRequest, download: Download) -> Result<()> {
        let path = self.blobs.path_for(&request.key);
        if let Err(e) = self.blobs.move_into(&download.path, &path).await {
            warn!(url = %request.url, path = ?path, error = %e, "Failed to move download into blob store");
            discard(&download.path).await;
            return Err(e.into());
        }

        if let Some(mime_type) = &download.mime_type {
            if let Err(e) = self.blobs.set_mime_type(&path, mime_type).await {
                warn!(path = ?path, error = %e, "Failed to record MIME type");
            }
        }

        let item_key = request.key.key.as_str().to_string();
        let variant = request.key.variant;
        let group_key = request.group_key.clone();

        let result = self
            .store
            .perform(move |ctx| {
                Box::pin(async move {
                    let item = ctx.fetch_or_create_item(&item_key, variant).await;
                    let group = ctx.fetch_or_create_group(&group_key).await;
                    let (item, group) = match (item, group) {
                        (Ok(item), Ok(group)) => (item, group),
                        (Err(e), _) | (_, Err(e)) => {
                            warn!(key = %item_key, group = %group_key, error = %e, "Failed to create cache records");
                            ctx.discard_changes().await;
                            return Err(ImageCacheError::InvalidImageCache);
                        }
                    };

                    if let Err(e) = ctx.link_item_to_group(&item, &group).await {
                        warn!(group = %group_key, error = %e, "Failed to link cache item");
                    }
                    ctx.save().await;
                    Ok(())
                })
            })
            .await
            .and_then(|result| result);

        if result.is_err() {
            // No record will point at this blob
            if let Err(e) = self.blobs.delete(&path).await {
                warn!(path = ?path, error = %e, "Failed to delete unrecorded blob");
            }
        } else {
            debug!(identifier = %request.identifier, group = %request.group_key, "Cached permanently");
        }
        result
    }

    /// Decode `data` off the async runtime and keep the image in memory
    async fn remember(&self, key: &ImageCacheKey, data: Bytes) -> Result<Arc<CachedImage>> {
        let image = tokio::task::spawn_blocking(move || CachedImage::decode(&data))
            .await
            .map_err(|_| ImageCacheError::Cancelled)??;

        let image = Arc::new(image);
        self.memory.put(key.clone(), Arc::clone(&image)).await;
        Ok(image)
    }
}
