//! Persistent metadata for permanently cached images
//!
//! Cache items, cache groups and the membership relation between them live
//! in one SQLite file. A single worker task owns the connection; callers
//! submit closures with [`MetadataStore::perform`] and every closure runs to
//! completion before the next one starts, so a check-then-write sequence
//! inside one closure is never interleaved with another caller.
//!
//! Mutations open a transaction lazily. Nothing is durable until
//! [`StoreContext::save`] commits it.

use crate::error::{ImageCacheError, Result};
use crate::types::{CacheGroup, CacheItem, StoreStats};
use chrono::Utc;
use futures::future::BoxFuture;
use image_cache_key::Variant;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::ConnectOptions;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

type Job = Box<dyn for<'c> FnOnce(&'c mut StoreContext) -> BoxFuture<'c, ()> + Send>;

/// Handle to the metadata worker
#[derive(Clone)]
pub struct MetadataStore {
    jobs: mpsc::UnboundedSender<Job>,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (or create) the store at `path`.
    ///
    /// A store that fails to open is deleted and created again once; if that
    /// fails too the store is unavailable.
    pub async fn open(path: &Path) -> Result<Self> {
        let conn = match connect(path).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to open metadata store, recreating it");
                remove_store_files(path).await;
                connect(path).await.map_err(|e| {
                    error!(path = ?path, error = %e, "Failed to recreate metadata store");
                    ImageCacheError::StoreUnavailable(e.to_string())
                })?
            }
        };

        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let mut context = StoreContext { conn, dirty: false };

        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job(&mut context).await;
            }
            context.save().await;
            debug!("Metadata store worker stopped");
        });

        info!(path = ?path, "Metadata store opened");
        Ok(Self {
            jobs,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the store's worker and return its result.
    ///
    /// ```ignore
    /// let item = store
    ///     .perform(move |ctx| Box::pin(async move { ctx.fetch_item(&key, 0).await }))
    ///     .await?;
    /// ```
    pub async fn perform<R, F>(&self, f: F) -> Result<R>
    where
        F: for<'c> FnOnce(&'c mut StoreContext) -> BoxFuture<'c, R> + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job = into_job(move |ctx| {
            Box::pin(async move {
                let _ = reply.send(f(ctx).await);
            })
        });

        self.jobs
            .send(job)
            .map_err(|_| ImageCacheError::ControllerDeinitialized)?;
        response
            .await
            .map_err(|_| ImageCacheError::ControllerDeinitialized)
    }

    /// Row counts, for diagnostics
    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self
            .perform(|ctx| Box::pin(async move { ctx.stats().await }))
            .await??)
    }
}

fn into_job<F>(f: F) -> Job
where
    F: for<'c> FnOnce(&'c mut StoreContext) -> BoxFuture<'c, ()> + Send + 'static,
{
    Box::new(f)
}

async fn connect(path: &Path) -> std::result::Result<SqliteConnection, sqlx::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .connect()
        .await?;

    MIGRATOR
        .run(&mut conn)
        .await
        .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

    Ok(conn)
}

async fn remove_store_files(path: &Path) {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        let file = PathBuf::from(name);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => debug!(path = ?file, "Removed metadata store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?file, error = %e, "Failed to remove metadata store file"),
        }
    }
}

/// Exclusive access to the store, handed to closures run by the worker
pub struct StoreContext {
    conn: SqliteConnection,
    dirty: bool,
}

impl StoreContext {
    async fn begin_if_needed(&mut self) -> std::result::Result<(), sqlx::Error> {
        if !self.dirty {
            sqlx::query("BEGIN IMMEDIATE").execute(&mut self.conn).await?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Whether uncommitted changes are pending
    pub fn has_changes(&self) -> bool {
        self.dirty
    }

    pub async fn fetch_item(
        &mut self,
        key: &str,
        variant: Variant,
    ) -> std::result::Result<Option<CacheItem>, sqlx::Error> {
        sqlx::query_as::<_, CacheItem>(
            "SELECT id, key, variant, created_at FROM cache_items WHERE key = ?1 AND variant = ?2 LIMIT 1",
        )
        .bind(key)
        .bind(variant)
        .fetch_optional(&mut self.conn)
        .await
    }

    pub async fn fetch_group(
        &mut self,
        key: &str,
    ) -> std::result::Result<Option<CacheGroup>, sqlx::Error> {
        sqlx::query_as::<_, CacheGroup>("SELECT id, key FROM cache_groups WHERE key = ?1 LIMIT 1")
            .bind(key)
            .fetch_optional(&mut self.conn)
            .await
    }

    pub async fn fetch_or_create_item(
        &mut self,
        key: &str,
        variant: Variant,
    ) -> std::result::Result<CacheItem, sqlx::Error> {
        if let Some(item) = self.fetch_item(key, variant).await? {
            return Ok(item);
        }

        self.begin_if_needed().await?;
        sqlx::query_as::<_, CacheItem>(
            r#"
            INSERT INTO cache_items (key, variant, created_at)
            VALUES (?1, ?2, ?3)
            RETURNING id, key, variant, created_at
            "#,
        )
        .bind(key)
        .bind(variant)
        .bind(Utc::now())
        .fetch_one(&mut self.conn)
        .await
    }

    pub async fn fetch_or_create_group(
        &mut self,
        key: &str,
    ) -> std::result::Result<CacheGroup, sqlx::Error> {
        if let Some(group) = self.fetch_group(key).await? {
            return Ok(group);
        }

        self.begin_if_needed().await?;
        sqlx::query_as::<_, CacheGroup>(
            "INSERT INTO cache_groups (key) VALUES (?1) RETURNING id, key",
        )
        .bind(key)
        .fetch_one(&mut self.conn)
        .await
    }

    /// Add `item` to `group`; linking twice is a no-op
    pub async fn link_item_to_group(
        &mut self,
        item: &CacheItem,
        group: &CacheGroup,
    ) -> std::result::Result<(), sqlx::Error> {
        self.begin_if_needed().await?;
        sqlx::query("INSERT OR IGNORE INTO cache_group_items (group_id, item_id) VALUES (?1, ?2)")
            .bind(group.id)
            .bind(item.id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    pub async fn unlink_item_from_group(
        &mut self,
        item: &CacheItem,
        group: &CacheGroup,
    ) -> std::result::Result<(), sqlx::Error> {
        self.begin_if_needed().await?;
        sqlx::query("DELETE FROM cache_group_items WHERE group_id = ?1 AND item_id = ?2")
            .bind(group.id)
            .bind(item.id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Items that are members of `group`
    pub async fn group_items(
        &mut self,
        group: &CacheGroup,
    ) -> std::result::Result<Vec<CacheItem>, sqlx::Error> {
        sqlx::query_as::<_, CacheItem>(
            r#"
            SELECT i.id, i.key, i.variant, i.created_at
            FROM cache_items i
            JOIN cache_group_items m ON m.item_id = i.id
            WHERE m.group_id = ?1
            ORDER BY i.id
            "#,
        )
        .bind(group.id)
        .fetch_all(&mut self.conn)
        .await
    }

    /// Number of groups `item` belongs to
    pub async fn membership_count(
        &mut self,
        item: &CacheItem,
    ) -> std::result::Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_group_items WHERE item_id = ?1")
            .bind(item.id)
            .fetch_one(&mut self.conn)
            .await
    }

    /// Delete an item record and its memberships.
    ///
    /// The caller deletes the blob first.
    pub async fn delete_item(&mut self, item: &CacheItem) -> std::result::Result<(), sqlx::Error> {
        self.begin_if_needed().await?;
        sqlx::query("DELETE FROM cache_items WHERE id = ?1")
            .bind(item.id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Delete a group record and its memberships; member items are untouched
    pub async fn delete_group(
        &mut self,
        group: &CacheGroup,
    ) -> std::result::Result<(), sqlx::Error> {
        self.begin_if_needed().await?;
        sqlx::query("DELETE FROM cache_groups WHERE id = ?1")
            .bind(group.id)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Commit pending changes, if any.
    ///
    /// A failed commit is logged and the changes stay pending, so callers
    /// carry on as if it had succeeded and a later save can retry.
    pub async fn save(&mut self) -> bool {
        if !self.dirty {
            return true;
        }

        match sqlx::query("COMMIT").execute(&mut self.conn).await {
            Ok(_) => {
                self.dirty = false;
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to save metadata store");
                false
            }
        }
    }

    /// Roll back pending changes, if any
    pub async fn discard_changes(&mut self) {
        if !self.dirty {
            return;
        }

        match sqlx::query("ROLLBACK").execute(&mut self.conn).await {
            Ok(_) => self.dirty = false,
            Err(e) => warn!(error = %e, "Failed to roll back metadata store"),
        }
    }

    #[cfg(test)]
    pub(crate) fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn stats(&mut self) -> std::result::Result<StoreStats, sqlx::Error> {
        let items = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_items")
            .fetch_one(&mut self.conn)
            .await?;
        let groups = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_groups")
            .fetch_one(&mut self.conn)
            .await?;
        let memberships = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM cache_group_items")
            .fetch_one(&mut self.conn)
            .await?;

        Ok(StoreStats {
            items,
            groups,
            memberships,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: &str = "upload.wikimedia.org/wikipedia/commons||Example.jpg";

    #[tokio::test]
    async fn test_fetch_or_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.sqlite"))
            .await
            .unwrap();

        let (first, second, group_a, group_b) = store
            .perform(|ctx| {
                Box::pin(async move {
                    let first = ctx.fetch_or_create_item(KEY, 220).await.unwrap();
                    let second = ctx.fetch_or_create_item(KEY, 220).await.unwrap();
                    let group_a = ctx.fetch_or_create_group("article").await.unwrap();
                    let group_b = ctx.fetch_or_create_group("article").await.unwrap();
                    ctx.save().await;
                    (first, second, group_a, group_b)
                })
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.variant, 220);
        assert_eq!(group_a, group_b);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.groups, 1);
    }

    #[tokio::test]
    async fn test_variants_are_distinct_items() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.sqlite"))
            .await
            .unwrap();

        let (original, thumb) = store
            .perform(|ctx| {
                Box::pin(async move {
                    let original = ctx.fetch_or_create_item(KEY, 0).await.unwrap();
                    let thumb = ctx.fetch_or_create_item(KEY, 220).await.unwrap();
                    (original, thumb)
                })
            })
            .await
            .unwrap();

        assert_ne!(original.id, thumb.id);
    }

    #[tokio::test]
    async fn test_membership_counts_and_group_deletion() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.sqlite"))
            .await
            .unwrap();

        let (shared_count, after_delete, remaining_item, stats) = store
            .perform(|ctx| {
                Box::pin(async move {
                    let item = ctx.fetch_or_create_item(KEY, 0).await.unwrap();
                    let a = ctx.fetch_or_create_group("a").await.unwrap();
                    let b = ctx.fetch_or_create_group("b").await.unwrap();
                    ctx.link_item_to_group(&item, &a).await.unwrap();
                    ctx.link_item_to_group(&item, &a).await.unwrap();
                    ctx.link_item_to_group(&item, &b).await.unwrap();
                    let shared_count = ctx.membership_count(&item).await.unwrap();

                    ctx.delete_group(&a).await.unwrap();
                    let after_delete = ctx.membership_count(&item).await.unwrap();
                    let remaining_item = ctx.fetch_item(KEY, 0).await.unwrap();
                    ctx.save().await;
                    (shared_count, after_delete, remaining_item, ctx.stats().await.unwrap())
                })
            })
            .await
            .unwrap();

        assert_eq!(shared_count, 2);
        assert_eq!(after_delete, 1);
        assert!(remaining_item.is_some());
        assert_eq!(
            stats,
            StoreStats {
                items: 1,
                groups: 1,
                memberships: 1
            }
        );
    }

    #[tokio::test]
    async fn test_group_items_and_item_deletion() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.sqlite"))
            .await
            .unwrap();

        let (members, after) = store
            .perform(|ctx| {
                Box::pin(async move {
                    let group = ctx.fetch_or_create_group("article").await.unwrap();
                    for variant in [0, 220, 440] {
                        let item = ctx.fetch_or_create_item(KEY, variant).await.unwrap();
                        ctx.link_item_to_group(&item, &group).await.unwrap();
                    }
                    let members = ctx.group_items(&group).await.unwrap();
                    ctx.delete_item(&members[1]).await.unwrap();
                    ctx.unlink_item_from_group(&members[2], &group).await.unwrap();
                    let after = ctx.group_items(&group).await.unwrap();
                    (members, after)
                })
            })
            .await
            .unwrap();

        let variants: Vec<u32> = members.iter().map(|i| i.variant).collect();
        assert_eq!(variants, vec![0, 220, 440]);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].variant, 0);
    }

    #[tokio::test]
    async fn test_save_tracks_pending_changes() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.sqlite"))
            .await
            .unwrap();

        let (before, pending, saved, after) = store
            .perform(|ctx| {
                Box::pin(async move {
                    let before = ctx.has_changes();
                    ctx.fetch_or_create_group("article").await.unwrap();
                    let pending = ctx.has_changes();
                    let saved = ctx.save().await;
                    (before, pending, saved, ctx.has_changes())
                })
            })
            .await
            .unwrap();

        assert!(!before);
        assert!(pending);
        assert!(saved);
        assert!(!after);
    }

    #[tokio::test]
    async fn test_discarded_changes_are_not_saved() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("metadata.sqlite"))
            .await
            .unwrap();

        let pending = store
            .perform(|ctx| {
                Box::pin(async move {
                    ctx.fetch_or_create_item(KEY, 0).await.unwrap();
                    ctx.discard_changes().await;
                    let pending = ctx.has_changes();
                    ctx.save().await;
                    pending
                })
            })
            .await
            .unwrap();

        assert!(!pending);
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_saved_changes_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.sqlite");

        {
            let store = MetadataStore::open(&path).await.unwrap();
            store
                .perform(|ctx| {
                    Box::pin(async move {
                        let item = ctx.fetch_or_create_item(KEY, 0).await.unwrap();
                        let group = ctx.fetch_or_create_group("article").await.unwrap();
                        ctx.link_item_to_group(&item, &group).await.unwrap();
                        ctx.save().await;
                    })
                })
                .await
                .unwrap();
        }

        let reopened = MetadataStore::open(&path).await.unwrap();
        let stats = reopened.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                items: 1,
                groups: 1,
                memberships: 1
            }
        );
    }

    #[tokio::test]
    async fn test_corrupt_store_is_recreated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata.sqlite");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let store = MetadataStore::open(&path).await.unwrap();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_unrecoverable_store_is_unavailable() {
        let dir = tempdir().unwrap();
        // A directory can be neither opened as a database nor removed as a file
        let path = dir.path().join("metadata.sqlite");
        std::fs::create_dir(&path).unwrap();

        let result = MetadataStore::open(&path).await;
        assert!(matches!(result, Err(ImageCacheError::StoreUnavailable(_))));
    }
}
