//! File-backed storage for permanently cached image bytes
//!
//! One file per `(key, variant)`, named after the coalescing identifier, with
//! the MIME type kept as a file attribute.

use crate::attributes::AttributeStore;
use bytes::Bytes;
use image_cache_key::ImageCacheKey;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub const MIME_TYPE_ATTRIBUTE: &str = "user.image-cache.mime-type";

/// Encoded identifiers longer than this are hashed instead
const MAX_FILE_NAME_LEN: usize = 200;

/// Blob files under one directory
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    attributes: Arc<dyn AttributeStore>,
    reads: Arc<AtomicU64>,
}

impl BlobStore {
    pub fn new(root: PathBuf, attributes: Arc<dyn AttributeStore>) -> Self {
        Self {
            root,
            attributes,
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ensure the blob directory exists
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        info!(blob_dir = ?self.root, "Blob store initialized");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic file path for an image
    pub fn path_for(&self, key: &ImageCacheKey) -> PathBuf {
        self.root.join(file_name(&key.identifier()))
    }

    pub async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data).await?;
        debug!(path = ?path, size = data.len(), "Wrote blob");
        Ok(())
    }

    /// Move a downloaded file into place without copying its contents
    pub async fn move_into(&self, temp: &Path, path: &Path) -> io::Result<()> {
        if let Err(rename_err) = fs::rename(temp, path).await {
            // Downloads spooled on another filesystem can't be renamed
            if fs::copy(temp, path).await.is_err() {
                return Err(rename_err);
            }
            fs::remove_file(temp).await?;
        }
        debug!(from = ?temp, to = ?path, "Moved download into blob store");
        Ok(())
    }

    /// Read a blob; a missing file is `None`
    pub async fn read(&self, path: &Path) -> Option<Bytes> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match fs::read(path).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read blob");
                None
            }
        }
    }

    /// Delete a blob and its attributes; a missing file is not an error
    pub async fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        self.attributes.remove_attributes(path).await?;
        debug!(path = ?path, "Deleted blob");
        Ok(())
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn set_mime_type(&self, path: &Path, mime_type: &str) -> io::Result<()> {
        self.attributes
            .set_attribute(path, MIME_TYPE_ATTRIBUTE, mime_type)
            .await
    }

    pub async fn mime_type(&self, path: &Path) -> Option<String> {
        match self.attributes.attribute(path, MIME_TYPE_ATTRIBUTE).await {
            Ok(mime_type) => mime_type,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read MIME type attribute");
                None
            }
        }
    }

    /// Number of blob reads attempted so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

fn file_name(identifier: &str) -> String {
    let encoded = urlencoding::encode(identifier);
    if encoded.len() <= MAX_FILE_NAME_LEN {
        return encoded.into_owned();
    }

    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::SidecarAttributes;
    use tempfile::tempdir;

    fn new_store(dir: &Path) -> BlobStore {
        BlobStore::new(dir.to_path_buf(), Arc::new(SidecarAttributes))
    }

    fn key(url: &str) -> ImageCacheKey {
        ImageCacheKey::from_url(url)
    }

    #[test]
    fn test_file_name_is_encoded_identifier() {
        let name = file_name("upload.wikimedia.org/wikipedia/commons||Example.jpg||220");
        assert_eq!(
            name,
            "upload.wikimedia.org%2Fwikipedia%2Fcommons%7C%7CExample.jpg%7C%7C220"
        );
    }

    #[test]
    fn test_long_identifier_is_hashed() {
        let identifier = format!("https://example.com/{}||0", "a".repeat(300));
        let name = file_name(&identifier);
        assert_eq!(name.len(), 64);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_path_is_deterministic() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        let url = "https://upload.wikimedia.org/wikipedia/commons/a/a9/Example.jpg";
        assert_eq!(store.path_for(&key(url)), store.path_for(&key(url)));
        assert!(store.path_for(&key(url)).starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        store.init().await.unwrap();
        let path = store.path_for(&key("https://example.com/a.png"));

        store.write(&path, b"png").await.unwrap();
        store.set_mime_type(&path, "image/png").await.unwrap();
        assert_eq!(store.read(&path).await.as_deref(), Some(&b"png"[..]));
        assert_eq!(store.mime_type(&path).await.as_deref(), Some("image/png"));

        store.delete(&path).await.unwrap();
        assert!(store.read(&path).await.is_none());
        assert!(store.mime_type(&path).await.is_none());
        assert!(!SidecarAttributes::sidecar_path(&path).exists());

        // Deleting again is fine
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_move_into_takes_the_file() {
        let dir = tempdir().unwrap();
        let store = new_store(&dir.path().join("images"));
        store.init().await.unwrap();

        let temp = dir.path().join("download.tmp");
        std::fs::write(&temp, b"jpeg").unwrap();
        let path = store.path_for(&key("https://example.com/b.jpg"));

        store.move_into(&temp, &path).await.unwrap();
        assert!(!temp.exists());
        assert!(store.exists(&path).await);
        assert_eq!(store.read(&path).await.as_deref(), Some(&b"jpeg"[..]));
    }

    #[tokio::test]
    async fn test_read_count_tracks_disk_access() {
        let dir = tempdir().unwrap();
        let store = new_store(dir.path());
        let path = store.path_for(&key("https://example.com/c.gif"));

        assert_eq!(store.read_count(), 0);
        store.read(&path).await;
        store.read(&path).await;
        assert_eq!(store.read_count(), 2);
    }
}
