//! Per-file key/value attributes
//!
//! Stands in for extended file attributes. The default store keeps a small
//! JSON map next to each file, `<file>.attrs`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Key/value attributes attached to a file
#[async_trait]
pub trait AttributeStore: Send + Sync {
    async fn set_attribute(&self, path: &Path, name: &str, value: &str) -> io::Result<()>;

    async fn attribute(&self, path: &Path, name: &str) -> io::Result<Option<String>>;

    /// Drop every attribute of `path`
    async fn remove_attributes(&self, path: &Path) -> io::Result<()>;
}

/// Attributes kept in a JSON sidecar file
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarAttributes;

impl SidecarAttributes {
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(".attrs");
        PathBuf::from(name)
    }

    async fn load(path: &Path) -> io::Result<BTreeMap<String, String>> {
        match fs::read(Self::sidecar_path(path)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AttributeStore for SidecarAttributes {
    async fn set_attribute(&self, path: &Path, name: &str, value: &str) -> io::Result<()> {
        let mut attributes = Self::load(path).await?;
        attributes.insert(name.to_string(), value.to_string());
        let raw = serde_json::to_vec(&attributes)?;
        fs::write(Self::sidecar_path(path), raw).await
    }

    async fn attribute(&self, path: &Path, name: &str) -> io::Result<Option<String>> {
        Ok(Self::load(path).await?.remove(name))
    }

    async fn remove_attributes(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(Self::sidecar_path(path)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
