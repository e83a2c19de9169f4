//! Network access for the image cache
//!
//! The controller only talks to the [`Transport`] and [`TransportCache`]
//! traits. [`ReqwestTransport`] is the production implementation; it records
//! successful fetches in an [`http_response_cache::ResponseCache`] and answers
//! later fetches from it, so that cache is also the session-level tier.

use crate::config::ImageCacheConfig;
use crate::error::TransportError;
use crate::types::Priority;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_response_cache::{CachedResponse, ResponseCache};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("image-cache/", env!("CARGO_PKG_VERSION"));

/// A response body held in memory
#[derive(Debug, Clone)]
pub struct Fetched {
    pub data: Bytes,
    pub mime_type: Option<String>,
}

/// A response body spooled to a temporary file the caller now owns
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub mime_type: Option<String>,
    pub len: u64,
}

/// Fetches remote resources.
///
/// Dropping the returned future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str, priority: Priority) -> Result<Fetched, TransportError>;

    async fn download(&self, url: &str, priority: Priority) -> Result<Download, TransportError>;
}

/// Responses the transport has kept for the current session
#[async_trait]
pub trait TransportCache: Send + Sync {
    async fn lookup(&self, url: &str) -> Option<CachedResponse>;

    async fn clear_all(&self);
}

#[async_trait]
impl TransportCache for ResponseCache {
    async fn lookup(&self, url: &str) -> Option<CachedResponse> {
        self.get(url).await
    }

    async fn clear_all(&self) {
        self.clear().await;
    }
}

/// HTTP transport backed by reqwest
pub struct ReqwestTransport {
    client: Client,
    responses: Arc<ResponseCache>,
    low_priority: Semaphore,
    download_dir: PathBuf,
}

impl ReqwestTransport {
    pub fn new(
        config: &ImageCacheConfig,
        responses: Arc<ResponseCache>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            responses,
            low_priority: Semaphore::new(config.low_priority_concurrency.max(1)),
            download_dir: config.download_dir(),
        })
    }

    /// Create the download directory and remove downloads abandoned by a
    /// previous process
    pub async fn init(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.download_dir).await?;

        let mut swept = 0usize;
        let mut dir = tokio::fs::read_dir(&self.download_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                discard(&entry.path()).await;
                swept += 1;
            }
        }

        info!(download_dir = ?self.download_dir, swept, "Transport initialized");
        Ok(())
    }

    /// The response cache successful fetches are written to
    pub fn responses(&self) -> &Arc<ResponseCache> {
        &self.responses
    }

    /// Send a GET, holding a low-priority permit for the life of the response
    async fn send(
        &self,
        url: &str,
        priority: Priority,
    ) -> Result<(Response, Option<SemaphorePermit<'_>>), TransportError> {
        let permit = match priority {
            Priority::Low => self.low_priority.acquire().await.ok(),
            Priority::Normal | Priority::High => None,
        };

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(url = %url, status = status.as_u16(), "Request failed");
            return Err(TransportError::Status(status.as_u16()));
        }

        Ok((response, permit))
    }
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, url: &str, priority: Priority) -> Result<Fetched, TransportError> {
        if let Some(cached) = self.responses.get(url).await {
            debug!(url = %url, size = cached.data.len(), "Served from response cache");
            return Ok(Fetched {
                data: cached.data,
                mime_type: cached.content_type,
            });
        }

        let (response, _permit) = self.send(url, priority).await?;
        let mime_type = content_type(&response);
        let data = response.bytes().await?;

        if let Err(e) = self.responses.put(url, &data, mime_type.as_deref()).await {
            warn!(url = %url, error = %e, "Failed to store response");
        }

        debug!(url = %url, size = data.len(), ?priority, "Fetched");
        Ok(Fetched { data, mime_type })
    }

    async fn download(&self, url: &str, priority: Priority) -> Result<Download, TransportError> {
        let (response, _permit) = self.send(url, priority).await?;
        let mime_type = content_type(&response);

        tokio::fs::create_dir_all(&self.download_dir).await?;
        // Until it is kept, dropping `temp` (on error or cancellation) removes the file
        let temp = tempfile::Builder::new()
            .prefix("download-")
            .tempfile_in(&self.download_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        let len = spool(response, &mut file).await?;
        drop(file);

        let path = temp.into_temp_path().keep().map_err(io::Error::from)?;
        debug!(url = %url, path = ?path, size = len, ?priority, "Downloaded");
        Ok(Download {
            path,
            mime_type,
            len,
        })
    }
}

async fn spool(response: Response, file: &mut tokio::fs::File) -> Result<u64, TransportError> {
    let mut stream = response.bytes_stream();
    let mut len = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        len += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(len)
}

/// Remove a spooled download that will not be used
pub(crate) async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove download");
        }
    }
}
