//! Error types for the image cache

use std::fmt;
use std::sync::Arc;

/// Errors from the HTTP transport
#[derive(Debug)]
pub enum TransportError {
    Http(reqwest::Error),
    Status(u16),
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Http(err) => write!(f, "HTTP error: {}", err),
            TransportError::Status(status) => write!(f, "Server returned status {}", status),
            TransportError::Io(err) => write!(f, "Download IO error: {}", err),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Http(err) => Some(err),
            TransportError::Io(err) => Some(err),
            TransportError::Status(_) => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Http(err)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err)
    }
}

/// Errors surfaced to image cache callers.
///
/// One result is fanned out to every waiter of a coalesced request, so the
/// error is `Clone` and keeps non-clonable sources behind `Arc`.
#[derive(Debug, Clone)]
pub enum ImageCacheError {
    /// No cached bytes exist for the URL
    DataNotFound,
    /// The URL was missing or empty
    InvalidOrEmptyUrl,
    /// Cache item or group records could not be created after a download
    InvalidImageCache,
    /// The transport produced no usable payload
    InvalidResponse,
    /// Reserved for rejecting duplicate requests
    DuplicateRequest,
    /// The controller was dropped before the operation finished
    ControllerDeinitialized,
    /// The request was cancelled before it produced a result
    Cancelled,
    Transport(Arc<TransportError>),
    Io(Arc<std::io::Error>),
    Metadata(Arc<sqlx::Error>),
    Decode(Arc<image::ImageError>),
    /// The metadata store could not be opened, even after recreating it
    StoreUnavailable(String),
}

impl fmt::Display for ImageCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageCacheError::DataNotFound => write!(f, "No cached data found"),
            ImageCacheError::InvalidOrEmptyUrl => write!(f, "Invalid or empty URL"),
            ImageCacheError::InvalidImageCache => write!(f, "Invalid image cache"),
            ImageCacheError::InvalidResponse => write!(f, "Invalid response"),
            ImageCacheError::DuplicateRequest => write!(f, "Duplicate request"),
            ImageCacheError::ControllerDeinitialized => {
                write!(f, "Image cache controller was deinitialized")
            }
            ImageCacheError::Cancelled => write!(f, "Request cancelled"),
            ImageCacheError::Transport(err) => write!(f, "Transport error: {}", err),
            ImageCacheError::Io(err) => write!(f, "IO error: {}", err),
            ImageCacheError::Metadata(err) => write!(f, "Metadata store error: {}", err),
            ImageCacheError::Decode(err) => write!(f, "Image decode error: {}", err),
            ImageCacheError::StoreUnavailable(msg) => {
                write!(f, "Metadata store unavailable: {}", msg)
            }
        }
    }
}

impl std::error::Error for ImageCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageCacheError::Transport(err) => Some(err.as_ref()),
            ImageCacheError::Io(err) => Some(err.as_ref()),
            ImageCacheError::Metadata(err) => Some(err.as_ref()),
            ImageCacheError::Decode(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for ImageCacheError {
    fn from(err: TransportError) -> Self {
        ImageCacheError::Transport(Arc::new(err))
    }
}

impl From<std::io::Error> for ImageCacheError {
    fn from(err: std::io::Error) -> Self {
        ImageCacheError::Io(Arc::new(err))
    }
}

impl From<sqlx::Error> for ImageCacheError {
    fn from(err: sqlx::Error) -> Self {
        ImageCacheError::Metadata(Arc::new(err))
    }
}

impl From<image::ImageError> for ImageCacheError {
    fn from(err: image::ImageError) -> Self {
        ImageCacheError::Decode(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ImageCacheError>;
