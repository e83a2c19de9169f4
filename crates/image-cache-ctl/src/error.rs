//! Error types for the image cache command line

use std::fmt;

#[derive(Debug)]
pub enum CtlError {
    Cache(image_cache::ImageCacheError),
    Transport(image_cache::TransportError),
    Io(Box<std::io::Error>),
    Json(serde_json::Error),
    Config(String),
}

impl fmt::Display for CtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlError::Cache(err) => write!(f, "Image cache error: {}", err),
            CtlError::Transport(err) => write!(f, "Transport error: {}", err),
            CtlError::Io(err) => write!(f, "IO error: {}", err),
            CtlError::Json(err) => write!(f, "JSON error: {}", err),
            CtlError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for CtlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CtlError::Cache(err) => Some(err),
            CtlError::Transport(err) => Some(err),
            CtlError::Io(err) => Some(err.as_ref()),
            CtlError::Json(err) => Some(err),
            CtlError::Config(_) => None,
        }
    }
}

impl From<image_cache::ImageCacheError> for CtlError {
    fn from(err: image_cache::ImageCacheError) -> Self {
        CtlError::Cache(err)
    }
}

impl From<image_cache::TransportError> for CtlError {
    fn from(err: image_cache::TransportError) -> Self {
        CtlError::Transport(err)
    }
}

impl From<std::io::Error> for CtlError {
    fn from(err: std::io::Error) -> Self {
        CtlError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CtlError {
    fn from(err: serde_json::Error) -> Self {
        CtlError::Json(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for CtlError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        CtlError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CtlError>;
