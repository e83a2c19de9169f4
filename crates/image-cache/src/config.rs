use std::env;
use std::path::PathBuf;

const DEFAULT_MEMORY_COST_LIMIT: u64 = 64 * 1024 * 1024; // pixels
const DEFAULT_RESPONSE_MAX_SIZE: u64 = 256 * 1024 * 1024; // 256 MiB
const DEFAULT_RESPONSE_TTL_SECS: u64 = 24 * 60 * 60; // 24 hours

/// Image cache configuration, parsed from environment variables
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Storage root holding blobs, metadata, responses and downloads
    pub root: PathBuf,
    /// Total pixel count the in-memory image cache may hold
    pub memory_cost_limit: u64,
    pub response_max_size: u64,
    pub response_ttl_secs: u64,
    /// Concurrent low-priority requests allowed by the transport
    pub low_priority_concurrency: usize,
    pub request_timeout_secs: u64,
}

impl ImageCacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Parse configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let root = env::var("IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.root);

        Self {
            root,
            memory_cost_limit: parse_var("IMAGE_CACHE_MEMORY_COST_LIMIT")
                .unwrap_or(defaults.memory_cost_limit),
            response_max_size: parse_var("IMAGE_CACHE_RESPONSE_MAX_SIZE")
                .unwrap_or(defaults.response_max_size),
            response_ttl_secs: parse_var("IMAGE_CACHE_RESPONSE_TTL_SECS")
                .unwrap_or(defaults.response_ttl_secs),
            low_priority_concurrency: parse_var("IMAGE_CACHE_LOW_PRIORITY_CONCURRENCY")
                .unwrap_or(defaults.low_priority_concurrency),
            request_timeout_secs: parse_var("IMAGE_CACHE_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout_secs),
        }
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.sqlite")
    }

    pub fn response_dir(&self) -> PathBuf {
        self.root.join("responses")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./cache/images"),
            memory_cost_limit: DEFAULT_MEMORY_COST_LIMIT,
            response_max_size: DEFAULT_RESPONSE_MAX_SIZE,
            response_ttl_secs: DEFAULT_RESPONSE_TTL_SECS,
            low_priority_concurrency: 2,
            request_timeout_secs: 30,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
