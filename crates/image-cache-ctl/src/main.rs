//! Image cache command line
//!
//! Permanently caches images under a group, removes groups, and inspects
//! what each cache tier holds. Storage and transport settings come from the
//! `IMAGE_CACHE_*` environment variables.

mod error;

use crate::error::Result;
use clap::{Parser, Subcommand, ValueEnum};
use http_response_cache::ResponseCache;
use image_cache::{ImageCacheConfig, ImageCacheController, Priority, ReqwestTransport};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "image-cache-ctl", about = "Manage the image cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Permanently cache images under a group
    Cache {
        #[arg(long)]
        group: String,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Remove a group and every image only it owns
    Remove {
        #[arg(long)]
        group: String,
    },
    /// Fetch and decode an image from the network
    Fetch {
        url: String,
        #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
        priority: PriorityArg,
    },
    /// Show what the cache holds for a URL
    Show { url: String },
    /// Clear the temporary response cache
    ClearTemporary,
    /// Print cache statistics as JSON
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PriorityArg {
    Low,
    Normal,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Debug, Serialize)]
struct ShowReport {
    url: String,
    identifier: String,
    mime_type: Option<String>,
    size: Option<usize>,
    permanent: bool,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatsReport {
    metadata: image_cache::StoreStats,
    responses: http_response_cache::CacheStats,
    memory_cost: u64,
}

/// Crates whose info-level logs are shown unless `RUST_LOG` says otherwise
const LOG_DIRECTIVES: [&str; 3] = [
    "image_cache_ctl=info",
    "image_cache=info",
    "http_response_cache=info",
];

fn log_filter(base: EnvFilter) -> Result<EnvFilter> {
    LOG_DIRECTIVES
        .iter()
        .try_fold(base, |filter, directive| Ok(filter.add_directive(directive.parse()?)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = log_filter(EnvFilter::from_default_env())?;

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let cli = Cli::parse();
    let config = ImageCacheConfig::from_env();
    info!("Cache dir: {:?}", config.root);
    info!(
        "Max response cache size: {} MB",
        config.response_max_size / (1024 * 1024)
    );

    let responses = Arc::new(ResponseCache::new(
        config.response_dir(),
        config.response_max_size,
        config.response_ttl_secs,
    ));
    responses.init().await?;

    let transport = Arc::new(ReqwestTransport::new(&config, Arc::clone(&responses))?);
    transport.init().await?;

    let controller =
        ImageCacheController::open(&config, transport, responses.clone()).await?;

    run(cli.command, &controller, &responses).await
}

async fn run(
    command: Command,
    controller: &ImageCacheController,
    responses: &ResponseCache,
) -> Result<()> {
    match command {
        Command::Cache { group, urls } => {
            controller
                .permanently_cache_in_background(&urls[..], &group)
                .await?;
            info!(group = %group, count = urls.len(), "Cached images");
        }
        Command::Remove { group } => {
            controller.remove_permanently_cached_images(&group).await?;
        }
        Command::Fetch { url, priority } => {
            let image = controller.fetch_image(Some(&url), priority.into()).await?;
            println!("{}x{}", image.width(), image.height());
        }
        Command::Show { url } => {
            let report = show(controller, &url).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::ClearTemporary => {
            controller.delete_temporary_cache().await;
        }
        Command::Stats => {
            let report = StatsReport {
                metadata: controller.metadata_stats().await?,
                responses: responses.stats().await,
                memory_cost: controller.memory_cost().await,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn show(controller: &ImageCacheController, url: &str) -> ShowReport {
    let data = controller.data(url).await.ok();
    let image = controller.cached_image(url).await;

    ShowReport {
        url: url.to_string(),
        identifier: image_cache::ImageCacheKey::from_url(url).identifier(),
        mime_type: data.as_ref().and_then(|d| d.mime_type.clone()),
        size: data.as_ref().map(|d| d.data.len()),
        permanent: controller.permanently_cached_data(url).await.is_some(),
        width: image.as_ref().map(|i| i.width()),
        height: image.as_ref().map(|i| i.height()),
    }
}
