//! Vigil ingest service.
//!
//! Replays a detection feed through the frame-cadence pipeline and writes
//! one detection event per non-empty processed frame to the event store.
//!
//! # Architecture
//!
//! ```text
//! DetectionFeedSource -> Pipeline -> PersistHandle -> EventStore
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/ingest.toml, /etc/vigil/ingest.toml)
//! 2. Environment variables (prefixed with INGEST_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vigil_ingest::config::{IngestConfig, LoggingConfig};
use vigil_ingest::{
    connect_with_retry, DetectionFeedSource, FeedDetector, Pipeline, PipelineSettings,
    StoreMode, VideoSource,
};
use vigil_storage::EventStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "vigil-ingest",
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source.url,
        "Starting ingest service"
    );

    // Validate configuration
    config.validate()?;

    let source = DetectionFeedSource::open(&config.source)
        .await
        .context("Failed to open video source")?;
    let detector = FeedDetector::new(config.detector.confidence_threshold);

    let info = source.info();
    info!(
        source_id = %config.source.source_id(),
        stream = %info,
        total_frames = ?info.total_frames,
        frame_skip = config.processing.frame_skip,
        confidence_threshold = config.detector.confidence_threshold,
        target_classes = ?config.processing.target_classes,
        "Video source opened"
    );

    let store = connect_store(&config).await;
    let connected = match &store {
        StoreMode::Connected(store) => Some(Arc::clone(store)),
        _ => None,
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Received shutdown signal, stopping pipeline");
            shutdown.cancel();
        }
    });

    let pipeline = Pipeline::new(source, detector, PipelineSettings::from_config(&config), store);
    let result = pipeline.run(shutdown).await;

    // The store is released on every exit path
    if let Some(store) = connected {
        close_store(store.as_ref()).await;
    }

    match result {
        Ok(summary) => {
            println!("{}", summary);
            info!("Ingest service completed successfully");
            Ok(())
        }
        Err(e) => {
            println!("{}", e.summary());
            error!(error = %e, "Ingest service failed");
            Err(e.into())
        }
    }
}

/// Load configuration from files, falling back to the environment.
fn load_config() -> anyhow::Result<IngestConfig> {
    let config = IngestConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        IngestConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("vigil_ingest={}", level).parse()?)
        .add_directive(format!("vigil_storage={}", level).parse()?)
        .add_directive("sqlx=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Connect to the event store if persistence is enabled. A failed connection
/// degrades the run instead of aborting it.
async fn connect_store(config: &IngestConfig) -> StoreMode {
    if !config.persistence.enabled {
        info!("Persistence disabled, detection events will not be stored");
        return StoreMode::Disabled;
    }

    let database = &config.persistence.database;
    match connect_with_retry(database, config.persistence.connect_attempts).await {
        Ok(store) => {
            info!(
                database = %database.database_name(),
                table = %database.table,
                "Connected to event store"
            );
            StoreMode::Connected(store)
        }
        Err(e) => {
            warn!(error = %e, "Event store unreachable, continuing without persistence");
            StoreMode::Unavailable(e.to_string())
        }
    }
}

async fn close_store(store: &dyn EventStore) {
    store.close().await;
    info!("Event store connection closed");
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
