//! Recorder upload server – receives recordings over HTTP, writes them to
//! the videos directory and records their location in MongoDB.
//!
//! This binary:
//! 1. Reads configuration from `recorder.conf`
//! 2. Ensures the videos directory exists (fatal if it cannot be created)
//! 3. Creates the pooled MongoDB client
//! 4. Runs the axum HTTP server until Ctrl-C, then closes the pool.

mod error;
mod server;
mod storage;
mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use recorder_common::config::{self, Config};

use crate::server::AppState;
use crate::storage::VideoDir;
use crate::store::MongoStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = Config::path_from_env();
    let config = config::load(&config_path).context("Config load failed")?;

    info!("Upload server starting (listen={})", config.listen_addr);

    let videos = VideoDir::ensure(&config.videos_dir)?;

    let store = Arc::new(
        MongoStore::connect(
            &config.mongo_uri,
            &config.mongo_database,
            &config.mongo_collection,
        )
        .await?,
    );

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── serve ────────────────────────────────────────────────────────
    let state = AppState::new(videos, store.clone());
    let result = server::run(state, &config, shutdown).await;

    store.shutdown().await;
    info!("Upload server stopped");

    result
}
