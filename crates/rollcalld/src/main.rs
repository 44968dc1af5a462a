use anyhow::{Context, Result};
use rollcall_core::OnnxFaceExtractor;
use rollcall_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod enrollment;
mod error;
mod recorder;
mod registry;
mod report;
mod session;
mod unknowns;

#[cfg(test)]
mod test_support;

use config::{BusKind, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        unknown_dir = %config.unknown_dir.display(),
        match_threshold = config.match_threshold,
        min_confidence = config.min_confidence,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    // Models load once here; a daemon that cannot extract does not start.
    let extractor = OnnxFaceExtractor::load(&config.model_dir, config.embedding_dim)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(extractor)?;

    let service = RollcallService::new(&config, store, engine);
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
