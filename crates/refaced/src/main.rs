use anyhow::{Context, Result};
use reface_models::{ModelResourceManager, OnnxCapabilities};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{RefaceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("refaced starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        workers = config.workers,
        permits = config.inference_permits,
        token_timeout = ?config.token_timeout,
        preload = config.preload,
        bus = ?config.bus,
        path_root = ?config.path_root,
        "configuration loaded"
    );

    let locator = config.locator();
    let manager = Arc::new(ModelResourceManager::new(locator.clone(), config.manager_config()));
    let caps = Arc::new(OnnxCapabilities::new(manager, config.onnx_settings()));

    if config.preload {
        // Fail fast: a worker without its required models can only fail jobs.
        caps.preload_required().context("loading required models")?;
        caps.preload_optional();
    } else {
        tracing::info!("model preload disabled; models load on first use");
    }

    let engine = engine::spawn_engine(caps, config.workers, config.queue_depth)?;
    let path_root = match &config.path_root {
        Some(root) => Some(
            root.canonicalize()
                .with_context(|| format!("resolving path_root {}", root.display()))?,
        ),
        None => {
            if config.bus == BusKind::System {
                tracing::warn!("no path_root on the system bus: any peer can read and write any path the daemon can");
            }
            None
        }
    };
    let service = RefaceService {
        engine: engine.clone(),
        locator,
        path_root,
    };

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

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "refaced ready");

    tokio::signal::ctrl_c().await?;
    let cancelled = engine.cancel_all();
    tracing::info!(cancelled, "refaced shutting down");

    Ok(())
}
