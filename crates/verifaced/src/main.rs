use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod dbus_interface;
mod engine;
mod rate_limiter;

use config::Config;
use dbus_interface::{AppState, VerifaceService};
use rate_limiter::RateLimiter;
use veriface_store::IdentityStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("verifaced starting");

    let config = Config::from_env();
    if !config.field_secret_from_env {
        tracing::warn!("VERIFACE_FIELD_SECRET not set; using the insecure development secret");
    }
    let session_bus = config.session_bus;

    let store = IdentityStore::open(&config.db_path, &config.field_secret)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    tracing::info!(db = %config.db_path.display(), "identity store opened");

    // Fail fast: no capture backend means no daemon
    let (sensor, analyzer) = backend::load_backends(config.replay_dir.as_deref())?;
    let engine = engine::spawn_engine(sensor, analyzer);

    let rate_limiter = RateLimiter::new(config.lockout_policy());
    let state = Arc::new(Mutex::new(AppState {
        config,
        engine,
        store,
        rate_limiter,
    }));
    let service = VerifaceService { state };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name("org.veriface.Verify1")?
        .serve_at("/org/veriface/Verify1", service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(session_bus, "verifaced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("verifaced shutting down");

    Ok(())
}
