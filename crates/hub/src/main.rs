use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use greenhouse_hub::api::HttpBackend;
use greenhouse_hub::config;
use greenhouse_hub::core::SyncCore;
use greenhouse_hub::web;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let context = cfg.monitored_context()?;

    // ── Backend client ──────────────────────────────────────────────
    let backend = HttpBackend::new(&cfg.backend.base_url, cfg.backend.request_timeout())
        .context("failed to build backend client")?;
    info!(
        backend = %backend.base_url(),
        greenhouse = %context.greenhouse_id,
        farm = %context.farm_id,
        "hub starting"
    );

    // ── Sync engine ─────────────────────────────────────────────────
    let core = SyncCore::start(&cfg, context, Arc::new(backend));

    // ── Status API (runs until ctrl-c) ──────────────────────────────
    let result = web::serve(core.clone(), cfg.web.port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
    })
    .await;

    core.dispose();
    result
}
