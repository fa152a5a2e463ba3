mod actuator;
mod config;
mod decision;
mod error;
mod fuzzy;
mod link;
mod payload;
mod rack;
mod state;
mod web;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use decision::DecisionEngine;
use link::MqttLink;
use rack::RackCore;
use state::HubState;

fn main() -> Result<()> {
    // Before the runtime starts any threads.
    let offset = payload::capture_local_offset();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match offset {
        Some(offset) => info!(%offset, "local clock offset"),
        None => warn!("local clock offset unknown, fallback timestamps use UTC"),
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(run())
}

async fn run() -> Result<()> {
    // ── Config ──────────────────────────────────────────────────────
    let cfg = config::from_env()?;
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        telemetry = %cfg.topics.telemetry,
        control = %cfg.topics.control,
        status = %cfg.topics.status,
        "config loaded"
    );

    // ── Decision engine (immutable, shared) ─────────────────────────
    let engine = Arc::new(DecisionEngine::drying_rack().context("fuzzy model is invalid")?);
    info!(rules = engine.model().rules.len(), "fuzzy system ready");

    // ── Shared state ────────────────────────────────────────────────
    let hub = Arc::new(HubState::new());
    hub.record_system("hub started".to_string());

    let cancel = CancellationToken::new();

    // ── MQTT link ───────────────────────────────────────────────────
    let (link, driver) = MqttLink::new(&cfg, Arc::clone(&hub), cancel.child_token());
    let link = Arc::new(link);
    let driver_task = tokio::spawn(driver.run());

    // ── Core + web ──────────────────────────────────────────────────
    let actuator = Arc::new(Actuator::new(
        Arc::clone(&link),
        cfg.actuator.actuator_config(),
        cancel.child_token(),
    ));
    let core = Arc::new(RackCore::new(hub, engine, actuator, link));
    let web_task = tokio::spawn(web::serve(core, cfg.web.port, cancel.child_token()));

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            res.context("failed to listen for ctrl-c")
        }
        // The server only returns early on error.
        res = web_task => match res {
            Ok(r) => r,
            Err(e) => Err(e).context("web server task failed"),
        },
    };

    cancel.cancel();
    if let Err(e) = driver_task.await {
        error!("link driver task failed: {e}");
    }
    info!("hub stopped");
    outcome
}
