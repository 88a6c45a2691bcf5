//! voxbridge — SIP voice connector daemon
//!
//! Binds the switch event listener and the SIP backend, then serves calls
//! until interrupted. Which STT/TTS/responder services are wired in is a
//! deployment concern; without external services the built-in adapters keep
//! the media path fully functional for smoke testing.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxbridge_call_engine::adapters::{NullSttEngine, ToneTtsEngine};
use voxbridge_call_engine::{CallEngine, EngineConfig};
use voxbridge_media_core::EchoResponder;
use voxbridge_sip_core::{EventListener, EventListenerConfig, SipBackend, SipBackendConfig};

#[derive(Debug, Parser)]
#[command(name = "voxbridge", about = "SIP voice connector bridging a telephony switch with speech services")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path).context("loading configuration")?,
        None => {
            let mut config = EngineConfig::default();
            config.apply_env();
            config
        }
    };
    config.validate().context("validating configuration")?;

    info!(
        event_port = config.sip.event_port,
        sip_port = config.sip.sip_port,
        rtp_ports = ?(config.rtp.min_port, config.rtp.max_port),
        "voxbridge starting"
    );

    let engine = CallEngine::new(
        config.clone(),
        Arc::new(NullSttEngine),
        Arc::new(ToneTtsEngine::default()),
        Arc::new(EchoResponder),
    );

    let (events_tx, events_rx) = mpsc::channel(256);

    let event_listener = EventListener::bind(
        EventListenerConfig {
            bind_addr: SocketAddr::new(config.sip.event_ip, config.sip.event_port),
            ..Default::default()
        },
        events_tx,
        engine.shutdown_signal(),
    )
    .await
    .context("binding event listener")?;

    let backend = SipBackend::bind(
        SipBackendConfig {
            bind_addr: SocketAddr::new(config.sip.sip_ip, config.sip.sip_port),
            advertised_host: config.sip.advertised_ip.clone(),
            service_user: config.sip.service_user.clone(),
            ..Default::default()
        },
        engine.clone(),
        engine.shutdown_signal(),
    )
    .await
    .context("binding SIP backend")?;

    let listener_task = event_listener.spawn();
    let backend_task = backend.spawn();
    let engine_task = engine.start(events_rx);

    info!("voxbridge up, waiting for calls");
    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received, shutting down");

    engine.shutdown().await;
    let _ = engine_task.await;
    let _ = listener_task.await;
    let _ = backend_task.await;

    info!("voxbridge stopped");
    Ok(())
}
