//! Walkie-talkie host
//!
//! Listens on the well-known UDP port, relays every client's voice to every
//! other client and streams the local microphone to all of them.
//!
//! Usage: `host [--config PATH]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_walkie_talkie::{
    audio::{cpal_backend::list_input_routes, AudioBackend, CpalBackend, RouteMonitor},
    config::AppConfig,
    session::{Mode, SessionController},
};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

fn parse_args() -> Result<Option<PathBuf>> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unexpected argument '{}'\nusage: host [--config PATH]", other),
        }
    }
    Ok(config_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = parse_args()?;
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    tracing::info!("Starting walkie-talkie host on port {}", config.network.udp_port);
    for (name, route) in list_input_routes() {
        tracing::info!("  input: {} ({})", name, route);
    }

    let backend: Arc<dyn AudioBackend> = Arc::new(CpalBackend::new());
    let controller = SessionController::new(backend.clone(), config.clone());

    let monitor = RouteMonitor::new(backend, controller.route_trigger(), config.session.route_poll_interval());
    let monitor_handle = monitor.spawn();

    controller
        .start(Mode::Host, None)
        .await
        .context("starting host session")?;
    if let Some(addr) = controller.local_addr() {
        tracing::info!("Relay ready at {} - press Ctrl+C to stop", addr);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            _ = status.tick() => {
                tracing::info!("Connected peers: {}", controller.current_peer_count());
                if let Some(stats) = controller.playback_stats() {
                    tracing::info!(
                        "Playback: {} overflows, {} underruns",
                        stats.overflows,
                        stats.underruns
                    );
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!("Ctrl-C handler failed: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    controller.stop().await;
    monitor_handle.abort();
    Ok(())
}
