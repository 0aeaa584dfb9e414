//! Walkie-talkie client
//!
//! Streams the microphone to a host and plays whatever the host relays back.
//!
//! Usage: `client <ADDRESS> [--config PATH]`, where ADDRESS is `host` or
//! `host:port`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_walkie_talkie::{
    audio::{AudioBackend, CpalBackend, RouteMonitor},
    config::AppConfig,
    session::{Mode, SessionController},
};

const USAGE: &str = "usage: client <ADDRESS> [--config PATH]";
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

struct Args {
    address: String,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut address = None;
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => anyhow::bail!("unknown option '{}'\n{}", flag, USAGE),
            other if address.is_none() => address = Some(other.to_string()),
            other => anyhow::bail!("unexpected argument '{}'\n{}", other, USAGE),
        }
    }

    Ok(Args {
        address: address.context(USAGE)?,
        config_path,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    let config = AppConfig::load(args.config_path.as_deref()).context("loading configuration")?;

    tracing::info!("Starting walkie-talkie client for {}", args.address);

    let backend: Arc<dyn AudioBackend> = Arc::new(CpalBackend::new());
    let controller = SessionController::new(backend.clone(), config.clone());
    let monitor_handle =
        RouteMonitor::new(backend, controller.route_trigger(), config.session.route_poll_interval()).spawn();

    controller
        .start(Mode::Client, Some(&args.address))
        .await
        .with_context(|| format!("connecting to {}", args.address))?;
    tracing::info!("Talking - press Ctrl+C to stop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    loop {
        tokio::select! {
            _ = status.tick() => {
                let stats = controller.playback_stats().unwrap_or_default();
                tracing::info!(
                    "Session {}: {} playback overflows, {} underruns",
                    controller.mode(),
                    stats.overflows,
                    stats.underruns
                );
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
