//! Host role: relay every peer's voice to every other peer and mix in the
//! local microphone.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::audio::{AudioBackend, AudioDevice, AudioFrame};
use crate::config::AppConfig;
use crate::error::{AudioError, Error, Result, SessionError};
use crate::network::{PeerSet, RelayTransport, Transport};
use crate::session::{
    capture, close_device, close_device_detached, join_loop, Lifecycle, LoopTiming, SessionState, LOG_EVERY_FRAMES,
};

struct RelayRuntime {
    transport: Arc<RelayTransport>,
    device: Arc<AudioDevice>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RelayRuntime {
    /// Synchronous teardown for drop paths
    fn abort_now(self) {
        self.transport.close();
        for (_, task) in &self.tasks {
            task.abort();
        }
        close_device_detached(self.device);
    }
}

/// Relay session bound to the well-known port
pub struct RelaySession {
    backend: Arc<dyn AudioBackend>,
    config: AppConfig,
    peers: Arc<PeerSet>,
    lifecycle: Lifecycle,
    runtime: Mutex<Option<RelayRuntime>>,
}

impl RelaySession {
    pub fn new(backend: Arc<dyn AudioBackend>, config: AppConfig) -> Self {
        let peers = Arc::new(PeerSet::with_idle_timeout(config.relay.peer_idle_timeout()));
        Self {
            backend,
            config,
            peers,
            lifecycle: Lifecycle::new(),
            runtime: Mutex::new(None),
        }
    }

    /// Bind the relay port, open the audio device and spawn both loops.
    ///
    /// A bind or device failure releases whatever was acquired and leaves the
    /// session stopped.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.claim_start()?;

        let transport = match RelayTransport::bind(
            self.config.network.relay_bind_addr(),
            &self.config.network,
            self.peers.clone(),
        )
        .await
        {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::error!("Failed to bind relay: {}", e);
                self.lifecycle.enter_stopped();
                return Err(e.into());
            }
        };

        let backend = self.backend.clone();
        let audio_config = self.config.audio.clone();
        let opened = tokio::task::spawn_blocking(move || AudioDevice::open(backend, &audio_config)).await;
        let device = match opened {
            Ok(Ok(device)) => Arc::new(device),
            Ok(Err(e)) => {
                tracing::error!("Failed to open audio device: {}", e);
                transport.close();
                self.lifecycle.enter_stopped();
                return Err(e.into());
            }
            Err(e) => {
                transport.close();
                self.lifecycle.enter_stopped();
                return Err(Error::Audio(AudioError::StreamError(e.to_string())));
            }
        };

        let running = self.lifecycle.running_flag();
        running.store(true, Ordering::SeqCst);

        let inbound = tokio::spawn(inbound_loop(transport.clone(), device.clone(), running.clone()));
        let outbound = tokio::spawn(capture_loop(
            transport.clone(),
            device.clone(),
            running,
            LoopTiming::from(&self.config.audio),
            self.config.relay.eviction_sweep_interval(),
        ));

        let runtime = RelayRuntime {
            transport,
            device,
            tasks: vec![("relay inbound", inbound), ("relay capture", outbound)],
        };

        if !self.lifecycle.enter_running() {
            // stop() ran while we were starting
            runtime.abort_now();
            return Err(SessionError::CannotStart(SessionState::Stopped).into());
        }
        *self.runtime.lock() = Some(runtime);
        tracing::info!("Relay session started");
        Ok(())
    }

    /// Stop both loops and release the socket and the audio device.
    ///
    /// Returns once both loops have exited or the stop grace period has
    /// elapsed. Calling it again is a no-op.
    pub async fn stop(&self) {
        if !self.lifecycle.enter_stopped() {
            return;
        }
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };

        runtime.transport.close();
        // Closing the device first releases a capture waiting on its timeout
        close_device(runtime.device).await;
        let grace = self.config.session.stop_grace();
        for (name, task) in runtime.tasks {
            join_loop(name, task, grace).await;
        }
        tracing::info!("Relay session stopped");
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn peers(&self) -> Arc<PeerSet> {
        self.peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime
            .lock()
            .as_ref()
            .and_then(|runtime| runtime.transport.local_addr().ok())
    }

    pub fn device(&self) -> Option<Arc<AudioDevice>> {
        self.runtime.lock().as_ref().map(|runtime| runtime.device.clone())
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.lifecycle.enter_stopped();
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.abort_now();
        }
    }
}

/// Play every inbound frame locally and forward it to everyone but its sender
async fn inbound_loop(transport: Arc<RelayTransport>, device: Arc<AudioDevice>, running: Arc<AtomicBool>) {
    let mut relayed: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let Some((payload, sender)) = transport.receive().await else {
            if transport.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
            continue;
        };

        let frame = match AudioFrame::try_from(payload) {
            Ok(frame) if !frame.is_empty() => frame,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Dropping datagram from {}: {}", sender, e);
                continue;
            }
        };

        device.play_frame(&frame);
        let report = transport.broadcast(frame.as_bytes(), Some(sender)).await;

        relayed += 1;
        if relayed % LOG_EVERY_FRAMES == 0 {
            tracing::debug!(
                "Relayed {} frames, last from {} to {} peers",
                relayed,
                sender,
                report.delivered
            );
        }
    }
}

/// Broadcast the host microphone to every known peer
async fn capture_loop(
    transport: Arc<RelayTransport>,
    device: Arc<AudioDevice>,
    running: Arc<AtomicBool>,
    timing: LoopTiming,
    sweep_interval: Duration,
) {
    tokio::time::sleep(timing.warmup).await;

    let mut sent: u64 = 0;
    let mut last_sweep = Instant::now();

    while running.load(Ordering::SeqCst) {
        if transport.peers().idle_timeout().is_some() && last_sweep.elapsed() >= sweep_interval {
            last_sweep = Instant::now();
            for peer in transport.peers().evict_idle() {
                tracing::info!("Peer {} timed out (total: {})", peer, transport.peer_count());
            }
        }

        let frame = capture(&device).await;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if !frame.is_empty() {
            let report = transport.broadcast(frame.as_bytes(), None).await;
            if sent % LOG_EVERY_FRAMES == 0 {
                tracing::debug!(
                    "Host frame {}: {} bytes to {} peers",
                    sent,
                    frame.len(),
                    report.delivered
                );
            }
            sent += 1;
        }

        tokio::time::sleep(timing.pacing).await;
    }
}
