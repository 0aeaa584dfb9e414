//! Client role: stream the microphone to one host and play what it relays

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::audio::{AudioBackend, AudioDevice, AudioFrame};
use crate::config::AppConfig;
use crate::error::{AudioError, Error, NetworkError, Result, SessionError};
use crate::network::{OriginatorTransport, Transport};
use crate::session::{
    capture, close_device, close_device_detached, join_loop, Lifecycle, LoopTiming, SessionState, LOG_EVERY_FRAMES,
};

struct LinkRuntime {
    transport: Arc<OriginatorTransport>,
    device: Arc<AudioDevice>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl LinkRuntime {
    fn abort_now(self) {
        self.transport.close();
        for (_, task) in &self.tasks {
            task.abort();
        }
        close_device_detached(self.device);
    }
}

/// Session linked to a single relay host
pub struct LinkSession {
    backend: Arc<dyn AudioBackend>,
    config: AppConfig,
    remote: SocketAddr,
    lifecycle: Lifecycle,
    runtime: Mutex<Option<LinkRuntime>>,
}

impl LinkSession {
    pub fn new(backend: Arc<dyn AudioBackend>, config: AppConfig, remote: SocketAddr) -> Self {
        Self {
            backend,
            config,
            remote,
            lifecycle: Lifecycle::new(),
            runtime: Mutex::new(None),
        }
    }

    /// Connect to the host, open the audio device and spawn the send and
    /// receive loops.
    pub async fn start(&self) -> Result<()> {
        self.lifecycle.claim_start()?;

        let transport = match OriginatorTransport::connect(self.remote, &self.config.network).await {
            Ok(transport) => Arc::new(transport),
            Err(e) => {
                tracing::error!("Failed to reach {}: {}", self.remote, e);
                self.lifecycle.enter_stopped();
                return Err(e.into());
            }
        };

        let backend = self.backend.clone();
        let audio_config = self.config.audio.clone();
        let device = match tokio::task::spawn_blocking(move || AudioDevice::open(backend, &audio_config)).await {
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

        let send = tokio::spawn(send_loop(
            transport.clone(),
            device.clone(),
            running.clone(),
            LoopTiming::from(&self.config.audio),
        ));
        let receive = tokio::spawn(receive_loop(transport.clone(), device.clone(), running));

        let runtime = LinkRuntime {
            transport,
            device,
            tasks: vec![("link send", send), ("link receive", receive)],
        };

        if !self.lifecycle.enter_running() {
            runtime.abort_now();
            return Err(SessionError::CannotStart(SessionState::Stopped).into());
        }
        *self.runtime.lock() = Some(runtime);
        tracing::info!("Linked to {}", self.remote);
        Ok(())
    }

    /// Stop both loops and release the socket and the audio device
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
        tracing::info!("Link to {} closed", self.remote);
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
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

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.lifecycle.enter_stopped();
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.abort_now();
        }
    }
}

async fn send_loop(
    transport: Arc<OriginatorTransport>,
    device: Arc<AudioDevice>,
    running: Arc<AtomicBool>,
    timing: LoopTiming,
) {
    tokio::time::sleep(timing.warmup).await;

    let mut sent: u64 = 0;
    while running.load(Ordering::SeqCst) {
        let frame = capture(&device).await;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if !frame.is_empty() {
            match transport.send(frame.as_bytes()).await {
                Ok(()) => {
                    if sent % LOG_EVERY_FRAMES == 0 {
                        tracing::debug!("Sent frame {}: {} bytes", sent, frame.len());
                    }
                    sent += 1;
                }
                Err(NetworkError::Closed) => break,
                // The host may not be up yet; keep talking
                Err(e) => tracing::warn!("Send failed: {}", e),
            }
        }

        tokio::time::sleep(timing.pacing).await;
    }
}

async fn receive_loop(transport: Arc<OriginatorTransport>, device: Arc<AudioDevice>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let payload = transport.receive().await;
        if payload.is_empty() {
            if transport.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
            continue;
        }

        match AudioFrame::try_from(payload) {
            Ok(frame) => device.play_frame(&frame),
            Err(e) => tracing::warn!("Dropping datagram from {}: {}", transport.remote(), e),
        }
    }
}
