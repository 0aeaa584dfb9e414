//! Session lifecycle
//!
//! A session owns one transport and one [`AudioDevice`] and runs two loops on
//! the tokio runtime. [`RelaySession`] is the host role, [`LinkSession`] the
//! client role, and [`SessionController`] starts at most one of them.

pub mod controller;
pub mod link;
pub mod relay;

pub use controller::{Mode, SessionController};
pub use link::LinkSession;
pub use relay::RelaySession;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::audio::{AudioDevice, AudioFrame};
use crate::config::AudioConfig;
use crate::error::SessionError;

/// Which role, if any, the controller is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    None,
    /// Host: relaying between peers
    Relaying,
    /// Client: linked to one host
    Linked,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionMode::None => "none",
            SessionMode::Relaying => "relaying",
            SessionMode::Linked => "linked",
        };
        f.write_str(name)
    }
}

/// Per-session state machine. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Running,
            _ => SessionState::Stopped,
        }
    }
}

/// State cache plus the "still running" flag the loops poll
pub(crate) struct Lifecycle {
    state: AtomicU8,
    claimed: AtomicBool,
    running: Arc<AtomicBool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            claimed: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Only the first start attempt proceeds
    pub(crate) fn claim_start(&self) -> Result<(), SessionError> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::CannotStart(self.state()));
        }
        Ok(())
    }

    /// Idle -> Running. Fails if a stop raced the start.
    pub(crate) fn enter_running(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Idle as u8,
                SessionState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Any -> Stopped. Returns false if already stopped.
    pub(crate) fn enter_stopped(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        self.state.swap(SessionState::Stopped as u8, Ordering::SeqCst) != SessionState::Stopped as u8
    }
}

/// Warm-up and pacing of the capture loops
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopTiming {
    pub warmup: Duration,
    pub pacing: Duration,
}

impl From<&AudioConfig> for LoopTiming {
    fn from(config: &AudioConfig) -> Self {
        Self {
            warmup: config.warmup(),
            pacing: config.pacing_delay(),
        }
    }
}

/// Log the capture loop's progress every this many frames
pub(crate) const LOG_EVERY_FRAMES: u64 = 100;

/// Capture one frame without blocking the runtime
pub(crate) async fn capture(device: &Arc<AudioDevice>) -> AudioFrame {
    let device = device.clone();
    tokio::task::spawn_blocking(move || device.capture_frame())
        .await
        .unwrap_or_default()
}

/// Close the device off the runtime; backends may join audio threads
pub(crate) async fn close_device(device: Arc<AudioDevice>) {
    let closer = device.clone();
    if tokio::task::spawn_blocking(move || closer.close()).await.is_err() {
        device.close();
    }
}

/// Close the device without waiting for it.
///
/// Used from `Drop`, which may run on a runtime worker thread. Outside a
/// runtime the close happens inline.
pub(crate) fn close_device_detached(device: Arc<AudioDevice>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || device.close());
        }
        Err(_) => device.close(),
    }
}

/// Wait for a loop to finish, aborting it after `grace`
pub(crate) async fn join_loop(name: &str, handle: JoinHandle<()>, grace: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => tracing::debug!("{} loop exited", name),
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => tracing::error!("{} loop panicked: {}", name, e),
        Err(_) => {
            tracing::warn!("{} loop did not exit within {:?}, aborting", name, grace);
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Idle);

        lifecycle.claim_start().unwrap();
        assert!(lifecycle.claim_start().is_err());
        assert!(lifecycle.enter_running());
        assert_eq!(lifecycle.state(), SessionState::Running);

        assert!(lifecycle.enter_stopped());
        assert!(!lifecycle.enter_stopped());
        assert!(!lifecycle.enter_running());
        assert_eq!(lifecycle.state(), SessionState::Stopped);
    }

    #[test]
    fn test_timing_follows_frame_duration() {
        let config = AudioConfig {
            frame_size_ms: 40,
            ..Default::default()
        };
        let timing = LoopTiming::from(&config);
        assert_eq!(timing.pacing, Duration::from_millis(20));
        assert_eq!(timing.warmup, Duration::from_millis(100));
    }
}
