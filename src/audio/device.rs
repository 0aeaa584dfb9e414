//! Duplex voice device
//!
//! [`AudioDevice`] wraps one capture stream and one playback stream opened
//! together on the same backend. It owns route selection and the switch into
//! (and back out of) the communication audio mode.
//!
//! The stream handle sits behind an `RwLock`. `restart` and `close` take the
//! write lock before swapping or dropping streams. Capture and playback only
//! clone their channel or sink under the read lock and release it before
//! blocking, so a concurrent restart never waits on an in-flight read, and the
//! read fails soft (empty frame) once its stream is torn down.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::backend::{AudioBackend, PlaybackSink, PlaybackStats, StreamControl, StreamParams};
use crate::audio::frame::AudioFrame;
use crate::audio::route::{select_route, AudioMode, DeviceRoute};
use crate::config::AudioConfig;
use crate::error::AudioError;

struct DeviceHandle {
    capture: Receiver<AudioFrame>,
    playback: Arc<dyn PlaybackSink>,
    control: Box<dyn StreamControl>,
    route: Option<DeviceRoute>,
}

/// Capture + playback pair with lifecycle control
pub struct AudioDevice {
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
    handle: RwLock<Option<DeviceHandle>>,
    /// Mode in effect before this device switched to communication mode
    prior_mode: Mutex<Option<AudioMode>>,
    params: Mutex<Option<StreamParams>>,
    closed: AtomicBool,
    restarts: AtomicU64,
}

impl AudioDevice {
    /// Open and start both streams.
    ///
    /// Buffers are sized to `buffer_multiplier` times the larger of the
    /// platform minimum and one frame. Any failure releases what was acquired.
    pub fn open(backend: Arc<dyn AudioBackend>, config: &AudioConfig) -> Result<Self, AudioError> {
        let device = Self {
            backend,
            config: config.clone(),
            handle: RwLock::new(None),
            prior_mode: Mutex::new(None),
            params: Mutex::new(None),
            closed: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        };

        let mut guard = device.handle.write();
        if let Err(e) = device.start_locked(&mut guard) {
            device.stop_locked(&mut guard);
            drop(guard);
            device.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        drop(guard);

        Ok(device)
    }

    fn start_locked(&self, slot: &mut Option<DeviceHandle>) -> Result<(), AudioError> {
        let previous = self.backend.set_mode(AudioMode::Communication);
        self.prior_mode.lock().get_or_insert(previous);

        let route = select_route(&self.backend.available_routes());
        self.backend.set_route(route);
        match route {
            Some(route) => tracing::info!("Audio route: {}", route),
            None => tracing::warn!("No audio route reported, using platform default"),
        }

        let min = self.backend.min_buffer_bytes(self.config.sample_rate)?;
        let frame_bytes = self.config.frame_bytes();
        let params = StreamParams {
            sample_rate: self.config.sample_rate,
            frame_bytes,
            buffer_bytes: min.max(frame_bytes) * self.config.buffer_multiplier,
            route,
        };
        tracing::debug!(
            "Audio buffer: {} bytes ({} bytes platform minimum)",
            params.buffer_bytes,
            min
        );

        let streams = self.backend.open_streams(&params)?;
        *self.params.lock() = Some(params);
        *slot = Some(DeviceHandle {
            capture: streams.capture,
            playback: streams.playback,
            control: streams.control,
            route,
        });
        Ok(())
    }

    fn stop_locked(&self, slot: &mut Option<DeviceHandle>) {
        if let Some(mut handle) = slot.take() {
            if handle.control.is_active() {
                handle.control.stop();
            }
        }
        if let Some(prior) = self.prior_mode.lock().take() {
            self.backend.set_mode(prior);
        }
        self.backend.set_route(None);
    }

    /// Next captured frame.
    ///
    /// Blocks for at most the capture timeout. Returns an empty frame on
    /// timeout, after close, or when the stream is swapped out mid-read.
    pub fn capture_frame(&self) -> AudioFrame {
        let capture = match self.handle.read().as_ref() {
            Some(handle) => handle.capture.clone(),
            None => return AudioFrame::empty(),
        };

        match capture.recv_timeout(self.config.capture_timeout()) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                tracing::trace!("Capture timed out");
                AudioFrame::empty()
            }
            Err(RecvTimeoutError::Disconnected) => AudioFrame::empty(),
        }
    }

    /// Queue `frame` for playback without blocking.
    ///
    /// Empty frames are ignored. While a restart or close holds the stream
    /// handle the frame is dropped; a short write is logged and the remainder
    /// dropped.
    pub fn play_frame(&self, frame: &AudioFrame) {
        if frame.is_empty() {
            return;
        }
        let playback = match self.handle.try_read() {
            Some(guard) => match guard.as_ref() {
                Some(handle) => handle.playback.clone(),
                None => return,
            },
            None => {
                tracing::trace!("Device busy, dropping {} byte frame", frame.len());
                return;
            }
        };

        let written = playback.write(frame);
        if written < frame.len() {
            tracing::warn!("Short playback write: {} of {} bytes", written, frame.len());
        }
    }

    /// Stop and reopen both streams, re-evaluating the route.
    ///
    /// No-op once the device is closed. If reopening fails the device stays
    /// silent until the next restart.
    pub fn restart(&self) {
        let mut guard = self.handle.write();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        self.stop_locked(&mut guard);
        match self.start_locked(&mut guard) {
            Ok(()) => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Audio device restarted");
            }
            Err(e) => {
                tracing::error!("Audio restart failed, device is silent: {}", e);
                self.stop_locked(&mut guard);
                // Keep communication mode while the session is alive
                let previous = self.backend.set_mode(AudioMode::Communication);
                self.prior_mode.lock().get_or_insert(previous);
            }
        }
    }

    /// Stop both streams, restore the prior audio mode and clear the forced
    /// route. Safe to call repeatedly.
    pub fn close(&self) {
        let mut guard = self.handle.write();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_locked(&mut guard);
        tracing::debug!("Audio device closed");
    }

    pub fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn route(&self) -> Option<DeviceRoute> {
        self.handle.read().as_ref().and_then(|h| h.route)
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Parameters of the most recent successful open
    pub fn params(&self) -> Option<StreamParams> {
        self.params.lock().clone()
    }

    /// Overflow and underrun counts of the current playback stream
    pub fn playback_stats(&self) -> Option<PlaybackStats> {
        self.handle.try_read()?.as_ref().map(|handle| handle.playback.stats())
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::DeviceStreams;
    use crate::audio::memory::MemoryBackend;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> AudioConfig {
        AudioConfig {
            frame_size_ms: 20,
            ..Default::default()
        }
    }

    fn open(backend: &MemoryBackend) -> AudioDevice {
        AudioDevice::open(Arc::new(backend.clone()), &config()).unwrap()
    }

    #[test]
    fn test_open_selects_route_and_mode() {
        let backend = MemoryBackend::with_routes(vec![
            DeviceRoute::BuiltinSpeaker,
            DeviceRoute::WiredHeadset,
            DeviceRoute::BuiltinEarpiece,
        ]);
        let device = open(&backend);

        assert_eq!(device.route(), Some(DeviceRoute::WiredHeadset));
        assert_eq!(backend.forced_route(), Some(DeviceRoute::WiredHeadset));
        assert_eq!(backend.mode(), AudioMode::Communication);

        // 1280 byte minimum, four times over
        let params = device.params().unwrap();
        assert_eq!(params.buffer_bytes, 1280 * 4);
        assert_eq!(params.frame_bytes, 640);
    }

    #[test]
    fn test_close_restores_and_is_idempotent() {
        let backend = MemoryBackend::new();
        let device = open(&backend);

        device.close();
        assert_eq!(backend.mode(), AudioMode::Normal);
        assert_eq!(backend.forced_route(), None);
        assert!(!backend.has_open_stream());

        device.close();
        assert_eq!(backend.mode(), AudioMode::Normal);
        assert!(device.capture_frame().is_empty());
    }

    #[test]
    fn test_failed_open_leaves_nothing_behind() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens(1);

        let result = AudioDevice::open(Arc::new(backend.clone()), &config());
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
        assert_eq!(backend.mode(), AudioMode::Normal);
        assert_eq!(backend.forced_route(), None);
    }

    #[test]
    fn test_capture_and_play() {
        let backend = MemoryBackend::new();
        let device = open(&backend);
        let frame = AudioFrame::from_samples(&[1, 2, 3, 4]);

        assert!(backend.push_capture(frame.clone()));
        assert_eq!(device.capture_frame(), frame);

        device.play_frame(&AudioFrame::empty());
        device.play_frame(&frame);
        assert_eq!(backend.played(), vec![frame]);
    }

    #[test]
    fn test_capture_times_out_empty() {
        let backend = MemoryBackend::new();
        let device = open(&backend);
        assert!(device.capture_frame().is_empty());
    }

    #[test]
    fn test_restart_reopens_and_reevaluates_route() {
        let backend = MemoryBackend::new();
        let device = open(&backend);
        assert_eq!(device.route(), Some(DeviceRoute::BuiltinEarpiece));

        backend.set_routes(vec![DeviceRoute::BuiltinSpeaker, DeviceRoute::BluetoothSco]);
        device.restart();

        assert_eq!(backend.open_count(), 2);
        assert_eq!(device.restart_count(), 1);
        assert_eq!(device.route(), Some(DeviceRoute::BluetoothSco));
        assert_eq!(backend.mode(), AudioMode::Communication);

        device.close();
        assert_eq!(backend.mode(), AudioMode::Normal);
    }

    #[test]
    fn test_restart_unblocks_inflight_capture() {
        let backend = MemoryBackend::new();
        let device = Arc::new(open(&backend));

        let reader = {
            let device = device.clone();
            thread::spawn(move || device.capture_frame())
        };
        thread::sleep(Duration::from_millis(10));
        device.restart();

        assert!(reader.join().unwrap().is_empty());
        assert!(device.is_open());
    }

    #[test]
    fn test_failed_restart_goes_silent() {
        let backend = MemoryBackend::new();
        let device = open(&backend);

        backend.fail_next_opens(1);
        device.restart();
        assert!(!device.is_open());
        assert!(device.capture_frame().is_empty());
        device.play_frame(&AudioFrame::from_samples(&[1]));
        assert!(backend.played().is_empty());

        device.restart();
        assert!(device.is_open());

        device.close();
        assert_eq!(backend.mode(), AudioMode::Normal);
    }

    #[test]
    fn test_restart_after_close_is_noop() {
        let backend = MemoryBackend::new();
        let device = open(&backend);
        device.close();
        device.restart();
        assert!(!device.is_open());
        assert_eq!(backend.open_count(), 1);
    }

    /// Memory backend whose opens can be made slow, like a cpal device
    /// enumeration
    struct SlowOpenBackend {
        inner: MemoryBackend,
        slow: AtomicBool,
    }

    impl AudioBackend for SlowOpenBackend {
        fn name(&self) -> &str {
            "slow"
        }

        fn available_routes(&self) -> Vec<DeviceRoute> {
            self.inner.available_routes()
        }

        fn min_buffer_bytes(&self, sample_rate: u32) -> Result<usize, AudioError> {
            self.inner.min_buffer_bytes(sample_rate)
        }

        fn set_mode(&self, mode: AudioMode) -> AudioMode {
            self.inner.set_mode(mode)
        }

        fn set_route(&self, route: Option<DeviceRoute>) {
            self.inner.set_route(route)
        }

        fn open_streams(&self, params: &StreamParams) -> Result<DeviceStreams, AudioError> {
            if self.slow.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(400));
            }
            self.inner.open_streams(params)
        }
    }

    #[test]
    fn test_play_does_not_wait_for_restart() {
        let memory = MemoryBackend::new();
        let backend = Arc::new(SlowOpenBackend {
            inner: memory.clone(),
            slow: AtomicBool::new(false),
        });
        let device = Arc::new(AudioDevice::open(backend.clone(), &config()).unwrap());
        backend.slow.store(true, Ordering::SeqCst);

        let restarter = {
            let device = device.clone();
            thread::spawn(move || device.restart())
        };
        thread::sleep(Duration::from_millis(50));

        let begun = Instant::now();
        device.play_frame(&AudioFrame::from_samples(&[5, 5]));
        assert!(begun.elapsed() < Duration::from_millis(100));
        assert!(memory.played().is_empty());

        restarter.join().unwrap();
        assert_eq!(device.restart_count(), 1);
        device.play_frame(&AudioFrame::from_samples(&[6, 6]));
        assert_eq!(memory.played().len(), 1);
    }

    #[test]
    fn test_device_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AudioDevice>();
        assert_send_sync::<Arc<AudioDevice>>();
    }

    #[test]
    fn test_playback_stats_follow_stream() {
        let backend = MemoryBackend::new();
        let device = open(&backend);
        assert_eq!(device.playback_stats(), Some(PlaybackStats::default()));
        device.close();
        assert_eq!(device.playback_stats(), None);
    }
}
