//! In-process audio backend
//!
//! Captured frames are injected with [`MemoryBackend::push_capture`] and
//! played frames are recorded for inspection. Useful for headless hosts and
//! for exercising sessions without sound hardware.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::backend::{AudioBackend, DeviceStreams, PlaybackSink, StreamControl, StreamParams};
use crate::audio::frame::AudioFrame;
use crate::audio::route::{AudioMode, DeviceRoute};
use crate::error::AudioError;

#[derive(Default)]
struct MemoryState {
    routes: Vec<DeviceRoute>,
    mode: AudioMode,
    forced_route: Option<DeviceRoute>,
    /// Capture sender of the currently open stream pair
    capture_tx: Option<(u64, Sender<AudioFrame>)>,
    next_stream_id: u64,
    open_count: usize,
    fail_opens: usize,
    last_params: Option<StreamParams>,
}

/// Scriptable backend that keeps everything in memory
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    played: Arc<Mutex<Vec<AudioFrame>>>,
    min_buffer_bytes: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_routes(vec![DeviceRoute::BuiltinSpeaker, DeviceRoute::BuiltinEarpiece])
    }

    pub fn with_routes(routes: Vec<DeviceRoute>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                routes,
                ..Default::default()
            })),
            played: Arc::new(Mutex::new(Vec::new())),
            min_buffer_bytes: 1280,
        }
    }

    /// Replace the set of available routes
    pub fn set_routes(&self, routes: Vec<DeviceRoute>) {
        self.state.lock().routes = routes;
    }

    /// Feed a frame to the open capture stream. Returns false if no stream is
    /// open or its buffer is full.
    pub fn push_capture(&self, frame: AudioFrame) -> bool {
        let state = self.state.lock();
        match &state.capture_tx {
            Some((_, tx)) => match tx.try_send(frame) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Every frame written to playback so far
    pub fn played(&self) -> Vec<AudioFrame> {
        self.played.lock().clone()
    }

    pub fn clear_played(&self) {
        self.played.lock().clear();
    }

    pub fn mode(&self) -> AudioMode {
        self.state.lock().mode
    }

    pub fn forced_route(&self) -> Option<DeviceRoute> {
        self.state.lock().forced_route
    }

    /// Number of successful stream opens
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub fn has_open_stream(&self) -> bool {
        self.state.lock().capture_tx.is_some()
    }

    pub fn last_params(&self) -> Option<StreamParams> {
        self.state.lock().last_params.clone()
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().fail_opens = count;
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn available_routes(&self) -> Vec<DeviceRoute> {
        self.state.lock().routes.clone()
    }

    fn min_buffer_bytes(&self, _sample_rate: u32) -> Result<usize, AudioError> {
        Ok(self.min_buffer_bytes)
    }

    fn set_mode(&self, mode: AudioMode) -> AudioMode {
        std::mem::replace(&mut self.state.lock().mode, mode)
    }

    fn set_route(&self, route: Option<DeviceRoute>) {
        self.state.lock().forced_route = route;
    }

    fn open_streams(&self, params: &StreamParams) -> Result<DeviceStreams, AudioError> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(AudioError::DeviceNotFound("memory device unavailable".into()));
        }

        let (tx, rx) = bounded(params.capture_depth());
        let id = state.next_stream_id;
        state.next_stream_id += 1;
        state.capture_tx = Some((id, tx));
        state.open_count += 1;
        state.last_params = Some(params.clone());

        let active = Arc::new(AtomicBool::new(true));
        Ok(DeviceStreams {
            capture: rx,
            playback: Arc::new(MemorySink {
                played: self.played.clone(),
                active: active.clone(),
            }),
            control: Box::new(MemoryControl {
                id,
                state: self.state.clone(),
                active,
            }),
        })
    }
}

struct MemorySink {
    played: Arc<Mutex<Vec<AudioFrame>>>,
    active: Arc<AtomicBool>,
}

impl PlaybackSink for MemorySink {
    fn write(&self, frame: &AudioFrame) -> usize {
        if !self.active.load(Ordering::Acquire) {
            return 0;
        }
        self.played.lock().push(frame.clone());
        frame.len()
    }
}

struct MemoryControl {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
    active: Arc<AtomicBool>,
}

impl StreamControl for MemoryControl {
    fn stop(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock();
        // Dropping the sender disconnects any capture blocked on this stream
        if matches!(&state.capture_tx, Some((id, _)) if *id == self.id) {
            state.capture_tx = None;
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for MemoryControl {
    fn drop(&mut self) {
        self.stop();
    }
}
