//! Platform audio seam
//!
//! An [`AudioBackend`] knows how to enumerate routes, switch the device-level
//! audio mode and open a capture/playback stream pair. [`AudioDevice`] drives
//! it; the session loops never touch a backend directly.
//!
//! [`AudioDevice`]: crate::audio::device::AudioDevice

use crossbeam_channel::Receiver;
use std::sync::Arc;

use crate::audio::buffer::SampleQueue;
use crate::audio::frame::AudioFrame;
use crate::audio::route::{AudioMode, DeviceRoute};
use crate::error::AudioError;

/// Parameters for opening a stream pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    /// Bytes per captured frame
    pub frame_bytes: usize,
    /// Total buffering per direction, in bytes
    pub buffer_bytes: usize,
    /// Route chosen for this open, if any
    pub route: Option<DeviceRoute>,
}

impl StreamParams {
    /// Capture channel depth in frames
    pub fn capture_depth(&self) -> usize {
        (self.buffer_bytes / self.frame_bytes.max(1)).max(1)
    }

    /// Playback ring capacity in samples
    pub fn playback_samples(&self) -> usize {
        self.buffer_bytes / crate::constants::BYTES_PER_SAMPLE
    }
}

/// Playback buffer health since the stream was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Frames cut short because the ring was full
    pub overflows: usize,
    /// Output callbacks that ran dry part-way through
    pub underruns: usize,
}

/// Destination for played frames
pub trait PlaybackSink: Send + Sync {
    /// Enqueue `frame` for playback. Returns the number of bytes accepted.
    fn write(&self, frame: &AudioFrame) -> usize;

    fn stats(&self) -> PlaybackStats {
        PlaybackStats::default()
    }
}

impl PlaybackSink for SampleQueue {
    fn write(&self, frame: &AudioFrame) -> usize {
        self.push_frame(frame)
    }

    fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            overflows: self.overflow_count(),
            underruns: self.underrun_count(),
        }
    }
}

/// Running platform streams. Stopping is idempotent.
///
/// Held inside the device's lock, which is shared across threads, so
/// implementations must be `Sync` as well as `Send`.
pub trait StreamControl: Send + Sync {
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// An opened capture/playback pair sharing one sample clock
pub struct DeviceStreams {
    /// Frames produced by the capture callback
    pub capture: Receiver<AudioFrame>,
    pub playback: Arc<dyn PlaybackSink>,
    pub control: Box<dyn StreamControl>,
}

pub trait AudioBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Routes currently usable, in no particular order
    fn available_routes(&self) -> Vec<DeviceRoute>;

    /// Smallest buffer in bytes the platform accepts for mono 16-bit streams
    fn min_buffer_bytes(&self, sample_rate: u32) -> Result<usize, AudioError>;

    /// Switch the device-level mode, returning the mode it replaced
    fn set_mode(&self, mode: AudioMode) -> AudioMode;

    /// Force a route; `None` clears any forced route
    fn set_route(&self, route: Option<DeviceRoute>);

    fn open_streams(&self, params: &StreamParams) -> Result<DeviceStreams, AudioError>;
}
