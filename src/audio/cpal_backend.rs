//! cpal-based audio backend
//!
//! cpal streams are not `Send` on every platform, so each open spawns a
//! dedicated `audio-io` thread that owns both streams for their lifetime and
//! bridges them to the session side through a capture channel and a
//! lock-free playback queue.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig, SupportedBufferSize};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::backend::{AudioBackend, DeviceStreams, StreamControl, StreamParams};
use crate::audio::buffer::{create_shared_queue, FrameAssembler, SharedSampleQueue};
use crate::audio::frame::{f32_to_i16, i16_to_f32, AudioFrame};
use crate::audio::route::{AudioMode, DeviceRoute};
use crate::constants::{BYTES_PER_SAMPLE, DEFAULT_CHANNELS, DEFAULT_FRAME_SIZE_MS};
use crate::error::AudioError;

/// Backend over the default cpal host
pub struct CpalBackend {
    mode: Mutex<AudioMode>,
    forced_route: Mutex<Option<DeviceRoute>>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(AudioMode::Normal),
            forced_route: Mutex::new(None),
        }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn routes_of(devices: Result<impl Iterator<Item = cpal::Device>, cpal::DevicesError>) -> Vec<DeviceRoute> {
    let mut routes = Vec::new();
    if let Ok(devices) = devices {
        for device in devices {
            if let Ok(name) = device.name() {
                let route = DeviceRoute::classify(&name);
                if !routes.contains(&route) {
                    routes.push(route);
                }
            }
        }
    }
    routes
}

/// Find a device on `route`, falling back to the host default
fn find_device(route: Option<DeviceRoute>, is_input: bool) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    if let Some(route) = route {
        let devices = if is_input {
            host.input_devices()
        } else {
            host.output_devices()
        };
        if let Ok(devices) = devices {
            for device in devices {
                if let Ok(name) = device.name() {
                    if DeviceRoute::classify(&name) == route {
                        return Ok(device);
                    }
                }
            }
        }
    }

    let default = if is_input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    default.ok_or_else(|| {
        AudioError::DeviceNotFound(format!(
            "No default {} device",
            if is_input { "input" } else { "output" }
        ))
    })
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn available_routes(&self) -> Vec<DeviceRoute> {
        let host = cpal::default_host();
        let inputs = routes_of(host.input_devices());
        let outputs = routes_of(host.output_devices());

        let mut routes: Vec<DeviceRoute> = inputs.into_iter().filter(|r| outputs.contains(r)).collect();
        if routes.is_empty() && host.default_input_device().is_some() && host.default_output_device().is_some() {
            routes.push(DeviceRoute::BuiltinSpeaker);
        }
        routes
    }

    fn min_buffer_bytes(&self, sample_rate: u32) -> Result<usize, AudioError> {
        let device = find_device(*self.forced_route.lock(), true)?;
        let config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let frames = match config.buffer_size() {
            SupportedBufferSize::Range { min, .. } if *min > 0 => *min as usize,
            _ => (sample_rate * DEFAULT_FRAME_SIZE_MS / 1000) as usize,
        };
        Ok(frames * BYTES_PER_SAMPLE)
    }

    fn set_mode(&self, mode: AudioMode) -> AudioMode {
        // Desktop hosts expose no call profile; the mode is tracked so it can
        // be restored symmetrically.
        let previous = std::mem::replace(&mut *self.mode.lock(), mode);
        tracing::debug!("Audio mode {:?} -> {:?}", previous, mode);
        previous
    }

    fn set_route(&self, route: Option<DeviceRoute>) {
        *self.forced_route.lock() = route;
    }

    fn open_streams(&self, params: &StreamParams) -> Result<DeviceStreams, AudioError> {
        let (capture_tx, capture_rx) = bounded::<AudioFrame>(params.capture_depth());
        let playback = create_shared_queue(params.playback_samples());
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let active = Arc::new(AtomicBool::new(true));

        let params = params.clone();
        let thread_playback = playback.clone();
        let thread_active = active.clone();

        let handle = thread::Builder::new()
            .name("audio-io".into())
            .spawn(move || {
                let streams = match build_streams(&params, capture_tx, thread_playback, thread_active) {
                    Ok(streams) => streams,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Park until the control is stopped or dropped
                let _ = stop_rx.recv();
                drop(streams);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("audio thread exited during setup".into()));
            }
        }

        Ok(DeviceStreams {
            capture: capture_rx,
            playback,
            control: Box::new(CpalControl {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
                active,
            }),
        })
    }
}

/// Build a stream config at `sample_rate`, preferring mono
fn stream_config(device: &cpal::Device, sample_rate: u32, is_input: bool) -> Result<StreamConfig, AudioError> {
    let default = if is_input {
        device.default_input_config()
    } else {
        device.default_output_config()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    let supports_mono = {
        let ranges: Vec<cpal::SupportedStreamConfigRange> = if is_input {
            device.supported_input_configs().map(|it| it.collect()).unwrap_or_default()
        } else {
            device.supported_output_configs().map(|it| it.collect()).unwrap_or_default()
        };
        ranges.iter().any(|r| {
            r.channels() == DEFAULT_CHANNELS
                && r.min_sample_rate() <= SampleRate(sample_rate)
                && r.max_sample_rate() >= SampleRate(sample_rate)
        })
    };

    Ok(StreamConfig {
        channels: if supports_mono {
            DEFAULT_CHANNELS
        } else {
            default.channels()
        },
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn build_streams(
    params: &StreamParams,
    capture_tx: Sender<AudioFrame>,
    playback: SharedSampleQueue,
    active: Arc<AtomicBool>,
) -> Result<(cpal::Stream, cpal::Stream), AudioError> {
    let input_device = find_device(params.route, true)?;
    let output_device = find_device(params.route, false)?;

    let input_config = stream_config(&input_device, params.sample_rate, true)?;
    let output_config = stream_config(&output_device, params.sample_rate, false)?;
    let in_channels = input_config.channels as usize;
    let out_channels = output_config.channels as usize;

    tracing::info!(
        "Opening audio: in='{}' ({}ch) out='{}' ({}ch) at {} Hz",
        input_device.name().unwrap_or_else(|_| "Unknown".to_string()),
        in_channels,
        output_device.name().unwrap_or_else(|_| "Unknown".to_string()),
        out_channels,
        params.sample_rate
    );

    let mut assembler = FrameAssembler::new(params.frame_bytes / BYTES_PER_SAMPLE);
    let capture_active = active.clone();
    let input = input_device
        .build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !capture_active.load(Ordering::Relaxed) {
                    return;
                }
                // Downmix to mono by averaging interleaved channels
                let mono = data
                    .chunks(in_channels)
                    .map(|ch| f32_to_i16(ch.iter().sum::<f32>() / ch.len() as f32));
                assembler.push(mono, |frame| match capture_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => tracing::trace!("Capture channel full, dropping frame"),
                    Err(TrySendError::Disconnected(_)) => {}
                });
            },
            |err| tracing::warn!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    // Mono scratch sized for a typical callback; grows once if a host asks for more
    let mut mono = vec![0i16; params.playback_samples().max(1)];
    let output = output_device
        .build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let needed = data.len() / out_channels;
                if mono.len() < needed {
                    mono.resize(needed, 0);
                }
                playback.pop_into(&mut mono[..needed]);
                // Upmix: copy each mono sample to every output channel
                for (frame, &sample) in data.chunks_mut(out_channels).zip(mono.iter()) {
                    let value = i16_to_f32(sample);
                    frame.iter_mut().for_each(|s| *s = value);
                }
            },
            |err| tracing::warn!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    input.play().map_err(|e| AudioError::CpalError(e.to_string()))?;
    output.play().map_err(|e| AudioError::CpalError(e.to_string()))?;

    Ok((input, output))
}

struct CpalControl {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    active: Arc<AtomicBool>,
}

impl StreamControl for CpalControl {
    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the audio thread, which drops the streams
        // and with them the capture sender.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for CpalControl {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Names of the host's input devices with their classified route
pub fn list_input_routes() -> Vec<(String, DeviceRoute)> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|d| d.name().ok())
                .map(|name| {
                    let route = DeviceRoute::classify(&name);
                    (name, route)
                })
                .collect()
        })
        .unwrap_or_default()
}
