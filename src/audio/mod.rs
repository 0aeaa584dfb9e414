//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod cpal_backend;
pub mod device;
pub mod frame;
pub mod memory;
pub mod monitor;
pub mod route;

pub use backend::{AudioBackend, DeviceStreams, PlaybackSink, PlaybackStats, StreamControl, StreamParams};
pub use buffer::{FrameAssembler, SampleQueue};
pub use cpal_backend::CpalBackend;
pub use device::AudioDevice;
pub use frame::AudioFrame;
pub use memory::MemoryBackend;
pub use monitor::{route_event_channel, DeviceEvent, RouteChangeTrigger, RouteMonitor};
pub use route::{select_route, AudioMode, DeviceRoute};
