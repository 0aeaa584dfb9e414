//! # LAN Walkie-Talkie
//!
//! Real-time voice relay over a local network: one host, N clients, raw PCM
//! carried in best-effort UDP datagrams.
//!
//! ## Architecture Overview
//!
//! ```text
//!        CLIENT A                         HOST                          CLIENT B
//! ┌──────────────────┐        ┌──────────────────────────────┐    ┌──────────────────┐
//! │  LinkSession     │        │  RelaySession                │    │  LinkSession     │
//! │ ┌──────────────┐ │  UDP   │ ┌──────────────────────────┐ │UDP │ ┌──────────────┐ │
//! │ │  send loop   │─┼────────┼▶│ inbound relay loop       │─┼────┼▶│ receive loop │ │
//! │ │ capture→send │ │        │ │ recv → play → broadcast  │ │    │ │ recv → play  │ │
//! │ └──────────────┘ │        │ │       (exclude sender)   │ │    │ └──────────────┘ │
//! │ ┌──────────────┐ │        │ └──────────────────────────┘ │    │ ┌──────────────┐ │
//! │ │ receive loop │◀┼────────┼─┤ outbound capture loop    │─┼────┼─┤  send loop   │ │
//! │ │ recv → play  │ │        │ │ capture → broadcast(all) │ │    │ │ capture→send │ │
//! │ └──────────────┘ │        │ └──────────────────────────┘ │    │ └──────────────┘ │
//! │   AudioDevice    │        │  PeerSet   AudioDevice       │    │   AudioDevice    │
//! └──────────────────┘        └──────────────────────────────┘    └──────────────────┘
//! ```
//!
//! The wire format is the frame itself: mono 16-bit little-endian PCM at
//! 16 kHz, one frame per datagram, no header.
//!
//! [`session::SessionController`] is the entry point. It starts exactly one
//! of [`session::RelaySession`] or [`session::LinkSession`], exposes the live
//! peer count, and forwards routing-change events to the active device.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate used for capture, playback and the wire format
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Voice is carried mono
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Bytes per PCM sample (16-bit signed)
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Default capture chunk duration in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: u32 = 20;

    /// Default UDP port shared by host and clients
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Maximum datagram payload accepted or sent
    pub const MAX_PACKET_SIZE: usize = 8192;

    /// Largest payload a UDP/IPv4 datagram can carry
    pub const MAX_UDP_PAYLOAD: usize = 65_507;

    /// Stream buffers are sized to this multiple of the platform minimum
    pub const BUFFER_MULTIPLIER: usize = 4;

    /// Pause after device start before the first capture
    pub const DEFAULT_WARMUP_MS: u64 = 100;

    /// Kernel socket buffer size requested for send and receive
    pub const SOCKET_BUFFER_SIZE: usize = 256 * 1024;
}
