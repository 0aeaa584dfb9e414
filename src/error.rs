//! Error types for the voice relay

use std::net::SocketAddr;
use thiserror::Error;

use crate::session::{SessionMode, SessionState};

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Frame length {0} is not a whole number of 16-bit samples")]
    UnalignedFrame(usize),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// On receive the size is a lower bound; the datagram was cut short
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Transport is closed")]
    Closed,
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A session is already running in {0} mode")]
    AlreadyRunning(SessionMode),

    #[error("Session cannot start from the {0:?} state")]
    CannotStart(SessionState),

    #[error("Client mode requires a host address")]
    MissingAddress,

    #[error("Invalid host address '{0}'")]
    InvalidAddress(String),
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
