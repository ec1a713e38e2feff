//! Error types for the streaming engine

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio capture and pipeline errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Transport server errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no free port found: tried {range} ports starting at {base}")]
    PortExhausted { base: u16, range: u16 },

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket upgrade request missing Sec-WebSocket-Key")]
    MalformedUpgradeRequest,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Wire format errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Packet truncated: {0} bytes")]
    TruncatedPacket(usize),

    #[error("Payload length mismatch: header says {expected}, got {actual}")]
    PayloadLengthMismatch { expected: usize, actual: usize },
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
