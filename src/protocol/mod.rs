//! Wire format for the audio stream
//!
//! Defines the binary audio packet shared by the WebSocket and raw-HTTP
//! transports, plus the minimal WebSocket framing the server speaks.

pub mod packet;
pub mod ws;

pub use packet::{AudioPacket, StreamFormat, HEADER_LEN};
