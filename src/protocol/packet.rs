//! Binary audio packet codec
//!
//! Every packet is a fixed 16-byte little-endian header followed by
//! interleaved 32-bit float samples:
//!
//! ```text
//! offset  size  field
//! 0       4     sequence (u32)
//! 4       4     timestamp_ms (u32, unix millis truncated)
//! 8       4     sample_rate (u32)
//! 12      2     channels (u16)
//! 14      2     frame_count (u16)
//! 16      N     payload, N = frame_count * channels * 4
//! ```
//!
//! The same bytes go out over both transports; the WebSocket path merely
//! wraps them in one binary frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{FRAMES_PER_PACKET, TARGET_CHANNELS, TARGET_SAMPLE_RATE};
use crate::error::ProtocolError;

/// Size of the packet header in bytes
pub const HEADER_LEN: usize = 16;

/// Fixed output format of the stream, immutable for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_packet: u16,
}

impl StreamFormat {
    /// Interleaved samples carried by one packet
    pub fn samples_per_packet(&self) -> usize {
        self.frames_per_packet as usize * self.channels as usize
    }

    /// Payload size of one packet in bytes
    pub fn payload_len(&self) -> usize {
        self.samples_per_packet() * 4
    }

    /// Duration of one packet in milliseconds
    pub fn packet_duration_ms(&self) -> f64 {
        self.frames_per_packet as f64 * 1_000.0 / self.sample_rate as f64
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            channels: TARGET_CHANNELS,
            frames_per_packet: FRAMES_PER_PACKET,
        }
    }
}

/// One audio packet, immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    pub sequence: u32,
    pub timestamp_ms: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_count: u16,
    pub payload: Bytes,
}

impl AudioPacket {
    /// Build a packet from interleaved f32 samples.
    ///
    /// `samples.len()` must equal `frame_count * channels`.
    pub fn from_samples(
        sequence: u32,
        timestamp_ms: u32,
        format: &StreamFormat,
        samples: &[f32],
    ) -> Self {
        debug_assert_eq!(samples.len(), format.samples_per_packet());

        let mut payload = BytesMut::with_capacity(samples.len() * 4);
        for &sample in samples {
            payload.put_f32_le(sample);
        }

        Self {
            sequence,
            timestamp_ms,
            sample_rate: format.sample_rate,
            channels: format.channels,
            frame_count: format.frames_per_packet,
            payload: payload.freeze(),
        }
    }

    /// Total encoded size, header plus payload
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize to the wire format
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.timestamp_ms);
        buf.put_u32_le(self.sample_rate);
        buf.put_u16_le(self.channels);
        buf.put_u16_le(self.frame_count);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::TruncatedPacket(data.len()));
        }

        let mut buf = data;
        let sequence = buf.get_u32_le();
        let timestamp_ms = buf.get_u32_le();
        let sample_rate = buf.get_u32_le();
        let channels = buf.get_u16_le();
        let frame_count = buf.get_u16_le();

        let expected = frame_count as usize * channels as usize * 4;
        if buf.len() != expected {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected,
                actual: buf.len(),
            });
        }

        Ok(Self {
            sequence,
            timestamp_ms,
            sample_rate,
            channels,
            frame_count,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
