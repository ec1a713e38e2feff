//! Fixed-size packetization of the resampled stream
//!
//! Accumulates interleaved samples and emits one [`AudioPacket`] per complete
//! 128-frame window. A single input chunk may yield zero, one, or many
//! packets; the remainder is retained for the next chunk.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{AudioPacket, StreamFormat};

/// Accumulates samples and emits sequenced audio packets
pub struct Packetizer {
    format: StreamFormat,
    pending: Vec<f32>,
    sequence: u32,
    /// Total packets emitted, shared with health/UI reporting
    emitted: Arc<AtomicU64>,
}

impl Packetizer {
    pub fn new(format: StreamFormat, emitted: Arc<AtomicU64>) -> Self {
        let samples_per_packet = format.samples_per_packet();
        Self {
            format,
            pending: Vec::with_capacity(samples_per_packet * 2),
            sequence: 0,
            emitted,
        }
    }

    /// Feed resampled samples, draining every complete packet.
    ///
    /// `timestamp_ms` on each packet is the current unix wall clock in
    /// milliseconds truncated to 32 bits.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioPacket> {
        self.pending.extend_from_slice(samples);

        let samples_per_packet = self.format.samples_per_packet();
        let complete = self.pending.len() / samples_per_packet;
        if complete == 0 {
            return Vec::new();
        }

        let timestamp_ms = Utc::now().timestamp_millis() as u32;
        let mut packets = Vec::with_capacity(complete);

        for window in 0..complete {
            let start = window * samples_per_packet;
            let packet = AudioPacket::from_samples(
                self.sequence,
                timestamp_ms,
                &self.format,
                &self.pending[start..start + samples_per_packet],
            );
            self.sequence = self.sequence.wrapping_add(1);
            packets.push(packet);
        }

        self.pending.drain(..complete * samples_per_packet);
        self.emitted.fetch_add(complete as u64, Ordering::Relaxed);

        packets
    }

    /// Next sequence number that will be assigned
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Samples currently buffered, waiting for a complete packet
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Discard buffered samples and restart sequence numbering at 0.
    ///
    /// Receivers treat the sequence discontinuity as a stream reset.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.sequence = 0;
    }
}
