//! Capture source abstraction
//!
//! Platform capture APIs deliver arbitrary-length buffers of interleaved
//! float samples on their own thread. The engine never talks to a platform
//! API directly; it hands a [`CaptureSink`] to whatever [`CaptureSource`]
//! implementation the host platform provides and consumes chunks from the
//! other end of the bounded channel, keeping resampling and network latency
//! off the capture callback.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::AudioError;

/// One buffer of captured audio, tagged with the format the device produced
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    /// Interleaved f32 samples
    pub samples: Vec<f32>,
    /// Actual sample rate the device negotiated
    pub sample_rate: u32,
    /// Actual channel count the device negotiated
    pub channels: u16,
}

impl CaptureChunk {
    /// Number of frames in this chunk
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// Producer side of the capture channel, handed to the capture callback.
///
/// Pushes are non-blocking: when the pipeline falls behind, chunks are
/// dropped and counted rather than stalling the capture device.
#[derive(Clone)]
pub struct CaptureSink {
    tx: Sender<CaptureChunk>,
    dropped: Arc<AtomicUsize>,
}

impl CaptureSink {
    /// Push a chunk without blocking. Returns false if the chunk was dropped.
    pub fn push(&self, chunk: CaptureChunk) -> bool {
        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 100 == 1 {
                    tracing::warn!(dropped = total, "capture channel full, dropping chunk");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Total chunks dropped because the pipeline was behind
    pub fn dropped_chunks(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a bounded capture channel
pub fn capture_channel(capacity: usize) -> (CaptureSink, Receiver<CaptureChunk>) {
    let (tx, rx) = bounded(capacity);
    (
        CaptureSink {
            tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        },
        rx,
    )
}

/// Platform capture behind a trait so the engine stays platform-agnostic.
///
/// Implementations deliver samples by calling `sink.push` from whatever
/// thread the platform dictates. `start` and `stop` must be safe to call
/// repeatedly; partially buffered data is discarded on stop.
pub trait CaptureSource: Send {
    /// Begin delivering chunks into `sink`
    fn start(&mut self, sink: CaptureSink) -> Result<(), AudioError>;

    /// Stop delivering chunks and release the device
    fn stop(&mut self);

    /// Whether a capture session is currently active
    fn is_active(&self) -> bool;
}
