//! Audio subsystem module

pub mod capture;
pub mod packetizer;
pub mod resampler;
pub mod source;

pub use capture::CpalCaptureSource;
pub use packetizer::Packetizer;
pub use resampler::Resampler;
pub use source::{CaptureChunk, CaptureSink, CaptureSource};
