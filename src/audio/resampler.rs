//! Format normalization to the fixed stream format
//!
//! Converts whatever rate and channel count the capture device produced to
//! 48 kHz stereo via linear interpolation. Quality-wise this is deliberately
//! simple: the browser player runs its own jitter buffer and the packets are
//! short enough that interpolation artifacts stay inaudible for system audio.

use crate::protocol::StreamFormat;

/// Converts arbitrary input formats to the fixed target format
pub struct Resampler {
    format: StreamFormat,
}

impl Resampler {
    pub fn new(format: StreamFormat) -> Self {
        Self { format }
    }

    /// Resample interleaved input samples to interleaved stereo at the
    /// target rate.
    ///
    /// Mono input is duplicated to both output channels; inputs with more
    /// than two channels contribute only their first two. Returns an empty
    /// vector for empty or zero-channel input.
    pub fn resample(&self, samples: &[f32], input_rate: u32, input_channels: u16) -> Vec<f32> {
        if samples.is_empty() || input_channels == 0 || input_rate == 0 {
            return Vec::new();
        }

        // Already in the target format: straight copy
        if input_rate == self.format.sample_rate && input_channels == self.format.channels {
            return samples.to_vec();
        }

        let in_channels = input_channels as usize;
        let in_frames = samples.len() / in_channels;
        if in_frames == 0 {
            return Vec::new();
        }

        let ratio = self.format.sample_rate as f64 / input_rate as f64;
        let out_frames = (in_frames as f64 * ratio) as usize;
        let mut out = Vec::with_capacity(out_frames * 2);

        for i in 0..out_frames {
            let src_pos = i as f64 / ratio;
            let idx = src_pos as usize;
            let frac = (src_pos - idx as f64) as f32;
            let next = (idx + 1).min(in_frames - 1);

            let (left, right) = if in_channels == 1 {
                let s = lerp(samples[idx], samples[next], frac);
                (s, s)
            } else {
                let l = lerp(
                    samples[idx * in_channels],
                    samples[next * in_channels],
                    frac,
                );
                let r = lerp(
                    samples[idx * in_channels + 1],
                    samples[next * in_channels + 1],
                    frac,
                );
                (l, r)
            };

            out.push(left);
            out.push(right);
        }

        out
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}
