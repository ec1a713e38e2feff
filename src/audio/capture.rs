//! System audio capture via cpal
//!
//! Runs the cpal stream on a dedicated named thread, keeping device
//! callbacks off the async runtime. The callback only copies the buffer and
//! pushes it into the bounded capture channel; everything else happens on
//! the pipeline thread.
//!
//! The source reports whatever rate and channel count the device actually
//! negotiated; normalization to the stream format is the Resampler's job.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::source::{CaptureChunk, CaptureSink, CaptureSource};
use crate::error::AudioError;

/// Capture source backed by a cpal input device.
///
/// `device_name: None` selects the default input device. System-audio
/// loopback devices (monitor sources, virtual cables, installed drivers)
/// enumerate as regular inputs, so one code path covers both cases.
pub struct CpalCaptureSource {
    device_name: Option<String>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
}

impl CpalCaptureSource {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        }
    }

    fn find_device(&self) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();

        match &self.device_name {
            None => host
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("no default input device".into())),
            Some(name) => {
                let mut devices = host
                    .input_devices()
                    .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?;
                devices
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or_else(|| AudioError::DeviceNotFound(name.clone()))
            }
        }
    }

    /// Pop the most recent stream error, if any
    pub fn last_error(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl CaptureSource for CpalCaptureSource {
    fn start(&mut self, sink: CaptureSink) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = self.find_device()?;
        let config = device
            .default_input_config()
            .map_err(|e| AudioError::CaptureUnavailable(e.to_string()))?;

        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?}",
                config.sample_format()
            )));
        }

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();
        let stream_config: cpal::StreamConfig = config.into();

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let device_name = device.name().unwrap_or_else(|_| "unknown".into());
        tracing::info!(
            device = %device_name,
            sample_rate,
            channels,
            "starting audio capture"
        );

        let handle = thread::Builder::new()
            .name("phonecast-capture".into())
            .spawn(move || {
                let callback_error_tx = error_tx.clone();
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }
                        sink.push(CaptureChunk {
                            samples: data.to_vec(),
                            sample_rate,
                            channels,
                        });
                    },
                    move |err| {
                        let _ = callback_error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            tracing::error!("failed to start capture stream: {}", e);
                            let _ = error_tx.try_send(AudioError::StreamError(e.to_string()));
                            running_for_loop.store(false, Ordering::SeqCst);
                            return;
                        }

                        // Keep the thread alive while running; dropping the
                        // stream on exit stops capture
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to build capture stream: {}", e);
                        let _ = error_tx.try_send(AudioError::CaptureUnavailable(e.to_string()));
                        running_for_loop.store(false, Ordering::SeqCst);
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalCaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}
