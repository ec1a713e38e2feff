//! Pipeline orchestrator
//!
//! Wires capture → resampler → packetizer → transport and owns their
//! lifecycles. Capture chunks arrive on the platform's callback thread and
//! cross a bounded channel to a dedicated pipeline thread, so resampling and
//! broadcast never run inside the capture callback's time budget.
//!
//! The engine implements [`PipelineControl`], which is how the health
//! monitor stops, starts, and restarts pieces of the pipeline.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::audio::source::{capture_channel, CaptureSource};
use crate::audio::{Packetizer, Resampler};
use crate::config::AppConfig;
use crate::error::{AudioError, Error};
use crate::health::{HealthMonitor, PipelineControl, PowerEvent};
use crate::protocol::StreamFormat;
use crate::server::StreamTransport;

struct PipelineHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct EngineInner {
    config: AppConfig,
    transport: StreamTransport,
    source: Mutex<Box<dyn CaptureSource>>,
    pipeline: Mutex<Option<PipelineHandle>>,
    packets_emitted: Arc<AtomicU64>,
    running: AtomicBool,
}

/// The complete streaming engine: transport, capture pipeline, watchdog
pub struct AudioEngine {
    inner: Arc<EngineInner>,
    monitor: Mutex<HealthMonitor>,
}

impl AudioEngine {
    /// Build an engine around a capture source. Nothing starts until
    /// [`start`](Self::start) is called.
    pub fn new(config: AppConfig, source: Box<dyn CaptureSource>) -> Self {
        let transport =
            StreamTransport::with_range(config.server.port, config.server.port_scan_range);
        let health_config = config.health.clone();

        let inner = Arc::new(EngineInner {
            config,
            transport,
            source: Mutex::new(source),
            pipeline: Mutex::new(None),
            packets_emitted: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
        });

        let monitor = HealthMonitor::new(
            inner.clone() as Arc<dyn PipelineControl>,
            health_config,
        );

        Self {
            inner,
            monitor: Mutex::new(monitor),
        }
    }

    /// Set the HTML document served at `/`. Must be called before clients
    /// connect; the engine serves whatever bytes it is given.
    pub fn set_document(&self, html: String) {
        self.inner.transport.set_document(html);
    }

    /// Start transport, capture, and the watchdog. Idempotent.
    ///
    /// A capture failure is returned to the caller but leaves the transport
    /// and watchdog running: the watchdog keeps retrying capture, so a
    /// temporarily missing device heals without another `start` call.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<u16, Error> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(self
                .inner
                .transport
                .actual_port()
                .unwrap_or(self.inner.config.server.port));
        }

        let port = match self.inner.transport.start() {
            Ok(port) => port,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.monitor.lock().spawn();

        if let Err(e) = self.inner.start_capture() {
            tracing::warn!("capture failed to start, watchdog will retry: {}", e);
            return Err(e.into());
        }

        tracing::info!(port, "audio engine running");
        Ok(port)
    }

    /// Stop capture and transport, disconnecting every client. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_capture();
        self.inner.transport.stop();
        tracing::info!("audio engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The port the transport actually bound, for the served URL / QR code
    pub fn actual_port(&self) -> Option<u16> {
        self.inner.transport.actual_port()
    }

    pub fn client_count(&self) -> usize {
        self.inner.transport.client_count()
    }

    /// Watch channel firing on every client connect/disconnect
    pub fn client_count_watch(&self) -> watch::Receiver<usize> {
        self.inner.transport.client_count_watch()
    }

    /// Total packets broadcast since the engine started
    pub fn packets_sent(&self) -> u64 {
        self.inner.transport.packets_sent()
    }

    /// Sender for platform suspend/resume notifications
    pub fn power_sender(&self) -> mpsc::Sender<PowerEvent> {
        self.monitor.lock().power_sender()
    }

    /// The control surface the health monitor drives; exposed for platform
    /// chrome that needs direct restart control
    pub fn control(&self) -> Arc<dyn PipelineControl> {
        self.inner.clone()
    }
}

impl EngineInner {
    fn start_capture(&self) -> Result<(), AudioError> {
        let mut pipeline = self.pipeline.lock();
        if pipeline.is_some() {
            return Ok(());
        }

        let (sink, rx) = capture_channel(self.config.capture.channel_capacity);
        let stop = Arc::new(AtomicBool::new(false));

        let transport = self.transport.clone();
        let emitted = self.packets_emitted.clone();
        let stop_flag = stop.clone();

        let thread = thread::Builder::new()
            .name("phonecast-pipeline".into())
            .spawn(move || {
                let format = StreamFormat::default();
                let resampler = Resampler::new(format);
                // A fresh packetizer per capture session resets the
                // sequence to 0; receivers treat that as a stream reset
                let mut packetizer = Packetizer::new(format, emitted);

                loop {
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(chunk) => {
                            let samples = resampler.resample(
                                &chunk.samples,
                                chunk.sample_rate,
                                chunk.channels,
                            );
                            for packet in packetizer.push(&samples) {
                                transport.broadcast(&packet);
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
                // Partial samples in the packetizer are discarded here
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        if let Err(e) = self.source.lock().start(sink) {
            // The sink is gone, the thread sees a disconnect and exits
            stop.store(true, Ordering::SeqCst);
            let _ = thread.join();
            return Err(e);
        }

        *pipeline = Some(PipelineHandle { stop, thread });
        Ok(())
    }

    fn stop_capture(&self) {
        self.source.lock().stop();

        if let Some(handle) = self.pipeline.lock().take() {
            handle.stop.store(true, Ordering::SeqCst);
            let _ = handle.thread.join();
        }
    }
}

impl PipelineControl for EngineInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_capture_active(&self) -> bool {
        self.source.lock().is_active()
    }

    fn client_count(&self) -> usize {
        self.transport.client_count()
    }

    fn packets_sent(&self) -> u64 {
        self.transport.packets_sent()
    }

    fn start_capture(&self) -> Result<(), AudioError> {
        EngineInner::start_capture(self)
    }

    fn stop_capture(&self) {
        EngineInner::stop_capture(self)
    }

    fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);
        EngineInner::stop_capture(self);
        self.transport.stop();
    }

    fn start_all(&self) -> Result<(), Error> {
        self.running.store(true, Ordering::SeqCst);
        self.transport.start()?;
        EngineInner::start_capture(self)?;
        Ok(())
    }
}
