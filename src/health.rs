//! Pipeline health watchdog
//!
//! A periodic monitor that detects stalled packet flow or dead capture and
//! restarts the capture session, plus sleep/wake handling: the pipeline is
//! torn down on suspend and rebuilt after resume.
//!
//! The monitor drives the engine through the [`PipelineControl`] trait so it
//! can be exercised against a mock in tests. All of its mutable state lives
//! inside its own task; nothing else reads or writes it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::HealthConfig;
use crate::error::{AudioError, Error};

/// System power transitions, delivered by platform chrome outside the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Suspend,
    Resume,
}

/// Control surface the monitor drives.
///
/// All operations are synchronous; the engine's start paths bind sockets and
/// spawn tasks without awaiting, so the monitor can call them from its own
/// task directly.
pub trait PipelineControl: Send + Sync + 'static {
    /// Whether the engine is supposed to be streaming
    fn is_running(&self) -> bool;

    /// Whether a capture session is currently delivering samples
    fn is_capture_active(&self) -> bool;

    /// Connected clients, both transport kinds combined
    fn client_count(&self) -> usize;

    /// Total packets broadcast since the engine started
    fn packets_sent(&self) -> u64;

    fn start_capture(&self) -> Result<(), AudioError>;
    fn stop_capture(&self);

    /// Tear down transport and capture (suspend path)
    fn stop_all(&self);

    /// Rebuild transport and capture from scratch (resume path)
    fn start_all(&self) -> Result<(), Error>;
}

/// Watchdog state, owned exclusively by the monitor task
struct HealthState {
    last_packets_sent: u64,
    stale_ticks: u8,
    was_running_before_sleep: bool,
}

/// Periodic health monitor over a [`PipelineControl`]
pub struct HealthMonitor {
    control: Arc<dyn PipelineControl>,
    config: HealthConfig,
    power_tx: mpsc::Sender<PowerEvent>,
    power_rx: Option<mpsc::Receiver<PowerEvent>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(control: Arc<dyn PipelineControl>, config: HealthConfig) -> Self {
        let (power_tx, power_rx) = mpsc::channel(8);
        Self {
            control,
            config,
            power_tx,
            power_rx: Some(power_rx),
            task: None,
        }
    }

    /// Sender for platform power notifications
    pub fn power_sender(&self) -> mpsc::Sender<PowerEvent> {
        self.power_tx.clone()
    }

    /// Spawn the watchdog task. Idempotent.
    pub fn spawn(&mut self) {
        if self.task.is_some() {
            return;
        }
        let power_rx = match self.power_rx.take() {
            Some(rx) => rx,
            None => return, // already consumed by an earlier spawn/stop cycle
        };
        let control = self.control.clone();
        let config = self.config.clone();
        self.task = Some(tokio::spawn(monitor_loop(control, config, power_rx)));
    }

    /// Stop the watchdog task. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn monitor_loop(
    control: Arc<dyn PipelineControl>,
    config: HealthConfig,
    mut power_rx: mpsc::Receiver<PowerEvent>,
) {
    let mut state = HealthState {
        last_packets_sent: control.packets_sent(),
        stale_ticks: 0,
        was_running_before_sleep: false,
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(config.tick_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                on_tick(&control, &config, &mut state).await;
            }
            event = power_rx.recv() => {
                match event {
                    Some(PowerEvent::Suspend) => on_suspend(&control, &mut state),
                    Some(PowerEvent::Resume) => on_resume(&control, &config, &mut state).await,
                    None => return,
                }
            }
        }
    }
}

async fn on_tick(
    control: &Arc<dyn PipelineControl>,
    config: &HealthConfig,
    state: &mut HealthState,
) {
    if !control.is_running() {
        state.stale_ticks = 0;
        return;
    }

    // Capture died outside the stale-packet path: bring it back immediately
    if !control.is_capture_active() {
        tracing::warn!("capture is down while server is running, restarting");
        restart_capture(control, config).await;
        state.stale_ticks = 0;
        state.last_packets_sent = control.packets_sent();
        return;
    }

    let sent = control.packets_sent();

    if control.client_count() >= 1 {
        if sent == state.last_packets_sent {
            state.stale_ticks += 1;
            tracing::debug!(stale_ticks = state.stale_ticks, "no packet progress");
            if state.stale_ticks >= config.stale_ticks_before_restart {
                tracing::warn!(
                    stale_ticks = state.stale_ticks,
                    "packet flow stalled with clients connected, restarting capture"
                );
                restart_capture(control, config).await;
                state.stale_ticks = 0;
            }
        } else {
            state.stale_ticks = 0;
        }
    } else {
        state.stale_ticks = 0;
    }

    state.last_packets_sent = sent;
}

/// Stop capture, let the device release, start a fresh session
async fn restart_capture(control: &Arc<dyn PipelineControl>, config: &HealthConfig) {
    control.stop_capture();
    tokio::time::sleep(Duration::from_millis(config.restart_delay_ms)).await;
    if let Err(e) = control.start_capture() {
        tracing::error!("capture restart failed: {}", e);
    }
}

fn on_suspend(control: &Arc<dyn PipelineControl>, state: &mut HealthState) {
    state.was_running_before_sleep = control.is_running();
    tracing::info!(
        was_running = state.was_running_before_sleep,
        "system suspending, stopping pipeline"
    );
    control.stop_all();
}

async fn on_resume(
    control: &Arc<dyn PipelineControl>,
    config: &HealthConfig,
    state: &mut HealthState,
) {
    if !state.was_running_before_sleep {
        return;
    }
    state.was_running_before_sleep = false;

    tracing::info!(delay_ms = config.wake_delay_ms, "system resumed, restarting pipeline");
    // Give networking time to come back before rebinding
    tokio::time::sleep(Duration::from_millis(config.wake_delay_ms)).await;

    if let Err(e) = control.start_all() {
        tracing::error!("pipeline restart after wake failed: {}", e);
    }
    state.stale_ticks = 0;
    state.last_packets_sent = control.packets_sent();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockControl {
        running: AtomicBool,
        capture_active: AtomicBool,
        clients: AtomicUsize,
        packets: AtomicU64,
        capture_starts: AtomicUsize,
        capture_stops: AtomicUsize,
        full_stops: AtomicUsize,
        full_starts: AtomicUsize,
    }

    impl MockControl {
        fn streaming() -> Arc<Self> {
            let mock = Self::default();
            mock.running.store(true, Ordering::SeqCst);
            mock.capture_active.store(true, Ordering::SeqCst);
            Arc::new(mock)
        }
    }

    impl PipelineControl for MockControl {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn is_capture_active(&self) -> bool {
            self.capture_active.load(Ordering::SeqCst)
        }
        fn client_count(&self) -> usize {
            self.clients.load(Ordering::SeqCst)
        }
        fn packets_sent(&self) -> u64 {
            self.packets.load(Ordering::SeqCst)
        }
        fn start_capture(&self) -> Result<(), AudioError> {
            self.capture_active.store(true, Ordering::SeqCst);
            self.capture_starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop_capture(&self) {
            self.capture_active.store(false, Ordering::SeqCst);
            self.capture_stops.fetch_add(1, Ordering::SeqCst);
        }
        fn stop_all(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.capture_active.store(false, Ordering::SeqCst);
            self.full_stops.fetch_add(1, Ordering::SeqCst);
        }
        fn start_all(&self) -> Result<(), Error> {
            self.running.store(true, Ordering::SeqCst);
            self.capture_active.store(true, Ordering::SeqCst);
            self.full_starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> HealthConfig {
        HealthConfig {
            tick_secs: 5,
            stale_ticks_before_restart: 3,
            restart_delay_ms: 500,
            wake_delay_ms: 2_000,
        }
    }

    fn monitor(control: Arc<MockControl>) -> HealthMonitor {
        HealthMonitor::new(control, test_config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_capture_restarts_after_three_ticks() {
        let control = MockControl::streaming();
        control.clients.store(1, Ordering::SeqCst);
        // Packet count never advances: simulated stall

        let mut mon = monitor(control.clone());
        mon.spawn();

        // Two ticks: stale counter builds, no restart yet
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(control.capture_starts.load(Ordering::SeqCst), 0);

        // Third tick crosses the threshold (plus the 500ms restart delay)
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(control.capture_stops.load(Ordering::SeqCst), 1);
        assert_eq!(control.capture_starts.load(Ordering::SeqCst), 1);

        mon.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_advancing_packets_resets_stale_counter() {
        let control = MockControl::streaming();
        control.clients.store(1, Ordering::SeqCst);

        let mut mon = monitor(control.clone());
        mon.spawn();

        // Advance packet count before every tick: never stale
        for _ in 0..6 {
            control.packets.fetch_add(100, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        assert_eq!(control.capture_starts.load(Ordering::SeqCst), 0);
        mon.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_restart_without_clients() {
        let control = MockControl::streaming();
        // Zero clients: a frozen packet count is expected, not a stall

        let mut mon = monitor(control.clone());
        mon.spawn();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(control.capture_starts.load(Ordering::SeqCst), 0);

        mon.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_capture_restarted_immediately() {
        let control = MockControl::streaming();
        control.capture_active.store(false, Ordering::SeqCst);

        let mut mon = monitor(control.clone());
        mon.spawn();

        // One tick is enough; no stale counting involved
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(control.capture_starts.load(Ordering::SeqCst), 1);
        assert!(control.is_capture_active());

        mon.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_engine_is_left_alone() {
        let control = Arc::new(MockControl::default());

        let mut mon = monitor(control.clone());
        mon.spawn();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(control.capture_starts.load(Ordering::SeqCst), 0);
        assert_eq!(control.full_starts.load(Ordering::SeqCst), 0);

        mon.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_resume_cycle() {
        let control = MockControl::streaming();

        let mut mon = monitor(control.clone());
        let power = mon.power_sender();
        mon.spawn();

        power.send(PowerEvent::Suspend).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(control.full_stops.load(Ordering::SeqCst), 1);
        assert!(!control.is_running());

        power.send(PowerEvent::Resume).await.unwrap();
        // Restart happens only after the wake delay
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(control.full_starts.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(control.full_starts.load(Ordering::SeqCst), 1);
        assert!(control.is_running());

        mon.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_without_prior_running_does_nothing() {
        let control = Arc::new(MockControl::default());

        let mut mon = monitor(control.clone());
        let power = mon.power_sender();
        mon.spawn();

        power.send(PowerEvent::Resume).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(control.full_starts.load(Ordering::SeqCst), 0);

        mon.stop();
    }
}
