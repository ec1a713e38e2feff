//! # Phonecast
//!
//! Streams the host machine's system audio to any phone browser over the
//! local network. No app is required on the receiving side: the host serves
//! an HTML player and broadcasts fixed-size binary audio packets to every
//! connected client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            HOST PC                               │
//! │  ┌──────────────┐                                                │
//! │  │ System Audio │  interleaved f32, device rate/channels         │
//! │  │  (capture)   │                                                │
//! │  └──────┬───────┘                                                │
//! │         │ bounded channel (capture thread → pipeline thread)     │
//! │         ▼                                                        │
//! │  ┌──────────────┐    ┌──────────────┐    ┌───────────────────┐   │
//! │  │  Resampler   │───▶│  Packetizer  │───▶│  StreamTransport  │   │
//! │  │ 48kHz stereo │    │ 128-frame    │    │  one TCP port:    │   │
//! │  │ linear interp│    │ packets with │    │  HTTP + WebSocket │   │
//! │  └──────────────┘    │ seq numbers  │    │  + /stream bytes  │   │
//! │                      └──────────────┘    └─────────┬─────────┘   │
//! │  ┌───────────────┐                                 │             │
//! │  │ HealthMonitor │◀── packet totals, client count ─┘             │
//! │  │ 5s watchdog   │──── restart capture on stall                  │
//! │  └───────────────┘                                               │
//! └──────────────────────────────────┬───────────────────────────────┘
//!                                    │ LAN (WebSocket or raw HTTP)
//!                         ┌──────────▼──────────┐
//!                         │   Phone browsers    │
//!                         └─────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod protocol;
pub mod server;

pub use engine::AudioEngine;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Target sample rate every client receives
    pub const TARGET_SAMPLE_RATE: u32 = 48_000;

    /// Target channel count (stereo)
    pub const TARGET_CHANNELS: u16 = 2;

    /// Frames carried by one audio packet (~2.67 ms at 48 kHz)
    pub const FRAMES_PER_PACKET: u16 = 128;

    /// Default TCP port for the combined HTTP/WebSocket server
    pub const DEFAULT_PORT: u16 = 19_621;

    /// Number of ports tried starting at the configured base port
    pub const PORT_SCAN_RANGE: u16 = 10;

    /// Health watchdog tick interval in seconds
    pub const HEALTH_TICK_SECS: u64 = 5;

    /// Consecutive stale ticks tolerated before capture is restarted
    pub const STALE_TICKS_BEFORE_RESTART: u8 = 3;

    /// Delay between stopping and restarting capture, letting the device release
    pub const CAPTURE_RESTART_DELAY_MS: u64 = 500;

    /// Delay after system wake before the pipeline is rebuilt
    pub const WAKE_RESTART_DELAY_MS: u64 = 2_000;

    /// Capacity of the capture-thread → pipeline bounded channel (in chunks)
    pub const CAPTURE_CHANNEL_CAPACITY: usize = 64;

    /// Capacity of each client's outbound packet queue
    pub const CLIENT_QUEUE_CAPACITY: usize = 256;

    /// Maximum bytes read while parsing an incoming request head
    pub const MAX_REQUEST_HEAD: usize = 8 * 1024;

    /// Maximum bytes buffered while reading a client's WebSocket frames.
    /// Clients only ever send control frames (at most 125 bytes of payload);
    /// a frame that outgrows this is abuse and drops the connection.
    pub const MAX_WS_READ_BUFFER: usize = 4 * 1024;
}
