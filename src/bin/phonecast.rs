//! Phonecast server binary
//!
//! Binds the stream server, starts system-audio capture, and serves the
//! browser player. Point a phone browser at the printed URL.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phonecast::audio::CpalCaptureSource;
use phonecast::config::AppConfig;
use phonecast::AudioEngine;

/// Browser player served at `/`. Connects over WebSocket, falls back to the
/// raw `/stream` endpoint, and plays the float32 packets through WebAudio.
/// The engine treats this as an opaque document; any other player page
/// honoring the wire format works the same.
const PLAYER_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Phonecast</title>
<style>
  body { font-family: sans-serif; background: #111; color: #eee;
         display: flex; flex-direction: column; align-items: center;
         justify-content: center; height: 100vh; margin: 0; }
  button { font-size: 1.4rem; padding: 1rem 2.5rem; border-radius: 8px;
           border: none; background: #2a7; color: #fff; }
  #status { margin-top: 1rem; color: #888; }
</style>
</head>
<body>
<button id="play">&#9654; Listen</button>
<div id="status">stopped</div>
<script>
const HEADER_LEN = 16;
const status = document.getElementById('status');
let ctx, nextTime = 0;

function playPacket(buf) {
  const view = new DataView(buf);
  const sampleRate = view.getUint32(8, true);
  const channels = view.getUint16(12, true);
  const frames = view.getUint16(14, true);
  const samples = new Float32Array(buf, HEADER_LEN, frames * channels);

  const audio = ctx.createBuffer(channels, frames, sampleRate);
  for (let ch = 0; ch < channels; ch++) {
    const data = audio.getChannelData(ch);
    for (let i = 0; i < frames; i++) data[i] = samples[i * channels + ch];
  }
  const node = ctx.createBufferSource();
  node.buffer = audio;
  node.connect(ctx.destination);
  if (nextTime < ctx.currentTime) nextTime = ctx.currentTime + 0.05;
  node.start(nextTime);
  nextTime += frames / sampleRate;
}

async function streamFallback() {
  status.textContent = 'streaming (http)';
  const resp = await fetch('/stream');
  const reader = resp.body.getReader();
  let pending = new Uint8Array(0);
  for (;;) {
    const { value, done } = await reader.read();
    if (done) break;
    const merged = new Uint8Array(pending.length + value.length);
    merged.set(pending); merged.set(value, pending.length);
    let offset = 0;
    while (merged.length - offset >= HEADER_LEN) {
      const view = new DataView(merged.buffer, offset);
      const size = HEADER_LEN + view.getUint16(14, true) * view.getUint16(12, true) * 4;
      if (merged.length - offset < size) break;
      playPacket(merged.slice(offset, offset + size).buffer);
      offset += size;
    }
    pending = merged.slice(offset);
  }
  status.textContent = 'stopped';
}

function start() {
  ctx = new (window.AudioContext || window.webkitAudioContext)();
  // Some mobile WebSocket stacks are unreliable on LAN hostnames
  const flaky = /CriOS|FxiOS/.test(navigator.userAgent);
  if (flaky) { streamFallback(); return; }

  const ws = new WebSocket('ws://' + location.host + '/');
  ws.binaryType = 'arraybuffer';
  ws.onopen = () => { status.textContent = 'streaming (websocket)'; };
  ws.onmessage = (ev) => playPacket(ev.data);
  ws.onerror = () => streamFallback();
  ws.onclose = () => { status.textContent = 'stopped'; };
}

document.getElementById('play').addEventListener('click', start);
</script>
</body>
</html>
"#;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting phonecast");

    let mut config = AppConfig::load()?;
    if let Some(port) = std::env::args().nth(1) {
        config.server.port = port.parse()?;
    }

    let source = CpalCaptureSource::new(config.capture.device.clone());
    let engine = AudioEngine::new(config, Box::new(source));
    engine.set_document(PLAYER_HTML.to_string());

    let port = match engine.start() {
        Ok(port) => port,
        Err(e) => {
            // A missing capture device is not fatal: the watchdog keeps
            // retrying while the server stays reachable
            tracing::warn!("engine started degraded: {}", e);
            engine.actual_port().ok_or(e)?
        }
    };

    println!();
    println!("  Phonecast is running.");
    println!("  Open http://<this-machine>:{}/ on your phone", port);
    println!();

    let mut clients = engine.client_count_watch();
    tokio::spawn(async move {
        while clients.changed().await.is_ok() {
            tracing::info!(clients = *clients.borrow(), "client count changed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    engine.stop();

    Ok(())
}
