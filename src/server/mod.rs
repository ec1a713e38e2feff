//! Combined HTTP + WebSocket stream server
//!
//! One TCP port multiplexes three behaviors: plain HTTP document requests,
//! WebSocket upgrade with binary packet broadcast, and a raw-byte HTTP
//! stream fallback for browsers whose WebSocket stack misbehaves on local
//! networks.
//!
//! Client membership lives behind a single lock. Each connection gets a
//! bounded outbound queue drained by its own writer task, so one slow or
//! dead client never delays the others: `broadcast` serializes a packet once
//! and does a non-blocking send to every queue.

pub mod request;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::constants::{
    CLIENT_QUEUE_CAPACITY, MAX_REQUEST_HEAD, MAX_WS_READ_BUFFER, PORT_SCAN_RANGE,
};
use crate::error::TransportError;
use crate::protocol::{ws, AudioPacket};
use crate::server::request::RequestHead;

/// Broadcast totals are logged every this many packets (~2.7 s of audio)
const STATS_LOG_INTERVAL: u64 = 1_000;

/// How a client receives packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    WebSocket,
    HttpStream,
}

struct ClientHandle {
    kind: ClientKind,
    tx: mpsc::Sender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

/// Server runtime state, mutated only under the transport's internal lock
struct ServerState {
    running: bool,
    bound_port: Option<u16>,
    clients: HashMap<Uuid, ClientHandle>,
    accept_task: Option<JoinHandle<()>>,
}

struct Inner {
    base_port: u16,
    port_range: u16,
    document: RwLock<String>,
    state: Mutex<ServerState>,
    client_count_tx: watch::Sender<usize>,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Transport statistics snapshot
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub clients: usize,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// The combined HTTP/WebSocket/raw-stream server
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<Inner>,
}

impl StreamTransport {
    /// Create a transport that will scan `base_port..base_port+PORT_SCAN_RANGE`
    pub fn new(base_port: u16) -> Self {
        Self::with_range(base_port, PORT_SCAN_RANGE)
    }

    pub fn with_range(base_port: u16, port_range: u16) -> Self {
        let (client_count_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                base_port,
                port_range,
                document: RwLock::new(String::new()),
                state: Mutex::new(ServerState {
                    running: false,
                    bound_port: None,
                    clients: HashMap::new(),
                    accept_task: None,
                }),
                client_count_tx,
                packets_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Set the HTML document served at `/` and `/index.html`
    pub fn set_document(&self, html: String) {
        *self.inner.document.write() = html;
    }

    /// Bind a port and begin accepting connections. Idempotent: a second
    /// call while running returns the already-bound port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<u16, TransportError> {
        {
            let state = self.inner.state.lock();
            if state.running {
                return Ok(state.bound_port.unwrap_or(self.inner.base_port));
            }
        }

        let (listener, port) = bind_scan(self.inner.base_port, self.inner.port_range)?;
        tracing::info!(port, "stream server listening");

        // Counters describe the current run
        self.inner.packets_sent.store(0, Ordering::Relaxed);
        self.inner.bytes_sent.store(0, Ordering::Relaxed);

        let accept_task = tokio::spawn(accept_loop(self.inner.clone(), listener));

        let mut state = self.inner.state.lock();
        state.running = true;
        state.bound_port = Some(port);
        state.accept_task = Some(accept_task);

        Ok(port)
    }

    /// Stop accepting, close every client, and clear membership. Idempotent.
    pub fn stop(&self) {
        let (accept_task, clients) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.bound_port = None;
            (
                state.accept_task.take(),
                state.clients.drain().collect::<Vec<_>>(),
            )
        };

        if let Some(task) = accept_task {
            task.abort();
        }
        for (_, client) in clients {
            for task in client.tasks {
                task.abort();
            }
            // Dropping the sender ends the writer task and closes the socket
        }

        self.inner.client_count_tx.send_replace(0);
        tracing::info!("stream server stopped");
    }

    /// The port actually bound, once running
    pub fn actual_port(&self) -> Option<u16> {
        self.inner.state.lock().bound_port
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Connected clients, WebSocket and HTTP-stream combined
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.len()
    }

    /// Watch channel firing on every client add/remove
    pub fn client_count_watch(&self) -> watch::Receiver<usize> {
        self.inner.client_count_tx.subscribe()
    }

    /// Total packets handed to `broadcast` since the server last started
    pub fn packets_sent(&self) -> u64 {
        self.inner.packets_sent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            clients: self.client_count(),
            packets_sent: self.inner.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Send one packet to every connected client.
    ///
    /// The packet is serialized once; each client gets a non-blocking push
    /// onto its queue. A closed queue removes that client, a full queue
    /// drops the packet for that client only. Callable from any thread.
    pub fn broadcast(&self, packet: &AudioPacket) {
        let raw = packet.encode();
        let framed = ws::binary_frame(&raw);

        let total = self.inner.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;

        let mut dead = Vec::new();
        {
            let state = self.inner.state.lock();
            for (id, client) in &state.clients {
                let bytes = match client.kind {
                    ClientKind::WebSocket => framed.clone(),
                    ClientKind::HttpStream => raw.clone(),
                };
                let len = bytes.len() as u64;
                match client.tx.try_send(bytes) {
                    Ok(()) => {
                        self.inner.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow client: drop this packet for them only
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }

        for id in dead {
            remove_client(&self.inner, id);
        }

        if total % STATS_LOG_INTERVAL == 0 {
            tracing::info!(
                packets = total,
                bytes = self.inner.bytes_sent.load(Ordering::Relaxed),
                clients = self.client_count(),
                "broadcast totals"
            );
        }
    }
}

/// Try `base..base+range` in order; first successful bind wins
fn bind_scan(base: u16, range: u16) -> Result<(TcpListener, u16), TransportError> {
    for offset in 0..range {
        let port = match base.checked_add(offset) {
            Some(port) => port,
            None => break,
        };
        match std::net::TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .map_err(|e| TransportError::BindFailed(e.to_string()))?;
                let listener = TcpListener::from_std(listener)
                    .map_err(|e| TransportError::BindFailed(e.to_string()))?;
                return Ok((listener, port));
            }
            Err(e) => {
                tracing::debug!(port, "bind failed: {}", e);
            }
        }
    }

    Err(TransportError::PortExhausted { base, range })
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(inner, stream).await {
                        tracing::debug!(%peer, "connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read the request head, then dispatch to HTTP routing or the WebSocket
/// handshake. Bytes pipelined after the head are handed on to the
/// WebSocket reader, not discarded.
async fn handle_connection(inner: Arc<Inner>, mut stream: TcpStream) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);

    let mut buf = BytesMut::with_capacity(1024);
    let head_end = loop {
        if buf.len() >= MAX_REQUEST_HEAD {
            return Err(TransportError::ConnectionFailed("request head too large".into()));
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if n == 0 {
            return Ok(());
        }
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let remainder = buf.split_off(head_end);
    let head = match RequestHead::parse(&buf) {
        Some(head) => head,
        None => return Ok(()),
    };

    if head.is_websocket_upgrade() {
        handle_websocket(inner, stream, &head, remainder).await
    } else {
        handle_http(inner, stream, &head).await
    }
}

async fn handle_http(
    inner: Arc<Inner>,
    mut stream: TcpStream,
    head: &RequestHead,
) -> Result<(), TransportError> {
    let send = |e: std::io::Error| TransportError::SendFailed(e.to_string());

    if head.method != "GET" {
        stream
            .write_all(&request::not_found_response())
            .await
            .map_err(send)?;
        return Ok(());
    }

    match head.path.as_str() {
        "/" | "/index.html" => {
            let body = inner.document.read().clone();
            stream
                .write_all(&request::html_response(&body))
                .await
                .map_err(send)?;
        }
        "/health" => {
            stream
                .write_all(&request::health_response())
                .await
                .map_err(send)?;
        }
        "/stream" => {
            stream
                .write_all(&request::stream_headers())
                .await
                .map_err(send)?;
            stream.flush().await.map_err(send)?;
            register_stream_client(inner, stream);
            return Ok(());
        }
        _ => {
            stream
                .write_all(&request::not_found_response())
                .await
                .map_err(send)?;
        }
    }

    stream.shutdown().await.ok();
    Ok(())
}

/// Raw fallback: hold the connection open and pump packet bytes with no
/// added framing
fn register_stream_client(inner: Arc<Inner>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_CAPACITY);
    let id = Uuid::new_v4();

    let writer = tokio::spawn(client_writer(inner.clone(), id, rx, write_half));
    // The fallback never expects more request bytes; the reader only exists
    // to notice the peer hanging up
    let reader = tokio::spawn(drain_until_closed(inner.clone(), id, read_half));

    add_client(&inner, id, ClientKind::HttpStream, tx, vec![writer, reader]);
}

async fn handle_websocket(
    inner: Arc<Inner>,
    mut stream: TcpStream,
    head: &RequestHead,
    remainder: BytesMut,
) -> Result<(), TransportError> {
    let key = match head.websocket_key() {
        Some(key) => key,
        None => {
            // Close without a response; the accept loop logs the error
            return Err(TransportError::MalformedUpgradeRequest);
        }
    };

    let accept = ws::accept_key(key);
    stream
        .write_all(&request::upgrade_response(&accept))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_CAPACITY);
    let id = Uuid::new_v4();

    let writer = tokio::spawn(client_writer(inner.clone(), id, rx, write_half));
    let reader = tokio::spawn(websocket_reader(
        inner.clone(),
        id,
        tx.clone(),
        read_half,
        remainder,
    ));

    add_client(&inner, id, ClientKind::WebSocket, tx, vec![writer, reader]);
    Ok(())
}

/// Drain a client's queue onto its socket; any write error removes the client
async fn client_writer(
    inner: Arc<Inner>,
    id: Uuid,
    mut rx: mpsc::Receiver<Bytes>,
    mut write_half: OwnedWriteHalf,
) {
    while let Some(bytes) = rx.recv().await {
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
    write_half.shutdown().await.ok();
    remove_client(&inner, id);
}

/// Read and answer WebSocket control frames until close or error.
///
/// Starts from any bytes that arrived pipelined behind the upgrade request.
/// The buffer is capped: clients only send control frames, so a partial
/// frame that keeps growing past the cap drops the connection instead of
/// accumulating.
async fn websocket_reader(
    inner: Arc<Inner>,
    id: Uuid,
    tx: mpsc::Sender<Bytes>,
    mut read_half: OwnedReadHalf,
    mut buf: BytesMut,
) {
    'outer: loop {
        while let Some((frame, consumed)) = ws::decode_client_frame(&buf) {
            let _ = buf.split_to(consumed);
            match frame {
                ws::ClientFrame::Close => {
                    let _ = tx.try_send(ws::close_frame());
                    break 'outer;
                }
                ws::ClientFrame::Ping => {
                    let _ = tx.try_send(ws::pong_frame());
                }
                ws::ClientFrame::Pong | ws::ClientFrame::Other => {}
            }
        }

        if buf.len() > MAX_WS_READ_BUFFER {
            tracing::warn!(
                client = %id,
                buffered = buf.len(),
                "oversized client frame, disconnecting"
            );
            break;
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    remove_client(&inner, id);
}

/// Watch a fallback client's read side so a hangup is noticed even when no
/// packets are flowing
async fn drain_until_closed(inner: Arc<Inner>, id: Uuid, mut read_half: OwnedReadHalf) {
    let mut scratch = [0u8; 512];
    loop {
        match read_half.read(&mut scratch).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {} // pipelined bytes from fallback clients are ignored
        }
    }
    remove_client(&inner, id);
}

fn add_client(
    inner: &Arc<Inner>,
    id: Uuid,
    kind: ClientKind,
    tx: mpsc::Sender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
) {
    let count = {
        let mut state = inner.state.lock();
        if !state.running {
            // Raced with stop(): drop the connection instead of leaking it
            for task in tasks {
                task.abort();
            }
            return;
        }
        state.clients.insert(id, ClientHandle { kind, tx, tasks });
        state.clients.len()
    };

    tracing::info!(client = %id, ?kind, count, "client connected");
    inner.client_count_tx.send_replace(count);
}

fn remove_client(inner: &Arc<Inner>, id: Uuid) {
    let count = {
        let mut state = inner.state.lock();
        match state.clients.remove(&id) {
            Some(_) => state.clients.len(),
            None => return,
        }
    };

    tracing::info!(client = %id, count, "client disconnected");
    inner.client_count_tx.send_replace(count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_PORT;
    use crate::protocol::{AudioPacket, StreamFormat, HEADER_LEN};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_packet(sequence: u32) -> AudioPacket {
        let format = StreamFormat::default();
        let samples = vec![0.5f32; format.samples_per_packet()];
        AudioPacket::from_samples(sequence, 1_000 + sequence, &format, &samples)
    }

    async fn connect(port: u16) -> TcpStream {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap()
    }

    /// Read until the end of the response head, returning it as text
    async fn read_head(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert!(n > 0, "connection closed before end of head");
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    async fn wait_for_clients(transport: &StreamTransport, count: usize) {
        for _ in 0..100 {
            if transport.client_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} clients, have {}",
            count,
            transport.client_count()
        );
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let transport = StreamTransport::new(40_110);

        let port = transport.start().unwrap();
        assert_eq!(transport.start().unwrap(), port);
        assert_eq!(transport.actual_port(), Some(port));

        transport.stop();
        assert!(!transport.is_running());
        assert_eq!(transport.actual_port(), None);
        transport.stop(); // second stop is a no-op
    }

    #[tokio::test]
    async fn test_port_fallback_to_next() {
        let base = 40_120;
        let _blocker = std::net::TcpListener::bind(("0.0.0.0", base)).unwrap();

        let transport = StreamTransport::new(base);
        let port = transport.start().unwrap();
        assert_eq!(port, base + 1);
        assert_eq!(transport.actual_port(), Some(base + 1));

        transport.stop();
    }

    #[tokio::test]
    async fn test_port_exhausted() {
        let base = 40_130;
        let _blockers: Vec<_> = (0..3)
            .map(|offset| std::net::TcpListener::bind(("0.0.0.0", base + offset)).unwrap())
            .collect();

        let transport = StreamTransport::with_range(base, 3);
        match transport.start() {
            Err(TransportError::PortExhausted { base: b, range }) => {
                assert_eq!(b, base);
                assert_eq!(range, 3);
            }
            other => panic!("expected PortExhausted, got {:?}", other.map(|_| ())),
        }
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_http_routes() {
        let transport = StreamTransport::new(40_140);
        transport.set_document("<html>player</html>".into());
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains(r#"{"status":"ok"}"#));

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.contains("text/html"));
        assert!(body.ends_with("<html>player</html>"));

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 404"));

        transport.stop();
    }

    #[tokio::test]
    async fn test_malformed_upgrade_closed_without_response() {
        let transport = StreamTransport::new(40_150);
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(transport.client_count(), 0);

        transport.stop();
    }

    #[tokio::test]
    async fn test_fallback_stream_receives_raw_packets() {
        let transport = StreamTransport::new(40_160);
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(head.contains("application/octet-stream"));
        assert!(head.contains("keep-alive"));
        assert!(!head.to_ascii_lowercase().contains("chunked"));

        wait_for_clients(&transport, 1).await;

        let packet = test_packet(0);
        transport.broadcast(&packet);

        let expected = packet.encode();
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], &expected[..]);

        transport.stop();
    }

    #[tokio::test]
    async fn test_websocket_end_to_end() {
        let transport = StreamTransport::new(DEFAULT_PORT);
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: x\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        wait_for_clients(&transport, 1).await;

        transport.broadcast(&test_packet(0));

        // 16-bit extended length frame: 0x82, 126, then the length big-endian
        let mut frame_head = [0u8; 4];
        stream.read_exact(&mut frame_head).await.unwrap();
        assert_eq!(frame_head[0], 0x82);
        assert_eq!(frame_head[1], 126);
        let payload_len = u16::from_be_bytes([frame_head[2], frame_head[3]]) as usize;
        assert_eq!(payload_len, HEADER_LEN + 1024);

        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await.unwrap();

        let packet = AudioPacket::decode(&payload).unwrap();
        assert_eq!(packet.sequence, 0);
        assert_eq!(packet.frame_count, 128);
        assert_eq!(packet.payload.len(), 1024);

        transport.stop();
    }

    #[tokio::test]
    async fn test_websocket_ping_gets_pong() {
        let transport = StreamTransport::new(40_170);
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(
                b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        read_head(&mut stream).await;
        wait_for_clients(&transport, 1).await;

        // Masked ping, empty payload
        stream
            .write_all(&[0x89, 0x80, 0x01, 0x02, 0x03, 0x04])
            .await
            .unwrap();

        let mut pong = [0u8; 2];
        stream.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x00]);

        transport.stop();
    }

    #[tokio::test]
    async fn test_websocket_close_removes_client() {
        let transport = StreamTransport::new(40_180);
        let port = transport.start().unwrap();
        let mut count_rx = transport.client_count_watch();

        let mut stream = connect(port).await;
        stream
            .write_all(
                b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        read_head(&mut stream).await;
        wait_for_clients(&transport, 1).await;

        // Masked close frame
        stream
            .write_all(&[0x88, 0x80, 0x01, 0x02, 0x03, 0x04])
            .await
            .unwrap();

        wait_for_clients(&transport, 0).await;
        count_rx.changed().await.unwrap();
        assert_eq!(*count_rx.borrow(), 0);

        transport.stop();
    }

    #[tokio::test]
    async fn test_client_isolation_on_disconnect() {
        let transport = StreamTransport::new(40_190);
        let port = transport.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut stream = connect(port).await;
            stream
                .write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            read_head(&mut stream).await;
            clients.push(stream);
        }
        wait_for_clients(&transport, 3).await;

        // Kill one client mid-session
        let victim = clients.remove(1);
        drop(victim);

        let packet_len = test_packet(0).encoded_len();
        for sequence in 0..5u32 {
            transport.broadcast(&test_packet(sequence));
        }

        // The two survivors get all five packets with unbroken sequences
        for stream in &mut clients {
            let mut received = vec![0u8; packet_len * 5];
            stream.read_exact(&mut received).await.unwrap();
            for (i, chunk) in received.chunks(packet_len).enumerate() {
                let packet = AudioPacket::decode(chunk).unwrap();
                assert_eq!(packet.sequence, i as u32);
            }
        }

        wait_for_clients(&transport, 2).await;
        transport.stop();
    }

    #[tokio::test]
    async fn test_broadcast_without_clients() {
        let transport = StreamTransport::new(40_200);
        transport.start().unwrap();

        transport.broadcast(&test_packet(0));
        assert_eq!(transport.packets_sent(), 1);

        transport.stop();
    }

    #[tokio::test]
    async fn test_counters_reset_on_restart() {
        let transport = StreamTransport::new(40_260);
        transport.start().unwrap();

        transport.broadcast(&test_packet(0));
        transport.broadcast(&test_packet(1));
        assert_eq!(transport.packets_sent(), 2);

        transport.stop();
        transport.start().unwrap();
        assert_eq!(transport.packets_sent(), 0);
        assert_eq!(transport.stats().bytes_sent, 0);

        transport.broadcast(&test_packet(0));
        assert_eq!(transport.packets_sent(), 1);

        transport.stop();
    }

    #[tokio::test]
    async fn test_oversized_client_frame_disconnects() {
        let transport = StreamTransport::new(40_270);
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(
                b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();
        read_head(&mut stream).await;
        wait_for_clients(&transport, 1).await;

        // Masked frame header claiming a 64 MiB payload, then garbage
        let mut frame = vec![0x82, 0xFF];
        frame.extend_from_slice(&(64u64 * 1024 * 1024).to_be_bytes());
        frame.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        stream.write_all(&frame).await.unwrap();
        stream.write_all(&[0u8; 8 * 1024]).await.unwrap();

        wait_for_clients(&transport, 0).await;

        let mut scratch = [0u8; 16];
        assert!(matches!(stream.read(&mut scratch).await, Ok(0) | Err(_)));

        transport.stop();
    }

    #[tokio::test]
    async fn test_pipelined_frame_after_upgrade_is_handled() {
        let transport = StreamTransport::new(40_280);
        let port = transport.start().unwrap();

        // Upgrade request and a masked ping arrive in one write
        let mut bytes = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
                          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
            .to_vec();
        bytes.extend_from_slice(&[0x89, 0x80, 0x01, 0x02, 0x03, 0x04]);

        let mut stream = connect(port).await;
        stream.write_all(&bytes).await.unwrap();

        let head = read_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"));

        let mut pong = [0u8; 2];
        stream.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8A, 0x00]);

        transport.stop();
    }

    #[tokio::test]
    async fn test_stats_track_delivered_bytes() {
        let transport = StreamTransport::new(40_290);
        let port = transport.start().unwrap();

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        read_head(&mut stream).await;
        wait_for_clients(&transport, 1).await;

        let packet_len = test_packet(0).encoded_len() as u64;
        transport.broadcast(&test_packet(0));
        transport.broadcast(&test_packet(1));

        let stats = transport.stats();
        assert_eq!(stats.clients, 1);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, packet_len * 2);

        transport.stop();
    }

    #[tokio::test]
    async fn test_stop_fires_final_zero_count() {
        let transport = StreamTransport::new(40_210);
        let port = transport.start().unwrap();
        let count_rx = transport.client_count_watch();

        let mut stream = connect(port).await;
        stream
            .write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        read_head(&mut stream).await;
        wait_for_clients(&transport, 1).await;

        transport.stop();
        assert_eq!(*count_rx.borrow(), 0);
        assert_eq!(transport.client_count(), 0);
    }
}
