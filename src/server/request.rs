//! HTTP request-head parsing and response building
//!
//! The transport serves exactly four routes plus the WebSocket upgrade, so a
//! tiny hand parser beats a framework: we only need the method, the path,
//! and case-insensitive header lookup on the first request of a connection.

use bytes::Bytes;

/// A parsed HTTP request head
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head from raw bytes up to and including the blank
    /// line. Returns `None` for anything that is not recognizably HTTP.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let head = match text.find("\r\n\r\n") {
            Some(end) => &text[..end],
            None => text,
        };

        let mut lines = head.lines();
        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();
        parts.next()?; // HTTP version must be present

        let headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_ascii_lowercase(), value.trim().to_string()))
            })
            .collect();

        Some(Self {
            method,
            path,
            headers,
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether this request asks for a WebSocket upgrade
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// The client's WebSocket key, if present and non-empty
    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// `200 OK` HTML document response, connection closed afterwards
pub fn html_response(body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        body.len(),
        body
    ))
}

/// `200 OK` JSON liveness body for `/health`
pub fn health_response() -> Bytes {
    let body = serde_json::json!({ "status": "ok" }).to_string();
    Bytes::from(format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        body.len(),
        body
    ))
}

/// `404 Not Found`
pub fn not_found_response() -> Bytes {
    Bytes::from_static(
        b"HTTP/1.1 404 Not Found\r\n\
          Content-Length: 0\r\n\
          Connection: close\r\n\
          \r\n",
    )
}

/// Headers opening the raw-byte fallback stream; the connection stays open
/// and packet bytes follow with no added framing
pub fn stream_headers() -> Bytes {
    Bytes::from_static(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: application/octet-stream\r\n\
          Cache-Control: no-store\r\n\
          Connection: keep-alive\r\n\
          \r\n",
    )
}

/// `101 Switching Protocols` completing the WebSocket handshake
pub fn upgrade_response(accept: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept
    ))
}
