//! Minimal server-side WebSocket support
//!
//! Only what the broadcast path needs: the RFC 6455 handshake accept key,
//! unmasked server→client frame encoding, and decoding of masked client
//! control frames (close, ping, pong). No extensions or subprotocols are
//! negotiated.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

/// Fixed GUID appended to the client key per RFC 6455
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const OPCODE_BINARY: u8 = 0x02;
const OPCODE_CLOSE: u8 = 0x08;
const OPCODE_PING: u8 = 0x09;
const OPCODE_PONG: u8 = 0x0A;

/// Derive the `Sec-WebSocket-Accept` value for a client's key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Encode a frame with the given opcode, FIN set, unmasked.
///
/// Server→client frames are never masked per the protocol. Extended payload
/// lengths are big-endian per RFC 6455.
fn encode_frame(opcode: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    buf.put_u8(0x80 | opcode);

    if payload.len() < 126 {
        buf.put_u8(payload.len() as u8);
    } else if payload.len() < 65_536 {
        buf.put_u8(126);
        buf.put_u16(payload.len() as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(payload.len() as u64);
    }

    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Wrap packet bytes in a single binary frame
pub fn binary_frame(payload: &[u8]) -> Bytes {
    encode_frame(OPCODE_BINARY, payload)
}

/// Empty pong frame, sent in reply to a client ping
pub fn pong_frame() -> Bytes {
    encode_frame(OPCODE_PONG, &[])
}

/// Empty close frame
pub fn close_frame() -> Bytes {
    encode_frame(OPCODE_CLOSE, &[])
}

/// A control frame received from a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrame {
    Close,
    Ping,
    Pong,
    /// Data or unknown frame; the broadcast path ignores its contents
    Other,
}

/// Try to decode one client frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it consumed, or `None` if the
/// buffer does not yet hold a complete frame. Client frames are masked;
/// payload bytes are skipped, not unmasked, since only the opcode matters
/// to the server.
pub fn decode_client_frame(buf: &[u8]) -> Option<(ClientFrame, usize)> {
    if buf.len() < 2 {
        return None;
    }

    let opcode = buf[0] & 0x0F;
    let masked = buf[1] & 0x80 != 0;
    let len7 = (buf[1] & 0x7F) as usize;

    let (payload_len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw) as usize, 10)
        }
        n => (n, 2),
    };

    if masked {
        offset += 4;
    }

    if buf.len() < offset + payload_len {
        return None;
    }

    let frame = match opcode {
        OPCODE_CLOSE => ClientFrame::Close,
        OPCODE_PING => ClientFrame::Ping,
        OPCODE_PONG => ClientFrame::Pong,
        _ => ClientFrame::Other,
    };

    Some((frame, offset + payload_len))
}
