//! Wire protocol for fetching base VMs from a remote VM cache.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte type][4-byte seq][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (type + seq + payload)
//! - **type**: u8 message type
//! - **seq**: big-endian u32, echoed by the server in its reply
//! - **payload**: JSON for result messages, empty for requests
//!
//! ## Message Types
//!
//! | Type | Direction | Name          | Payload |
//! |------|-----------|---------------|---------|
//! | 0x01 | C→S       | config        | (empty) |
//! | 0x02 | S→C       | config_result | JSON `VmConfig` |
//! | 0x03 | C→S       | get_base_vm   | (empty) |
//! | 0x04 | S→C       | base_vm       | JSON `VmInfo` |
//! | 0x05 | C→S       | status        | (empty) |
//! | 0x06 | S→C       | status_result | JSON `{pid, vms}` |
//! | 0x07 | C→S       | quit          | (empty) |
//! | 0x08 | S→C       | quit_ack      | (empty) |
//! | 0xFF | S→C       | error         | `[2B error_len][error]` |

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Minimum body size: type (1) + seq (4).
pub const MIN_BODY_SIZE: usize = 5;

pub const MSG_CONFIG: u8 = 0x01;
pub const MSG_CONFIG_RESULT: u8 = 0x02;
pub const MSG_GET_BASE_VM: u8 = 0x03;
pub const MSG_BASE_VM: u8 = 0x04;
pub const MSG_STATUS: u8 = 0x05;
pub const MSG_STATUS_RESULT: u8 = 0x06;
pub const MSG_QUIT: u8 = 0x07;
pub const MSG_QUIT_ACK: u8 = 0x08;
pub const MSG_ERROR: u8 = 0xFF;

/// Human-readable name of a message type, for logs and errors.
pub fn message_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_CONFIG => "config",
        MSG_CONFIG_RESULT => "config_result",
        MSG_GET_BASE_VM => "get_base_vm",
        MSG_BASE_VM => "base_vm",
        MSG_STATUS => "status",
        MSG_STATUS_RESULT => "status_result",
        MSG_QUIT => "quit",
        MSG_QUIT_ACK => "quit_ack",
        MSG_ERROR => "error",
        _ => "unknown",
    }
}

/// Protocol error.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(&'static str),
    Json(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::MessageTooSmall(size) => write!(f, "message too small: {size}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::Json(msg) => write!(f, "invalid json payload: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Read a `u8` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

/// Read a `u16` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A raw decoded message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msg_type: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a raw message: `[4-byte length][1-byte type][4-byte seq][payload]`.
pub fn encode(msg_type: u8, seq: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = 1 + 4 + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(msg_type);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a message whose payload is `value` serialized as JSON.
pub fn encode_json<T: Serialize>(
    msg_type: u8,
    seq: u32,
    value: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(value).map_err(|e| ProtocolError::Json(e.to_string()))?;
    encode(msg_type, seq, &payload)
}

/// Encode error payload: `[2B error_len][error]`.
///
/// Error message is truncated to at most 65535 bytes if longer, on a
/// character boundary.
pub fn encode_error(message: &str) -> Vec<u8> {
    let mut end = message.len().min(u16::MAX as usize);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    // end is a char boundary within message
    let msg = message.get(..end).unwrap_or_default().as_bytes();
    let mut p = Vec::with_capacity(2 + msg.len());
    p.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    p.extend_from_slice(msg);
    p
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode a JSON payload.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Decode error payload: `[2B error_len][error]`.
pub fn decode_error(payload: &[u8]) -> Result<&str, ProtocolError> {
    let msg_len = read_u16_at(payload, 0)
        .ok_or(ProtocolError::InvalidPayload("error too short"))? as usize;
    std::str::from_utf8(
        payload
            .get(2..2 + msg_len)
            .ok_or(ProtocolError::InvalidPayload("error message truncated"))?,
    )
    .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in error"))
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered message decoder for streaming data.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(16 * 1024),
        }
    }

    /// Feed data and extract complete messages.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_MESSAGE_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let (Some(msg_type), Some(seq)) = (
                read_u8_at(&self.buf, offset + HEADER_SIZE),
                read_u32_at(&self.buf, offset + HEADER_SIZE + 1),
            ) else {
                break;
            };
            let payload = self
                .buf
                .get(offset + HEADER_SIZE + MIN_BODY_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();

            messages.push(RawMessage {
                msg_type,
                seq,
                payload,
            });
            offset += total;
        }

        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(messages)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
