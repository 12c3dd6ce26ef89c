//! Framed-JSON wire codec.
//!
//! Every message in either direction is a 4-byte little-endian length
//! followed by that many bytes of UTF-8 JSON. Framing is assembled by hand;
//! the JSON bodies ride on `serde`.

use serde::{Deserialize, Serialize};

/// Frame payload ceiling unless overridden by configuration.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Stable error codes carried in `error` events.
pub mod codes {
    /// Frame header declared a zero-length payload.
    pub const PROTO_INVALID_LEN: &str = "E_PROTO_INVALID_LEN";
    /// Frame header declared a payload above the configured ceiling.
    pub const PROTO_FRAME_TOO_LARGE: &str = "E_PROTO_FRAME_TOO_LARGE";
    /// Body is not valid JSON (bad escape, raw control byte, bad UTF-8).
    pub const PROTO_INVALID_UTF8: &str = "E_PROTO_001";
    /// Body parsed but is not a usable request.
    pub const PROTO_BAD_REQUEST: &str = "E_PROTO_BAD_REQUEST";
    /// Prompt exceeds the per-request byte limit.
    pub const LIMIT_PROMPT: &str = "E_LIMIT_001";
    /// The runtime reported a decode failure for a batch this request was in.
    pub const RUNTIME_DECODE: &str = "E_RUNTIME_DECODE";
}

/// Why a frame could not be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    InvalidLen,
    FrameTooLarge,
}

/// Outcome of one [`try_read_frame`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameRead {
    /// Fewer than `4 + len` bytes buffered; nothing consumed.
    Incomplete,
    /// One complete payload, removed from the buffer.
    Frame(Vec<u8>),
    /// Malformed header; nothing consumed, connection should close.
    Fail(FrameError),
}

/// Try to extract exactly one frame from the front of `rx`.
pub fn try_read_frame(rx: &mut Vec<u8>, max_frame_bytes: usize) -> FrameRead {
    if rx.len() < 4 {
        return FrameRead::Incomplete;
    }
    let len = u32::from_le_bytes([rx[0], rx[1], rx[2], rx[3]]) as usize;
    if len == 0 {
        return FrameRead::Fail(FrameError::InvalidLen);
    }
    if len > max_frame_bytes {
        return FrameRead::Fail(FrameError::FrameTooLarge);
    }
    if rx.len() < 4 + len {
        return FrameRead::Incomplete;
    }
    let payload = rx[4..4 + len].to_vec();
    rx.drain(..4 + len);
    FrameRead::Frame(payload)
}

/// Append a length-prefixed frame to `tx`.
pub fn write_frame(tx: &mut Vec<u8>, payload: &[u8]) {
    tx.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    tx.extend_from_slice(payload);
}

/// A client request. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct Request {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<i32>,
}

impl Request {
    /// `{"type":"metrics"}` and `{"event":"metrics"}` both ask for the
    /// one-shot admin snapshot.
    pub fn is_metrics(&self) -> bool {
        self.kind.as_deref() == Some("metrics") || self.event.as_deref() == Some("metrics")
    }
}

#[derive(Serialize)]
struct TokenEvent<'a> {
    id: &'a str,
    event: &'static str,
    text: &'a str,
    token_id: i32,
}

#[derive(Serialize)]
struct EosEvent<'a> {
    id: &'a str,
    event: &'static str,
    reason: &'a str,
}

#[derive(Serialize)]
struct ErrorEvent<'a> {
    id: &'a str,
    event: &'static str,
    code: &'a str,
    message: &'a str,
}

fn append_event<T: Serialize>(tx: &mut Vec<u8>, ev: &T) {
    let payload = serde_json::to_vec(ev).unwrap_or_default();
    write_frame(tx, &payload);
}

/// Append a framed `token` event.
pub fn append_token_event(tx: &mut Vec<u8>, id: &str, text: &str, token_id: i32) {
    append_event(
        tx,
        &TokenEvent {
            id,
            event: "token",
            text,
            token_id,
        },
    );
}

/// Append a framed `eos` event.
pub fn append_eos_event(tx: &mut Vec<u8>, id: &str, reason: &str) {
    append_event(
        tx,
        &EosEvent {
            id,
            event: "eos",
            reason,
        },
    );
}

/// Append a framed `error` event.
pub fn append_error_event(tx: &mut Vec<u8>, id: &str, code: &str, message: &str) {
    append_event(
        tx,
        &ErrorEvent {
            id,
            event: "error",
            code,
            message,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_frames_round_trip_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"a\":1}");
        write_frame(&mut buf, b"{\"b\":2}");

        assert_eq!(
            try_read_frame(&mut buf, DEFAULT_MAX_FRAME_BYTES),
            FrameRead::Frame(b"{\"a\":1}".to_vec())
        );
        assert_eq!(
            try_read_frame(&mut buf, DEFAULT_MAX_FRAME_BYTES),
            FrameRead::Frame(b"{\"b\":2}".to_vec())
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_header_is_rejected() {
        let mut buf = vec![0, 0, 0, 0];
        assert_eq!(
            try_read_frame(&mut buf, DEFAULT_MAX_FRAME_BYTES),
            FrameRead::Fail(FrameError::InvalidLen)
        );
    }

    #[test]
    fn oversize_header_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(9u32).to_le_bytes());
        buf.extend_from_slice(b"123456789");
        assert_eq!(
            try_read_frame(&mut buf, 8),
            FrameRead::Fail(FrameError::FrameTooLarge)
        );
    }

    #[test]
    fn short_buffer_is_incomplete_and_untouched() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello");
        let full = buf.clone();

        let mut partial = full[..3].to_vec();
        assert_eq!(
            try_read_frame(&mut partial, DEFAULT_MAX_FRAME_BYTES),
            FrameRead::Incomplete
        );
        assert_eq!(partial, &full[..3]);

        let mut partial = full[..full.len() - 1].to_vec();
        assert_eq!(
            try_read_frame(&mut partial, DEFAULT_MAX_FRAME_BYTES),
            FrameRead::Incomplete
        );
        assert_eq!(partial.len(), full.len() - 1);
    }

    #[test]
    fn request_ignores_unknown_fields() {
        let req: Request =
            serde_json::from_str(r#"{"id":"r1","prompt":"hi","nope":42}"#).unwrap();
        assert_eq!(req.id.as_deref(), Some("r1"));
        assert_eq!(req.prompt.as_deref(), Some("hi"));
        assert!(!req.is_metrics());
    }

    #[test]
    fn metrics_request_matches_both_spellings() {
        let a: Request = serde_json::from_str(r#"{"type":"metrics"}"#).unwrap();
        let b: Request = serde_json::from_str(r#"{"event":"metrics"}"#).unwrap();
        assert!(a.is_metrics());
        assert!(b.is_metrics());
    }

    #[test]
    fn control_bytes_in_strings_fail_to_parse() {
        let raw = b"{\"id\":\"a\x01b\",\"prompt\":\"x\"}";
        assert!(serde_json::from_slice::<Request>(raw).is_err());
    }

    #[test]
    fn unsupported_escape_fails_to_parse() {
        let raw = br#"{"id":"a\xZZ","prompt":"x"}"#;
        assert!(serde_json::from_slice::<Request>(raw).is_err());
    }

    #[test]
    fn token_event_escapes_text() {
        let mut tx = Vec::new();
        append_token_event(&mut tx, "r1", "a\"b\n", 7);
        let FrameRead::Frame(payload) = try_read_frame(&mut tx, DEFAULT_MAX_FRAME_BYTES) else {
            panic!("expected one frame");
        };
        let v: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(v["event"], "token");
        assert_eq!(v["text"], "a\"b\n");
        assert_eq!(v["token_id"], 7);
    }
}
