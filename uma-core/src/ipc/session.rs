//! Per-connection session record and state machine.

use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::engine::{Pos, SeqId, Token};
use crate::sched::sampling::SamplingParams;

/// Where a session is in its request lifecycle.
///
/// The pending decode token travels inside the `Decode` variant, so
/// "in decode" and "has a token waiting to be fed" are the same fact and
/// cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for (the rest of) a framed request.
    RecvReq,
    /// Prompt tokens still being submitted to the runtime.
    Prefill,
    /// Steady-state generation; `pending` is fed on the next tick.
    Decode { pending: Token },
    /// Response fully produced; draining `tx`.
    Stream,
    /// A failure was queued for this client; close after flush.
    Errored,
}

/// Observability targets for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SloTargets {
    pub target_ttft_ms: u32,
    pub target_tbt_ms: u32,
}

/// One client connection.
pub struct Session {
    stream: UnixStream,
    pub fd: RawFd,
    /// Unparsed inbound bytes.
    pub rx: Vec<u8>,
    /// Outbound bytes not yet written.
    pub tx: Vec<u8>,
    pub state: SessionState,
    /// KV-cache sequence id; assigned on the first request, kept for the
    /// lifetime of the connection.
    pub seq: Option<SeqId>,
    pub prompt_tokens: Vec<Token>,
    /// Prompt tokens already submitted to the runtime.
    pub prefill_idx: usize,
    /// Positions established in the KV cache for the current request.
    pub n_past: Pos,
    /// Tokens emitted in steady-state decode for the current request.
    pub generated_count: u32,
    /// Per-request generation cap.
    pub max_tokens: u32,
    pub sampling: SamplingParams,
    /// Opaque id echoed back in every event.
    pub request_id: String,
    pub wants_stream: bool,
    /// Peer sent EOF; no further requests on this connection.
    pub read_closed: bool,
    pub last_activity_ns: u64,
    pub req_start_ns: u64,
    pub first_emit_ns: u64,
    pub last_emit_ns: u64,
    pub slo: SloTargets,
    /// Diagnostic for operator logs.
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(stream: UnixStream, now_ns: u64) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            rx: Vec::new(),
            tx: Vec::new(),
            state: SessionState::RecvReq,
            seq: None,
            prompt_tokens: Vec::new(),
            prefill_idx: 0,
            n_past: 0,
            generated_count: 0,
            max_tokens: 0,
            sampling: SamplingParams::default(),
            request_id: String::new(),
            wants_stream: true,
            read_closed: false,
            last_activity_ns: now_ns,
            req_start_ns: 0,
            first_emit_ns: 0,
            last_emit_ns: 0,
            slo: SloTargets::default(),
            last_error: None,
        }
    }

    pub fn stream(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Prompt tokens not yet submitted.
    pub fn prefill_remaining(&self) -> usize {
        self.prompt_tokens.len().saturating_sub(self.prefill_idx)
    }

    /// Ready for a decode slot this tick.
    pub fn decode_ready(&self) -> bool {
        matches!(self.state, SessionState::Decode { .. })
    }

    /// Ready for a prefill chunk this tick.
    pub fn prefill_ready(&self) -> bool {
        self.state == SessionState::Prefill && self.prefill_remaining() > 0
    }

    /// Work the scheduler could do right now (drives the poll timeout).
    pub fn has_ready_work(&self) -> bool {
        self.decode_ready() || self.prefill_ready()
    }

    /// Write as much of `tx` as the socket will take right now.
    ///
    /// Returns `Ok(true)` once `tx` is empty, `Ok(false)` when the kernel
    /// buffer is full; partial writes resume on the next writable event.
    pub fn flush_tx(&mut self) -> io::Result<bool> {
        while !self.tx.is_empty() {
            match self.stream.write(&self.tx) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.tx.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Back to `RecvReq` for the next request on a keep-alive connection.
    pub fn reset_for_next_request(&mut self) {
        self.state = SessionState::RecvReq;
        self.prompt_tokens.clear();
        self.prefill_idx = 0;
        self.generated_count = 0;
        self.n_past = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn fresh() -> Session {
        let (a, _b) = UnixStream::pair().unwrap();
        Session::new(a, 1)
    }

    #[test]
    fn starts_waiting_for_a_request() {
        let s = fresh();
        assert_eq!(s.state, SessionState::RecvReq);
        assert!(!s.has_ready_work());
        assert!(s.seq.is_none());
    }

    #[test]
    fn decode_state_carries_its_pending_token() {
        let mut s = fresh();
        s.state = SessionState::Decode { pending: 42 };
        assert!(s.decode_ready());
        assert!(s.has_ready_work());
        let SessionState::Decode { pending } = s.state else {
            unreachable!();
        };
        assert_eq!(pending, 42);
    }

    #[test]
    fn prefill_ready_requires_remaining_prompt() {
        let mut s = fresh();
        s.state = SessionState::Prefill;
        s.prompt_tokens = vec![1, 2, 3];
        s.prefill_idx = 0;
        assert!(s.prefill_ready());
        s.prefill_idx = 3;
        assert!(!s.prefill_ready());
    }

    #[test]
    fn reset_clears_request_state_but_keeps_seq() {
        let mut s = fresh();
        s.seq = Some(5);
        s.prompt_tokens = vec![1, 2];
        s.prefill_idx = 2;
        s.n_past = 9;
        s.generated_count = 4;
        s.state = SessionState::Stream;
        s.reset_for_next_request();
        assert_eq!(s.state, SessionState::RecvReq);
        assert_eq!(s.seq, Some(5));
        assert!(s.prompt_tokens.is_empty());
        assert_eq!(s.n_past, 0);
        assert_eq!(s.generated_count, 0);
    }
}
