//! Session ownership: accept, readable-path parsing, close with KV cleanup.

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use tracing::{debug, warn};

use crate::config::Config;
use crate::engine::{Runtime, SeqId};
use crate::ipc::poller::{Interest, Poller};
use crate::ipc::protocol::{self, codes, FrameError, FrameRead, Request};
use crate::ipc::session::{Session, SessionState, SloTargets};
use crate::sched::sampling::SamplingParams;

/// What the event loop should do after a readable event.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// `tx` has bytes to drain.
    pub wants_write: bool,
    /// Drop the Read interest for this descriptor.
    pub removed_read: bool,
    /// The frame was an admin metrics request; the loop owes the snapshot.
    pub admin_request: bool,
    /// Unrecoverable transport error; close the session now.
    pub hard_error: bool,
}

/// All live sessions, keyed by descriptor. The event-loop thread is the only
/// writer.
pub struct SessionStore {
    sessions: HashMap<RawFd, Session>,
    next_seq: SeqId,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn find(&self, fd: RawFd) -> Option<&Session> {
        self.sessions.get(&fd)
    }

    pub fn find_mut(&mut self, fd: RawFd) -> Option<&mut Session> {
        self.sessions.get_mut(&fd)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RawFd, &Session)> {
        self.sessions.iter()
    }

    /// Register a freshly accepted connection.
    pub fn add(&mut self, stream: UnixStream, now_ns: u64) -> RawFd {
        let session = Session::new(stream, now_ns);
        let fd = session.fd;
        self.sessions.insert(fd, session);
        debug!(fd, sessions = self.sessions.len(), "accepted client");
        fd
    }

    /// Tear a session down: deregister, release its KV sub-range, close the
    /// descriptor.
    pub fn close<R: Runtime>(&mut self, fd: RawFd, poller: &mut Poller, runtime: &mut R) {
        let _ = poller.remove(fd, Interest::READ | Interest::WRITE);
        if let Some(session) = self.sessions.remove(&fd) {
            if let Some(seq) = session.seq {
                runtime.seq_remove(seq);
            }
            match &session.last_error {
                Some(err) => {
                    debug!(fd, sessions = self.sessions.len(), error = %err, "closed client")
                }
                None => debug!(fd, sessions = self.sessions.len(), "closed client"),
            }
        }
    }

    /// Drain readable bytes and, when the session is idle, parse at most one
    /// framed request out of them.
    pub fn on_readable<R: Runtime>(
        &mut self,
        fd: RawFd,
        cfg: &Config,
        runtime: &R,
        now_ns: u64,
    ) -> ReadOutcome {
        let mut out = ReadOutcome::default();
        let Some(session) = self.sessions.get_mut(&fd) else {
            return out;
        };

        let mut buf = [0u8; 4096];
        loop {
            match session.stream().read(&mut buf) {
                Ok(0) => {
                    session.read_closed = true;
                    out.removed_read = true;
                    session.last_activity_ns = now_ns;
                    break;
                }
                Ok(n) => {
                    session.rx.extend_from_slice(&buf[..n]);
                    session.last_activity_ns = now_ns;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(fd, error = %e, "read failed; dropping session");
                    out.hard_error = true;
                    return out;
                }
            }
        }

        self.parse_one_into(fd, cfg, runtime, now_ns, out)
    }

    /// Parse at most one buffered framed request.
    ///
    /// Also called when a keep-alive session returns to `RecvReq` with a
    /// pipelined request already sitting in `rx`; no readable event will
    /// fire for those bytes.
    pub fn parse_one<R: Runtime>(
        &mut self,
        fd: RawFd,
        cfg: &Config,
        runtime: &R,
        now_ns: u64,
    ) -> ReadOutcome {
        self.parse_one_into(fd, cfg, runtime, now_ns, ReadOutcome::default())
    }

    fn parse_one_into<R: Runtime>(
        &mut self,
        fd: RawFd,
        cfg: &Config,
        runtime: &R,
        now_ns: u64,
        mut out: ReadOutcome,
    ) -> ReadOutcome {
        let Some(session) = self.sessions.get_mut(&fd) else {
            return out;
        };

        // One request in flight per session: buffered bytes wait until the
        // current response has drained and the state is back to RecvReq.
        if session.state != SessionState::RecvReq {
            return out;
        }

        let payload = match protocol::try_read_frame(&mut session.rx, cfg.max_frame_bytes) {
            FrameRead::Incomplete => return out,
            FrameRead::Fail(kind) => {
                let (code, msg) = match kind {
                    FrameError::InvalidLen => (codes::PROTO_INVALID_LEN, "invalid frame length 0"),
                    FrameError::FrameTooLarge => (codes::PROTO_FRAME_TOO_LARGE, "frame too large"),
                };
                let id = session.request_id.clone();
                reject(session, &mut out, &id, code, msg);
                return out;
            }
            FrameRead::Frame(payload) => payload,
        };

        let request: Request = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(fd, error = %e, "request body failed to parse");
                let id = session.request_id.clone();
                reject(session, &mut out, &id, codes::PROTO_INVALID_UTF8, "invalid utf-8");
                return out;
            }
        };

        if request.is_metrics() {
            out.admin_request = true;
            out.wants_write = true;
            out.removed_read = true;
            session.state = SessionState::Stream;
            session.read_closed = true;
            return out;
        }

        let request_id = request.id.clone().unwrap_or_default();
        let prompt = match request.prompt.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => {
                reject(
                    session,
                    &mut out,
                    &request_id,
                    codes::PROTO_BAD_REQUEST,
                    "missing or invalid prompt",
                );
                return out;
            }
        };
        session.request_id = request_id;

        if prompt.len() > cfg.max_prompt_bytes {
            let id = session.request_id.clone();
            reject(session, &mut out, &id, codes::LIMIT_PROMPT, "prompt too large");
            return out;
        }

        let tokens = match runtime.tokenize(prompt, true, true) {
            Ok(t) => t,
            Err(e) => {
                warn!(fd, error = %e, "tokenization failed; treating as empty prompt");
                Vec::new()
            }
        };

        if tokens.is_empty() {
            // Nothing to generate; finish immediately and keep the
            // connection reusable.
            session.state = SessionState::Stream;
            protocol::append_eos_event(&mut session.tx, &session.request_id, "stop");
            out.wants_write = true;
            return out;
        }

        session.prompt_tokens = tokens;
        session.prefill_idx = 0;
        session.generated_count = 0;
        session.n_past = 0;
        session.max_tokens = request
            .max_tokens
            .map_or(cfg.max_tokens, |m| m.min(cfg.max_tokens));
        session.sampling = SamplingParams {
            temperature: request.temperature.unwrap_or(0.0),
            top_p: request.top_p.unwrap_or(0.95),
            top_k: request.top_k.unwrap_or(0),
        };
        session.wants_stream = request.stream.unwrap_or(true);
        session.req_start_ns = now_ns;
        session.first_emit_ns = 0;
        session.last_emit_ns = 0;
        session.slo = SloTargets {
            target_ttft_ms: cfg.slo_ttft_ms,
            target_tbt_ms: cfg.slo_tbt_ms,
        };
        if session.seq.is_none() {
            session.seq = Some(self.next_seq);
            self.next_seq += 1;
        }
        session.state = SessionState::Prefill;
        debug!(
            fd,
            id = %session.request_id,
            seq = session.seq.unwrap_or(-1),
            n_prompt = session.prompt_tokens.len(),
            max_tokens = session.max_tokens,
            "request accepted"
        );
        out
    }
}

/// Queue an error event and put the session on the close-after-flush path.
fn reject(session: &mut Session, out: &mut ReadOutcome, id: &str, code: &str, message: &str) {
    protocol::append_error_event(&mut session.tx, id, code, message);
    session.state = SessionState::Stream;
    session.read_closed = true;
    session.last_error = Some(format!("{code}: {message}"));
    out.wants_write = true;
    out.removed_read = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockRuntime;
    use crate::ipc::protocol::write_frame;
    use std::io::Write;

    fn test_config() -> Config {
        use clap::Parser;
        Config::parse_from(["umad", "--max-prompt-bytes", "64"])
    }

    fn store_with_client() -> (SessionStore, UnixStream, RawFd) {
        let (client, server_side) = UnixStream::pair().unwrap();
        server_side.set_nonblocking(true).unwrap();
        let mut store = SessionStore::new();
        let fd = store.add(server_side, 1);
        (store, client, fd)
    }

    fn send_json(client: &mut UnixStream, body: &str) {
        let mut framed = Vec::new();
        write_frame(&mut framed, body.as_bytes());
        client.write_all(&framed).unwrap();
    }

    fn tx_events(store: &mut SessionStore, fd: RawFd) -> Vec<serde_json::Value> {
        let session = store.find_mut(fd).unwrap();
        let mut events = Vec::new();
        loop {
            match protocol::try_read_frame(&mut session.tx, usize::MAX) {
                FrameRead::Frame(p) => events.push(serde_json::from_slice(&p).unwrap()),
                _ => break,
            }
        }
        events
    }

    #[test]
    fn valid_request_moves_to_prefill() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        send_json(&mut client, r#"{"id":"r1","prompt":"hi","max_tokens":4}"#);

        let out = store.on_readable(fd, &cfg, &runtime, 2);
        assert!(!out.wants_write);
        let s = store.find(fd).unwrap();
        assert_eq!(s.state, SessionState::Prefill);
        assert_eq!(s.prompt_tokens, vec![104, 105]);
        assert_eq!(s.seq, Some(1));
        assert_eq!(s.max_tokens, 4);
        assert_eq!(s.request_id, "r1");
    }

    #[test]
    fn missing_prompt_is_bad_request() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        send_json(&mut client, r#"{"id":"r2"}"#);

        let out = store.on_readable(fd, &cfg, &runtime, 2);
        assert!(out.wants_write);
        assert!(out.removed_read);
        let events = tx_events(&mut store, fd);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["code"], codes::PROTO_BAD_REQUEST);
    }

    #[test]
    fn oversize_prompt_is_limit_error() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        let long = "a".repeat(65);
        send_json(&mut client, &format!(r#"{{"id":"r3","prompt":"{long}"}}"#));

        store.on_readable(fd, &cfg, &runtime, 2);
        let events = tx_events(&mut store, fd);
        assert_eq!(events[0]["code"], codes::LIMIT_PROMPT);
        assert_eq!(events[0]["id"], "r3");
    }

    #[test]
    fn zero_length_frame_is_invalid_len() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        client.write_all(&[0, 0, 0, 0]).unwrap();

        store.on_readable(fd, &cfg, &runtime, 2);
        let events = tx_events(&mut store, fd);
        assert_eq!(events[0]["code"], codes::PROTO_INVALID_LEN);
        assert!(store.find(fd).unwrap().read_closed);
    }

    #[test]
    fn malformed_json_is_proto_001() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        send_json(&mut client, "{\"id\":\"a\\xZZ\"}");

        store.on_readable(fd, &cfg, &runtime, 2);
        let events = tx_events(&mut store, fd);
        assert_eq!(events[0]["code"], codes::PROTO_INVALID_UTF8);
    }

    #[test]
    fn metrics_request_flags_admin() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        send_json(&mut client, r#"{"type":"metrics"}"#);

        let out = store.on_readable(fd, &cfg, &runtime, 2);
        assert!(out.admin_request);
        assert!(out.removed_read);
        assert!(store.find(fd).unwrap().read_closed);
    }

    #[test]
    fn empty_prompt_tokens_finish_immediately() {
        let cfg = test_config();
        let quiet = MockRuntime::new(32).tokenize_nothing();
        let (mut store, mut client, fd) = store_with_client();
        send_json(&mut client, r#"{"id":"r4","prompt":"x"}"#);

        let out = store.on_readable(fd, &cfg, &quiet, 2);
        assert!(out.wants_write);
        let events = tx_events(&mut store, fd);
        assert_eq!(events[0]["event"], "eos");
        assert_eq!(events[0]["reason"], "stop");
        let s = store.find(fd).unwrap();
        assert_eq!(s.state, SessionState::Stream);
        assert!(!s.read_closed, "connection stays reusable after empty prompt");
    }

    #[test]
    fn second_request_waits_for_first_to_finish() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut client, fd) = store_with_client();
        send_json(&mut client, r#"{"id":"r5","prompt":"hi"}"#);
        send_json(&mut client, r#"{"id":"r6","prompt":"later"}"#);

        store.on_readable(fd, &cfg, &runtime, 2);
        let s = store.find(fd).unwrap();
        assert_eq!(s.request_id, "r5");
        assert_eq!(s.state, SessionState::Prefill);
        assert!(!s.rx.is_empty(), "second frame stays buffered");

        // Still mid-request: another readable event must not consume it.
        store.on_readable(fd, &cfg, &runtime, 3);
        let s = store.find(fd).unwrap();
        assert_eq!(s.request_id, "r5");
        assert!(!s.rx.is_empty());
    }

    #[test]
    fn eof_sets_read_closed() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, client, fd) = store_with_client();
        drop(client);

        let out = store.on_readable(fd, &cfg, &runtime, 2);
        assert!(out.removed_read);
        assert!(store.find(fd).unwrap().read_closed);
    }

    #[test]
    fn sequence_ids_are_monotonic_across_sessions() {
        let cfg = test_config();
        let runtime = MockRuntime::new(32);
        let (mut store, mut c1, fd1) = {
            let (client, server_side) = UnixStream::pair().unwrap();
            server_side.set_nonblocking(true).unwrap();
            let mut store = SessionStore::new();
            let fd = store.add(server_side, 1);
            (store, client, fd)
        };
        let (mut c2, server2) = UnixStream::pair().unwrap();
        server2.set_nonblocking(true).unwrap();
        let fd2 = store.add(server2, 1);

        send_json(&mut c1, r#"{"id":"a","prompt":"x"}"#);
        send_json(&mut c2, r#"{"id":"b","prompt":"y"}"#);
        store.on_readable(fd1, &cfg, &runtime, 2);
        store.on_readable(fd2, &cfg, &runtime, 2);

        assert_eq!(store.find(fd1).unwrap().seq, Some(1));
        assert_eq!(store.find(fd2).unwrap().seq, Some(2));
    }
}
