//! The event loop.
//!
//! One thread, one iteration shape: wait for readiness (non-blocking when
//! any session has scheduler work), dispatch accept/read/write events, reap
//! idle sessions, then run one scheduler tick and arm Write interest for
//! whatever it produced.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::Runtime;
use crate::error::ServerError;
use crate::ipc::listener::UdsListener;
use crate::ipc::poller::{Interest, PollEvent, Poller};
use crate::ipc::protocol;
use crate::ipc::session::SessionState;
use crate::ipc::store::{ReadOutcome, SessionStore};
use crate::metrics::Metrics;
use crate::sched::Scheduler;

/// Poll timeout when no session has runnable work.
const IDLE_WAIT_MS: i32 = 200;

pub struct Server<R: Runtime> {
    cfg: Config,
    poller: Poller,
    listener: UdsListener,
    sessions: SessionStore,
    runtime: R,
    scheduler: Scheduler,
    metrics: Arc<Metrics>,
    clock: Instant,
    shutdown: Arc<AtomicBool>,
}

impl<R: Runtime> Server<R> {
    pub fn new(cfg: Config, runtime: R, shutdown: Arc<AtomicBool>) -> Result<Self, ServerError> {
        let listener = UdsListener::bind(&cfg.socket_path, cfg.socket_mode)?;
        let mut poller = Poller::new()?;
        poller.add(listener.fd(), Interest::READ)?;
        let metrics = Arc::new(Metrics::new());
        let scheduler = Scheduler::new(runtime.batch_capacity(), Arc::clone(&metrics));
        Ok(Self {
            cfg,
            poller,
            listener,
            sessions: SessionStore::new(),
            runtime,
            scheduler,
            metrics,
            clock: Instant::now(),
            shutdown,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    fn now_ns(&self) -> u64 {
        self.clock.elapsed().as_nanos() as u64
    }

    /// Run until the shutdown flag is set.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(
            socket = %self.listener.path().display(),
            batch_cap = self.runtime.batch_capacity(),
            max_sessions = self.cfg.max_sessions,
            "event loop running"
        );
        let mut events: Vec<PollEvent> = Vec::new();

        while !self.shutdown.load(Ordering::Relaxed) {
            let timeout_ms = if self.sessions.iter().any(|(_, s)| s.has_ready_work()) {
                0
            } else {
                IDLE_WAIT_MS
            };

            match self.poller.wait(timeout_ms, &mut events) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for ev in &events {
                if ev.fd == self.listener.fd() {
                    if ev.readable() {
                        self.accept_clients();
                    }
                    continue;
                }
                if ev.readable() {
                    self.handle_readable(ev.fd);
                }
                if ev.writable() && self.sessions.find(ev.fd).is_some() {
                    self.flush_session(ev.fd);
                }
                if (ev.hup() || ev.err())
                    && !ev.readable()
                    && !ev.writable()
                    && self.sessions.find(ev.fd).is_some()
                {
                    debug!(fd = ev.fd, "peer hangup");
                    self.close_session(ev.fd);
                }
            }

            self.sweep_idle();

            let now = self.now_ns();
            let armed = self.scheduler.tick(&mut self.runtime, &mut self.sessions, now);
            for fd in armed {
                if self.sessions.find(fd).is_some_and(|s| !s.tx.is_empty()) {
                    let _ = self.poller.add(fd, Interest::WRITE);
                }
            }
        }

        info!("shutdown requested; draining sessions");
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok(stream) => {
                    if self.sessions.len() >= self.cfg.max_sessions {
                        warn!(
                            max_sessions = self.cfg.max_sessions,
                            "session cap reached; rejecting client"
                        );
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(error = %e, "failed to set client non-blocking");
                        continue;
                    }
                    disable_sigpipe(&stream);
                    let now = self.now_ns();
                    let fd = self.sessions.add(stream, now);
                    if let Err(e) = self.poller.add(fd, Interest::READ) {
                        warn!(fd, error = %e, "failed to register client");
                        self.close_session(fd);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, fd: RawFd) {
        let now = self.now_ns();
        let outcome = self
            .sessions
            .on_readable(fd, &self.cfg, &self.runtime, now);
        self.apply_outcome(fd, outcome);
    }

    fn apply_outcome(&mut self, fd: RawFd, outcome: ReadOutcome) {
        if outcome.hard_error {
            self.close_session(fd);
            return;
        }
        if outcome.admin_request {
            self.queue_admin_snapshot(fd);
        }
        if outcome.removed_read {
            let _ = self.poller.remove(fd, Interest::READ);
        }
        if outcome.wants_write || outcome.admin_request {
            self.flush_session(fd);
        }
    }

    /// One-shot metrics reply, framed into the session's `tx`.
    fn queue_admin_snapshot(&mut self, fd: RawFd) {
        let snapshot = self.metrics.snapshot(self.sessions.len() as u32);
        let body = serde_json::to_vec(&snapshot).unwrap_or_default();
        if let Some(session) = self.sessions.find_mut(fd) {
            protocol::write_frame(&mut session.tx, &body);
        }
    }

    /// Best-effort drain of `tx`, then the post-drain state machine.
    ///
    /// Whenever `tx` empties the session either closes (errored, or peer
    /// already gone) or resets for keep-alive; a pipelined request that is
    /// already buffered gets parsed right here, because no readable event
    /// will ever fire for it.
    fn flush_session(&mut self, fd: RawFd) {
        loop {
            let result = match self.sessions.find_mut(fd) {
                Some(session) => session.flush_tx(),
                None => return,
            };
            match result {
                Ok(false) => {
                    let _ = self.poller.add(fd, Interest::WRITE);
                    return;
                }
                Err(e) => {
                    debug!(fd, error = %e, "write failed; closing session");
                    self.close_session(fd);
                    return;
                }
                Ok(true) => {
                    let _ = self.poller.remove(fd, Interest::WRITE);
                    let (state, read_closed, rx_pending) = {
                        let Some(session) = self.sessions.find_mut(fd) else {
                            return;
                        };
                        (session.state, session.read_closed, !session.rx.is_empty())
                    };
                    match state {
                        SessionState::Errored => {
                            self.close_session(fd);
                            return;
                        }
                        SessionState::Stream if read_closed => {
                            self.close_session(fd);
                            return;
                        }
                        SessionState::Stream => {
                            if let Some(session) = self.sessions.find_mut(fd) {
                                session.reset_for_next_request();
                            }
                            debug!(fd, "response drained; connection reusable");
                            if !rx_pending {
                                return;
                            }
                            let now = self.now_ns();
                            let outcome =
                                self.sessions.parse_one(fd, &self.cfg, &self.runtime, now);
                            if outcome.hard_error {
                                self.close_session(fd);
                                return;
                            }
                            if outcome.admin_request {
                                self.queue_admin_snapshot(fd);
                            }
                            if outcome.removed_read {
                                let _ = self.poller.remove(fd, Interest::READ);
                            }
                            if !(outcome.wants_write || outcome.admin_request) {
                                return;
                            }
                            // New bytes queued: go around and drain them.
                        }
                        _ => return,
                    }
                }
            }
        }
    }

    fn sweep_idle(&mut self) {
        if self.cfg.idle_timeout_sec == 0 {
            return;
        }
        let now = self.now_ns();
        let limit_ns = self.cfg.idle_timeout_sec.saturating_mul(1_000_000_000);
        let stale: Vec<RawFd> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_activity_ns) > limit_ns)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in stale {
            debug!(fd, "idle timeout");
            self.close_session(fd);
        }
    }

    fn close_session(&mut self, fd: RawFd) {
        self.sessions
            .close(fd, &mut self.poller, &mut self.runtime);
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn disable_sigpipe(stream: &std::os::unix::net::UnixStream) {
    use std::os::unix::io::AsRawFd;
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn disable_sigpipe(_stream: &std::os::unix::net::UnixStream) {
    // Writes report EPIPE instead of raising a signal; nothing to do here.
}
