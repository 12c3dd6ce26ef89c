//! The per-tick heart of the daemon.
//!
//! Each tick asks the policy for a plan, enacts it into one fused batch,
//! runs a single decode against the runtime, then samples and dispatches
//! per-session results. At most one batched decode happens per tick.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::engine::{Batch, Pos, Runtime};
use crate::ipc::protocol::{self, codes};
use crate::ipc::session::SessionState;
use crate::ipc::store::SessionStore;
use crate::metrics::Metrics;

use super::bmt;
use super::policy::{BaselinePolicy, Phase};
use super::sampling;
use super::sizer::AdaptiveSizer;

/// Where to pick up a sampled token after the decode returns.
struct SampleRef {
    fd: RawFd,
    batch_index: usize,
    /// Session phase when the batch was assembled: `Prefill` marks the
    /// first-token boundary, `Decode` a steady-state step.
    phase: Phase,
}

pub struct Scheduler {
    policy: BaselinePolicy,
    sizer: AdaptiveSizer,
    rr_decode_idx: usize,
    rr_prefill_idx: usize,
    rng: StdRng,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(batch_cap: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            policy: BaselinePolicy,
            sizer: AdaptiveSizer::new(batch_cap.min(i32::MAX as usize) as i32),
            rr_decode_idx: 0,
            rr_prefill_idx: 0,
            rng: StdRng::from_entropy(),
            metrics,
        }
    }

    /// Current adaptive target (mostly for logs and tests).
    pub fn target_batch(&self) -> i32 {
        self.sizer.target_batch()
    }

    /// Run one tick. Returns the descriptors whose `tx` buffer went from
    /// empty to non-empty, so the event loop can arm Write interest.
    pub fn tick<R: Runtime>(
        &mut self,
        runtime: &mut R,
        sessions: &mut SessionStore,
        now_ns: u64,
    ) -> Vec<RawFd> {
        let batch_cap = runtime.batch_capacity().min(i32::MAX as usize) as i32;
        let plan = self.policy.schedule_tick(
            sessions,
            batch_cap,
            self.sizer.target_batch(),
            self.rr_decode_idx,
            self.rr_prefill_idx,
        );
        self.rr_decode_idx = plan.next_rr_decode_idx;
        self.rr_prefill_idx = plan.next_rr_prefill_idx;
        if plan.items.is_empty() {
            return Vec::new();
        }

        // Estimated before enactment: enacting advances n_past.
        let planned_units = bmt::estimate_units(sessions, &plan);

        let mut batch = Batch::with_capacity(batch_cap as usize);
        let mut refs: Vec<SampleRef> = Vec::new();
        let mut gen_tokens = 0u64;
        let mut prefill_tokens = 0u64;

        for item in &plan.items {
            let Some(session) = sessions.find_mut(item.fd) else {
                continue;
            };
            let Some(seq) = session.seq else {
                continue;
            };
            match item.phase {
                Phase::Decode => {
                    let SessionState::Decode { pending } = session.state else {
                        continue;
                    };
                    let idx = batch.push(pending, session.n_past, seq, true);
                    refs.push(SampleRef {
                        fd: item.fd,
                        batch_index: idx,
                        phase: Phase::Decode,
                    });
                    gen_tokens += 1;
                }
                Phase::Prefill => {
                    let start = session.prefill_idx;
                    let end =
                        (start + item.n_tokens.max(0) as usize).min(session.prompt_tokens.len());
                    if end == start {
                        continue;
                    }
                    // Logits are only wanted when this chunk reaches the end
                    // of the prompt: that position is the first-token
                    // boundary. A partial chunk samples nothing.
                    let completes = end == session.prompt_tokens.len();
                    let mut last_idx = 0usize;
                    for (off, j) in (start..end).enumerate() {
                        let wants_logits = completes && j + 1 == end;
                        last_idx = batch.push(
                            session.prompt_tokens[j],
                            session.n_past + off as Pos,
                            seq,
                            wants_logits,
                        );
                    }
                    session.prefill_idx = end;
                    session.n_past += (end - start) as Pos;
                    prefill_tokens += (end - start) as u64;
                    if completes {
                        refs.push(SampleRef {
                            fd: item.fd,
                            batch_index: last_idx,
                            phase: Phase::Prefill,
                        });
                    }
                }
            }
        }

        batch.assert_coherent();
        debug_assert!(batch.len() <= batch_cap as usize);
        debug_assert_eq!(batch.n_logits(), refs.len());
        if batch.is_empty() {
            return Vec::new();
        }

        debug!(
            n_tokens = batch.len(),
            gen_tokens,
            prefill_tokens,
            target_batch = self.sizer.target_batch(),
            planned_units,
            "tick batch assembled"
        );

        let started = Instant::now();
        let outcome = runtime.decode(&batch);
        if outcome.is_ok() {
            runtime.synchronize();
        }
        let elapsed_ns = started.elapsed().as_nanos() as u64;

        let total_tokens = batch.len() as u64;
        let gen_ns = elapsed_ns * gen_tokens / total_tokens;
        let prefill_ns = elapsed_ns - gen_ns;
        self.metrics.record_batch(
            elapsed_ns,
            total_tokens,
            gen_tokens,
            prefill_tokens,
            gen_ns,
            prefill_ns,
        );
        self.sizer.observe(elapsed_ns as f64 / 1.0e6, batch_cap);
        self.metrics.set_decode_ms_ewma(self.sizer.ewma_ms());

        let mut armed = Vec::new();

        if let Err(e) = outcome {
            warn!(error = %e, n_tokens = batch.len(), "decode failed; erroring batch participants");
            let message = e.to_string();
            for item in &plan.items {
                let Some(session) = sessions.find_mut(item.fd) else {
                    continue;
                };
                let was_empty = session.tx.is_empty();
                protocol::append_error_event(
                    &mut session.tx,
                    &session.request_id,
                    codes::RUNTIME_DECODE,
                    &message,
                );
                session.state = SessionState::Errored;
                session.read_closed = true;
                session.last_error = Some(message.clone());
                if was_empty {
                    armed.push(item.fd);
                }
            }
            return armed;
        }

        for sample_ref in &refs {
            let Some(session) = sessions.find_mut(sample_ref.fd) else {
                continue;
            };
            let params = session.sampling;
            let new_id = {
                let logits = runtime.logits_ith(sample_ref.batch_index);
                sampling::sample(logits, &params, &mut self.rng)
            };
            let was_empty = session.tx.is_empty();

            match sample_ref.phase {
                Phase::Prefill => {
                    let piece = match runtime.token_to_piece(new_id) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(fd = sample_ref.fd, token = new_id, error = %e, "piece render failed");
                            String::new()
                        }
                    };
                    protocol::append_token_event(
                        &mut session.tx,
                        &session.request_id,
                        &piece,
                        new_id,
                    );
                    session.state = SessionState::Decode { pending: new_id };
                    if session.first_emit_ns == 0 {
                        session.first_emit_ns = now_ns;
                        let ttft_ms = now_ns.saturating_sub(session.req_start_ns) / 1_000_000;
                        if session.slo.target_ttft_ms > 0
                            && ttft_ms > u64::from(session.slo.target_ttft_ms)
                        {
                            warn!(
                                fd = sample_ref.fd,
                                id = %session.request_id,
                                ttft_ms,
                                target_ms = session.slo.target_ttft_ms,
                                "first token over target"
                            );
                        } else {
                            debug!(fd = sample_ref.fd, id = %session.request_id, ttft_ms, "first token");
                        }
                    }
                    session.last_emit_ns = now_ns;
                    self.metrics
                        .tokens_generated_total
                        .fetch_add(1, Ordering::Relaxed);
                }
                Phase::Decode => {
                    let eog = runtime.is_eog(new_id);
                    if eog || session.generated_count >= session.max_tokens {
                        let reason = if eog { "stop" } else { "length" };
                        protocol::append_eos_event(&mut session.tx, &session.request_id, reason);
                        session.state = SessionState::Stream;
                        if let Some(seq) = session.seq {
                            runtime.seq_remove(seq);
                        }
                        session.n_past = 0;
                        debug!(
                            fd = sample_ref.fd,
                            id = %session.request_id,
                            reason,
                            generated = session.generated_count,
                            "request complete"
                        );
                    } else {
                        let piece = match runtime.token_to_piece(new_id) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(fd = sample_ref.fd, token = new_id, error = %e, "piece render failed");
                                String::new()
                            }
                        };
                        protocol::append_token_event(
                            &mut session.tx,
                            &session.request_id,
                            &piece,
                            new_id,
                        );
                        session.generated_count += 1;
                        // The previously pending token now occupies a KV
                        // position of its own.
                        session.n_past += 1;
                        session.state = SessionState::Decode { pending: new_id };
                        if session.last_emit_ns != 0 && session.slo.target_tbt_ms > 0 {
                            let tbt_ms =
                                now_ns.saturating_sub(session.last_emit_ns) / 1_000_000;
                            if tbt_ms > u64::from(session.slo.target_tbt_ms) {
                                debug!(
                                    fd = sample_ref.fd,
                                    id = %session.request_id,
                                    tbt_ms,
                                    target_ms = session.slo.target_tbt_ms,
                                    "inter-token gap over target"
                                );
                            }
                        }
                        session.last_emit_ns = now_ns;
                        self.metrics
                            .tokens_generated_total
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            if was_empty && !session.tx.is_empty() {
                armed.push(sample_ref.fd);
            }
        }

        armed
    }
}
