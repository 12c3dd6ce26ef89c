//! Per-tick batching policy.
//!
//! Two phases inside one token budget: every decode-ready session gets
//! exactly one slot (round-robin), then the remainder of the budget goes to
//! prefill, first-token sessions first. Granting decode ahead of prefill
//! keeps inter-token cadence steady for running sessions; the TTFT burst cap
//! stops one long prompt from monopolizing the tick while fresh sessions
//! wait for their first token.

use crate::ipc::store::SessionStore;

/// Which kind of work a plan item schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

/// One session's share of the tick.
#[derive(Debug, Clone, Copy)]
pub struct BatchItem {
    pub fd: std::os::unix::io::RawFd,
    pub phase: Phase,
    /// Chunk size for prefill; always 1 for decode.
    pub n_tokens: i32,
}

/// The tick's work list plus advanced cursors and token accounting.
#[derive(Debug, Default)]
pub struct Plan {
    pub items: Vec<BatchItem>,
    pub next_rr_decode_idx: usize,
    pub next_rr_prefill_idx: usize,
    pub decode_tok_count: i32,
    pub prefill_tok_count: i32,
}

/// Prefill chunk ceiling for sessions that have not emitted a token yet.
const TTFT_BURST: i32 = 16;

/// Baseline decode-first, TTFT-first policy.
#[derive(Debug, Default)]
pub struct BaselinePolicy;

impl BaselinePolicy {
    pub fn schedule_tick(
        &self,
        sessions: &SessionStore,
        batch_cap: i32,
        target_batch: i32,
        rr_decode_idx: usize,
        rr_prefill_idx: usize,
    ) -> Plan {
        let mut plan = Plan::default();
        let mut budget = target_batch.min(batch_cap).max(1);

        // Deterministic pool order: descriptor order, then the cursor
        // rotates within it.
        let mut decode_pool = Vec::new();
        let mut prefill_pool = Vec::new();
        for (&fd, session) in sessions.iter() {
            if session.decode_ready() {
                decode_pool.push(fd);
            } else if session.prefill_ready() {
                prefill_pool.push(fd);
            }
        }
        decode_pool.sort_unstable();
        prefill_pool.sort_unstable();

        // Phase A: one token per decode-ready session, round-robin.
        if !decode_pool.is_empty() && budget > 0 {
            let n = decode_pool.len();
            for i in 0..n {
                if budget == 0 {
                    break;
                }
                let fd = decode_pool[(rr_decode_idx + i) % n];
                plan.items.push(BatchItem {
                    fd,
                    phase: Phase::Decode,
                    n_tokens: 1,
                });
                budget -= 1;
                plan.decode_tok_count += 1;
            }
            plan.next_rr_decode_idx = (rr_decode_idx + 1) % n;
        }

        // Phase B: budgeted prefill, TTFT pool ahead of the rest.
        if !prefill_pool.is_empty() && budget > 0 {
            let n = prefill_pool.len();
            let mut ttft_pool = Vec::new();
            let mut rest_pool = Vec::new();
            for i in 0..n {
                let fd = prefill_pool[(rr_prefill_idx + i) % n];
                let Some(session) = sessions.find(fd) else {
                    continue;
                };
                if session.first_emit_ns == 0 {
                    ttft_pool.push(fd);
                } else {
                    rest_pool.push(fd);
                }
            }

            fill_prefill(sessions, &ttft_pool, &mut budget, &mut plan);
            if budget > 0 {
                fill_prefill(sessions, &rest_pool, &mut budget, &mut plan);
            }
            plan.next_rr_prefill_idx = (rr_prefill_idx + 1) % n;
        }

        plan
    }
}

fn fill_prefill(
    sessions: &SessionStore,
    pool: &[std::os::unix::io::RawFd],
    budget: &mut i32,
    plan: &mut Plan,
) {
    for &fd in pool {
        if *budget <= 0 {
            break;
        }
        let Some(session) = sessions.find(fd) else {
            continue;
        };
        let remain = session.prefill_remaining().min(i32::MAX as usize) as i32;
        let mut chunk = remain.min(*budget);
        if session.first_emit_ns == 0 {
            chunk = chunk.min(TTFT_BURST);
        }
        if chunk <= 0 {
            continue;
        }
        plan.items.push(BatchItem {
            fd,
            phase: Phase::Prefill,
            n_tokens: chunk,
        });
        *budget -= chunk;
        plan.prefill_tok_count += chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::session::SessionState;
    use crate::ipc::store::SessionStore;
    use std::os::unix::io::RawFd;
    use std::os::unix::net::UnixStream;

    struct Pool {
        store: SessionStore,
        // Keep the peer halves alive so the descriptors stay valid.
        _peers: Vec<UnixStream>,
    }

    impl Pool {
        fn new() -> Self {
            Self {
                store: SessionStore::new(),
                _peers: Vec::new(),
            }
        }

        fn add_decode(&mut self, n_past: i32) -> RawFd {
            let (a, b) = UnixStream::pair().unwrap();
            let fd = self.store.add(a, 1);
            self._peers.push(b);
            let s = self.store.find_mut(fd).unwrap();
            s.state = SessionState::Decode { pending: 7 };
            s.seq = Some(fd);
            s.n_past = n_past;
            fd
        }

        fn add_prefill(&mut self, prompt_len: usize, first_emit_ns: u64) -> RawFd {
            let (a, b) = UnixStream::pair().unwrap();
            let fd = self.store.add(a, 1);
            self._peers.push(b);
            let s = self.store.find_mut(fd).unwrap();
            s.state = SessionState::Prefill;
            s.prompt_tokens = vec![1; prompt_len];
            s.prefill_idx = 0;
            s.first_emit_ns = first_emit_ns;
            s.seq = Some(fd);
            fd
        }
    }

    #[test]
    fn decode_sessions_get_exactly_one_token_each() {
        let mut pool = Pool::new();
        pool.add_decode(10);
        pool.add_decode(20);

        let plan = BaselinePolicy.schedule_tick(&pool.store, 32, 32, 0, 0);
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.decode_tok_count, 2);
        assert_eq!(plan.prefill_tok_count, 0);
        assert!(plan.items.iter().all(|i| i.phase == Phase::Decode));
        assert!(plan.items.iter().all(|i| i.n_tokens == 1));
    }

    #[test]
    fn ttft_session_goes_first_with_burst_cap() {
        let mut pool = Pool::new();
        let ttft_fd = pool.add_prefill(100, 0);
        let _rest_fd = pool.add_prefill(8, 42);

        let plan = BaselinePolicy.schedule_tick(&pool.store, 64, 64, 0, 0);
        assert!(!plan.items.is_empty());
        assert_eq!(plan.items[0].fd, ttft_fd);
        assert_eq!(plan.items[0].phase, Phase::Prefill);
        assert_eq!(plan.items[0].n_tokens, 16);
    }

    #[test]
    fn budget_splits_across_phases() {
        let mut pool = Pool::new();
        pool.add_decode(0);
        pool.add_prefill(10, 42);

        let plan = BaselinePolicy.schedule_tick(&pool.store, 32, 3, 0, 0);
        assert_eq!(plan.decode_tok_count, 1);
        assert_eq!(plan.prefill_tok_count, 2);
        assert_eq!(plan.items.len(), 2);
    }

    #[test]
    fn decode_cursor_rotates_by_one() {
        let mut pool = Pool::new();
        pool.add_decode(0);
        pool.add_decode(0);
        pool.add_decode(0);

        let plan = BaselinePolicy.schedule_tick(&pool.store, 32, 32, 0, 0);
        assert_eq!(plan.next_rr_decode_idx, 1);

        let plan = BaselinePolicy.schedule_tick(&pool.store, 32, 32, 2, 0);
        assert_eq!(plan.next_rr_decode_idx, 0);
    }

    #[test]
    fn plan_never_exceeds_the_budget() {
        let mut pool = Pool::new();
        for _ in 0..5 {
            pool.add_decode(0);
        }
        for _ in 0..3 {
            pool.add_prefill(40, 0);
        }

        for (cap, target) in [(8, 64), (64, 8), (4, 4), (1, 1), (64, 64)] {
            let plan = BaselinePolicy.schedule_tick(&pool.store, cap, target, 0, 0);
            let total: i32 = plan.items.iter().map(|i| i.n_tokens).sum();
            assert!(total <= cap.min(target).max(1));
            assert_eq!(total, plan.decode_tok_count + plan.prefill_tok_count);
        }
    }

    #[test]
    fn decode_present_caps_prefill_at_budget_minus_decoders() {
        let mut pool = Pool::new();
        for _ in 0..4 {
            pool.add_decode(0);
        }
        pool.add_prefill(100, 42);

        let budget = 10;
        let plan = BaselinePolicy.schedule_tick(&pool.store, 64, budget, 0, 0);
        assert_eq!(plan.decode_tok_count, 4);
        for item in plan.items.iter().filter(|i| i.phase == Phase::Prefill) {
            assert!(item.n_tokens <= budget - 4);
        }
    }

    #[test]
    fn exhausted_prefill_is_not_scheduled() {
        let mut pool = Pool::new();
        let fd = pool.add_prefill(4, 0);
        pool.store.find_mut(fd).unwrap().prefill_idx = 4;

        let plan = BaselinePolicy.schedule_tick(&pool.store, 32, 32, 0, 0);
        assert!(plan.items.is_empty());
    }

    #[test]
    fn rest_pool_waits_for_ttft_budget_leftovers() {
        let mut pool = Pool::new();
        let ttft = pool.add_prefill(16, 0);
        let rest = pool.add_prefill(16, 42);

        // Budget exactly one burst: the rest session gets nothing.
        let plan = BaselinePolicy.schedule_tick(&pool.store, 16, 16, 0, 0);
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].fd, ttft);

        // Double budget: both are served.
        let plan = BaselinePolicy.schedule_tick(&pool.store, 32, 32, 0, 0);
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.items[1].fd, rest);
        assert_eq!(plan.items[1].n_tokens, 16);
    }
}
