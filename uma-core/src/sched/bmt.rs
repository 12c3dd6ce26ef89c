//! Per-tick KV-traffic estimator.
//!
//! Attention cost for a token at position `p` grows with the `p` cached
//! positions it attends over, so a decode item costs about `n_past + 1`
//! dimensionless units and a prefill chunk of `m` tokens starting at
//! `n_past` costs the arithmetic series `(n_past+1) + … + (n_past+m)`.
//! The scheduler logs the total per tick; nothing acts on it.

use crate::ipc::store::SessionStore;

use super::policy::{Phase, Plan};

/// Cost of one decode step at the given cache depth.
pub fn decode_units(n_past: u64) -> u64 {
    n_past + 1
}

/// Cost of a prefill chunk of `m` tokens starting at cache depth `n_past`.
pub fn prefill_units(n_past: u64, m: u64) -> u64 {
    // Closed form of the series: m * (2*n_past + m + 1) / 2.
    m * (2 * n_past + m + 1) / 2
}

/// Total estimated units for a plan against the current session pool.
///
/// Evaluate before the plan is enacted; enactment advances `n_past`.
pub fn estimate_units(sessions: &SessionStore, plan: &Plan) -> u64 {
    let mut total = 0u64;
    for item in &plan.items {
        let Some(session) = sessions.find(item.fd) else {
            continue;
        };
        let base = session.n_past.max(0) as u64;
        total += match item.phase {
            Phase::Decode => decode_units(base),
            Phase::Prefill => prefill_units(base, item.n_tokens.max(0) as u64),
        };
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::session::SessionState;
    use crate::sched::policy::BatchItem;
    use std::os::unix::net::UnixStream;

    #[test]
    fn closed_form_matches_the_series() {
        for n_past in [0u64, 1, 5, 100] {
            for m in [1u64, 2, 16, 37] {
                let expected: u64 = (1..=m).map(|j| n_past + j).sum();
                assert_eq!(prefill_units(n_past, m), expected);
            }
        }
    }

    #[test]
    fn decode_cost_is_depth_plus_one() {
        assert_eq!(decode_units(0), 1);
        assert_eq!(decode_units(10), 11);
    }

    #[test]
    fn plan_estimate_sums_both_phases() {
        let mut store = SessionStore::new();
        let (a1, _k1) = UnixStream::pair().unwrap();
        let (a2, _k2) = UnixStream::pair().unwrap();
        let fd1 = store.add(a1, 1);
        let fd2 = store.add(a2, 1);
        {
            let s = store.find_mut(fd1).unwrap();
            s.state = SessionState::Decode { pending: 1 };
            s.n_past = 10;
        }
        {
            let s = store.find_mut(fd2).unwrap();
            s.state = SessionState::Prefill;
            s.prompt_tokens = vec![1; 8];
            s.n_past = 5;
        }

        let plan = Plan {
            items: vec![
                BatchItem {
                    fd: fd1,
                    phase: Phase::Decode,
                    n_tokens: 1,
                },
                BatchItem {
                    fd: fd2,
                    phase: Phase::Prefill,
                    n_tokens: 3,
                },
            ],
            ..Default::default()
        };

        // decode: 11; prefill: 6 + 7 + 8 = 21
        assert_eq!(estimate_units(&store, &plan), 32);
    }
}
