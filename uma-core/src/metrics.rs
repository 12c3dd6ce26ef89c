//! Scheduler observability: monotonic counters and last-value gauges.
//!
//! All writers live on the event-loop thread; atomics make the snapshot
//! safe to take from anywhere without locks. The EWMA gauge is stored in
//! fixed point (×1000) to stay inside an integer atomic.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub tokens_generated_total: AtomicU64,
    pub batch_calls_total: AtomicU64,
    pub last_batch_size: AtomicU64,

    pub decode_ms_last: AtomicU64,
    decode_ms_ewma_x1000: AtomicU64,
    pub decode_calls: AtomicU64,
    pub decode_ns_total: AtomicU64,
    pub decode_tokens_total: AtomicU64,
    pub decode_ms_min: AtomicU64,
    pub decode_ms_max: AtomicU64,

    // Split accounting between steady-state generation and prefill.
    pub decode_phase_tokens_total: AtomicU64,
    pub prefill_tokens_total: AtomicU64,
    pub decode_ns_total_gen: AtomicU64,
    pub prefill_ns_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let m = Self::default();
        // Arm the min gauge so the first observation always wins.
        m.decode_ms_min.store(u64::MAX, Ordering::Relaxed);
        m
    }

    pub fn set_decode_ms_ewma(&self, ms: f64) {
        let fx = (ms.max(0.0) * 1000.0) as u64;
        self.decode_ms_ewma_x1000.store(fx, Ordering::Relaxed);
    }

    pub fn decode_ms_ewma(&self) -> f64 {
        self.decode_ms_ewma_x1000.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Record one batched decode call.
    pub fn record_batch(
        &self,
        elapsed_ns: u64,
        total_tokens: u64,
        gen_tokens: u64,
        prefill_tokens: u64,
        gen_ns: u64,
        prefill_ns: u64,
    ) {
        let elapsed_ms = elapsed_ns / 1_000_000;
        self.batch_calls_total.fetch_add(1, Ordering::Relaxed);
        self.last_batch_size.store(total_tokens, Ordering::Relaxed);
        self.decode_ms_last.store(elapsed_ms, Ordering::Relaxed);
        self.decode_calls.fetch_add(1, Ordering::Relaxed);
        self.decode_ns_total.fetch_add(elapsed_ns, Ordering::Relaxed);
        self.decode_tokens_total
            .fetch_add(total_tokens, Ordering::Relaxed);
        self.decode_ms_min.fetch_min(elapsed_ms, Ordering::Relaxed);
        self.decode_ms_max.fetch_max(elapsed_ms, Ordering::Relaxed);
        self.decode_phase_tokens_total
            .fetch_add(gen_tokens, Ordering::Relaxed);
        self.prefill_tokens_total
            .fetch_add(prefill_tokens, Ordering::Relaxed);
        self.decode_ns_total_gen.fetch_add(gen_ns, Ordering::Relaxed);
        self.prefill_ns_total
            .fetch_add(prefill_ns, Ordering::Relaxed);
    }

    /// One-shot snapshot for the admin endpoint.
    pub fn snapshot(&self, active_sessions: u32) -> MetricsSnapshot {
        let decode_calls = self.decode_calls.load(Ordering::Relaxed);
        let decode_ns_total = self.decode_ns_total.load(Ordering::Relaxed);
        let decode_tokens_total = self.decode_tokens_total.load(Ordering::Relaxed);
        let gen_tokens = self.decode_phase_tokens_total.load(Ordering::Relaxed);
        let prefill_tokens = self.prefill_tokens_total.load(Ordering::Relaxed);
        let gen_ns = self.decode_ns_total_gen.load(Ordering::Relaxed);
        let prefill_ns = self.prefill_ns_total.load(Ordering::Relaxed);

        let per = |ns: u64, n: u64| {
            if n == 0 {
                0.0
            } else {
                ns as f64 / n as f64 / 1.0e6
            }
        };

        let decode_ms_min = self.decode_ms_min.load(Ordering::Relaxed);
        MetricsSnapshot {
            tokens_generated_total: self.tokens_generated_total.load(Ordering::Relaxed),
            batch_calls_total: self.batch_calls_total.load(Ordering::Relaxed),
            last_batch_size: self.last_batch_size.load(Ordering::Relaxed),
            decode_ms_last: self.decode_ms_last.load(Ordering::Relaxed),
            decode_ms_ewma: self.decode_ms_ewma(),
            decode_calls,
            decode_ns_total,
            decode_tokens_total,
            decode_ms_min: if decode_ms_min == u64::MAX {
                0
            } else {
                decode_ms_min
            },
            decode_ms_max: self.decode_ms_max.load(Ordering::Relaxed),
            decode_ms_mean: per(decode_ns_total, decode_calls),
            decode_tokens_per_call_mean: if decode_calls == 0 {
                0.0
            } else {
                decode_tokens_total as f64 / decode_calls as f64
            },
            decode_phase_tokens_total: gen_tokens,
            prefill_tokens_total: prefill_tokens,
            decode_ns_total_gen: gen_ns,
            prefill_ns_total: prefill_ns,
            gen_ms_per_token_mean: per(gen_ns, gen_tokens),
            prefill_ms_per_token_mean: per(prefill_ns, prefill_tokens),
            active_sessions,
        }
    }
}

/// Serialized form of the admin metrics reply.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tokens_generated_total: u64,
    pub batch_calls_total: u64,
    pub last_batch_size: u64,
    pub decode_ms_last: u64,
    pub decode_ms_ewma: f64,
    pub decode_calls: u64,
    pub decode_ns_total: u64,
    pub decode_tokens_total: u64,
    pub decode_ms_min: u64,
    pub decode_ms_max: u64,
    pub decode_ms_mean: f64,
    pub decode_tokens_per_call_mean: f64,
    pub decode_phase_tokens_total: u64,
    pub prefill_tokens_total: u64,
    pub decode_ns_total_gen: u64,
    pub prefill_ns_total: u64,
    pub gen_ms_per_token_mean: f64,
    pub prefill_ms_per_token_mean: f64,
    pub active_sessions: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_of_idle_metrics_is_all_zero() {
        let m = Metrics::new();
        let snap = m.snapshot(0);
        assert_eq!(snap.tokens_generated_total, 0);
        assert_eq!(snap.batch_calls_total, 0);
        assert_eq!(snap.decode_ms_min, 0, "unarmed min reads as zero");
        assert_eq!(snap.decode_ms_mean, 0.0);
        assert_eq!(snap.active_sessions, 0);
    }

    #[test]
    fn record_batch_accumulates_and_splits() {
        let m = Metrics::new();
        // 10 ms for 8 tokens: 2 generated, 6 prefill, time split 1:3.
        m.record_batch(10_000_000, 8, 2, 6, 2_500_000, 7_500_000);
        m.record_batch(30_000_000, 4, 4, 0, 30_000_000, 0);

        let snap = m.snapshot(3);
        assert_eq!(snap.batch_calls_total, 2);
        assert_eq!(snap.decode_calls, 2);
        assert_eq!(snap.last_batch_size, 4);
        assert_eq!(snap.decode_tokens_total, 12);
        assert_eq!(snap.decode_ms_last, 30);
        assert_eq!(snap.decode_ms_min, 10);
        assert_eq!(snap.decode_ms_max, 30);
        assert_eq!(snap.decode_phase_tokens_total, 6);
        assert_eq!(snap.prefill_tokens_total, 6);
        assert!((snap.decode_ms_mean - 20.0).abs() < 1e-9);
        assert!((snap.decode_tokens_per_call_mean - 6.0).abs() < 1e-9);
        assert!((snap.prefill_ms_per_token_mean - 1.25).abs() < 1e-9);
        assert_eq!(snap.active_sessions, 3);
    }

    #[test]
    fn ewma_round_trips_through_fixed_point() {
        let m = Metrics::new();
        m.set_decode_ms_ewma(12.345);
        assert!((m.decode_ms_ewma() - 12.345).abs() < 0.001);
        m.set_decode_ms_ewma(-5.0);
        assert_eq!(m.decode_ms_ewma(), 0.0);
    }

    #[test]
    fn snapshot_serializes_with_expected_fields() {
        let m = Metrics::new();
        let json = serde_json::to_value(m.snapshot(1)).unwrap();
        for field in [
            "tokens_generated_total",
            "batch_calls_total",
            "last_batch_size",
            "decode_ms_ewma",
            "gen_ms_per_token_mean",
            "prefill_ms_per_token_mean",
            "active_sessions",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
