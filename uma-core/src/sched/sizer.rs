//! Adaptive target-batch sizing.
//!
//! An EWMA of per-tick decode wall time steers the target batch toward a
//! fixed tick budget: shrink multiplicatively when ticks run long, grow
//! additively when there is headroom. The target never leaves
//! `[FLOOR, batch_cap]`.

/// Wall-time budget one tick should stay near, in milliseconds.
pub const TICK_BUDGET_MS: f64 = 30.0;

/// Lowest target the sizer will shrink to.
const FLOOR: i32 = 8;

const EWMA_KEEP: f64 = 0.8;
const EWMA_BLEND: f64 = 0.2;
const SHRINK_ABOVE: f64 = 1.3;
const GROW_BELOW: f64 = 0.8;
const SHRINK_FACTOR: f64 = 0.7;

#[derive(Debug)]
pub struct AdaptiveSizer {
    ewma_ms: f64,
    target_batch: i32,
}

impl AdaptiveSizer {
    /// Start optimistic at the physical cap; observed cost pulls it down.
    pub fn new(batch_cap: i32) -> Self {
        Self {
            ewma_ms: 0.0,
            target_batch: batch_cap.max(1),
        }
    }

    pub fn target_batch(&self) -> i32 {
        self.target_batch
    }

    pub fn ewma_ms(&self) -> f64 {
        self.ewma_ms
    }

    /// Feed one tick's decode wall time.
    pub fn observe(&mut self, elapsed_ms: f64, batch_cap: i32) {
        self.ewma_ms = EWMA_KEEP * self.ewma_ms + EWMA_BLEND * elapsed_ms;
        if self.ewma_ms > SHRINK_ABOVE * TICK_BUDGET_MS {
            self.target_batch = ((self.target_batch as f64 * SHRINK_FACTOR) as i32).max(FLOOR);
        } else if self.ewma_ms < GROW_BELOW * TICK_BUDGET_MS {
            let step = (self.target_batch / 8).max(1);
            self.target_batch = (self.target_batch + step).min(batch_cap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sustained_slow_ticks_shrink_toward_the_floor() {
        let mut sizer = AdaptiveSizer::new(256);
        for _ in 0..64 {
            sizer.observe(200.0, 256);
        }
        assert_eq!(sizer.target_batch(), 8);
    }

    #[test]
    fn fast_ticks_grow_back_to_the_cap() {
        let mut sizer = AdaptiveSizer::new(256);
        for _ in 0..32 {
            sizer.observe(200.0, 256);
        }
        let shrunk = sizer.target_batch();
        assert!(shrunk < 256);
        for _ in 0..256 {
            sizer.observe(1.0, 256);
        }
        assert_eq!(sizer.target_batch(), 256);
        assert!(sizer.target_batch() >= shrunk);
    }

    #[test]
    fn dead_band_leaves_target_alone() {
        let mut sizer = AdaptiveSizer::new(64);
        // Pin the EWMA inside (0.8, 1.3) x budget.
        for _ in 0..128 {
            sizer.observe(TICK_BUDGET_MS, 64);
        }
        assert_eq!(sizer.target_batch(), 64);
    }

    #[test]
    fn ewma_blends_toward_observations() {
        let mut sizer = AdaptiveSizer::new(64);
        sizer.observe(10.0, 64);
        assert!((sizer.ewma_ms() - 2.0).abs() < 1e-9);
        sizer.observe(10.0, 64);
        assert!((sizer.ewma_ms() - 3.6).abs() < 1e-9);
    }
}
