//! Logits-to-token sampling.
//!
//! The default path is greedy; with a positive temperature the chain is
//! top-k truncation, temperature scaling, a numerically stable softmax,
//! nucleus truncation, and a uniform draw over the renormalized prefix.

use rand::rngs::StdRng;
use rand::Rng;

use crate::engine::Token;

/// Per-request sampling knobs.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    /// `<= 0` selects greedy argmax.
    pub temperature: f32,
    /// Nucleus mass; `>= 1` disables the cut.
    pub top_p: f32,
    /// `0` disables top-k truncation.
    pub top_k: i32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: 0.95,
            top_k: 0,
        }
    }
}

fn argmax(logits: &[f32]) -> Token {
    let mut best = 0usize;
    for (i, &v) in logits.iter().enumerate().skip(1) {
        if v > logits[best] {
            best = i;
        }
    }
    best as Token
}

/// Sample one token from a logits row.
pub fn sample(logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Token {
    let n_vocab = logits.len();
    if n_vocab == 0 {
        return 0;
    }
    if params.temperature <= 0.0 {
        return argmax(logits);
    }

    // Candidate indices, highest logit first; a partial sort when top-k
    // truncates the tail anyway.
    let mut idx: Vec<usize> = (0..n_vocab).collect();
    let use_n = if params.top_k > 0 && (params.top_k as usize) < n_vocab {
        let k = params.top_k as usize;
        idx.select_nth_unstable_by(k - 1, |&a, &b| logits[b].total_cmp(&logits[a]));
        idx.truncate(k);
        idx.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]));
        k
    } else {
        idx.sort_unstable_by(|&a, &b| logits[b].total_cmp(&logits[a]));
        n_vocab
    };

    // Temperature scaling + softmax, max-subtracted for stability.
    let inv_t = 1.0 / params.temperature;
    let max_scaled = logits[idx[0]] * inv_t;
    let mut probs = Vec::with_capacity(use_n);
    let mut sum = 0.0f32;
    for &i in idx.iter().take(use_n) {
        let v = ((logits[i] * inv_t) - max_scaled).exp();
        probs.push(v);
        sum += v;
    }
    if sum <= 0.0 || !sum.is_finite() {
        return idx[0] as Token;
    }
    for p in &mut probs {
        *p /= sum;
    }

    // Nucleus cut: smallest prefix with cumulative mass >= top_p, at least
    // one candidate kept.
    let top_p = params.top_p.clamp(0.0, 1.0);
    let mut cut = use_n;
    if top_p < 0.9999 {
        let mut cum = 0.0f32;
        cut = 0;
        for &p in probs.iter().take(use_n) {
            cum += p;
            cut += 1;
            if cum >= top_p {
                break;
            }
        }
        cut = cut.max(1);
    }

    let kept_sum: f32 = probs[..cut].iter().sum();
    let r: f32 = rng.gen::<f32>() * kept_sum;
    let mut acc = 0.0f32;
    for (i, &p) in probs[..cut].iter().enumerate() {
        acc += p;
        if r <= acc || i == cut - 1 {
            return idx[i] as Token;
        }
    }
    idx[0] as Token
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let logits = [0.1, 2.5, -1.0, 2.4];
        let params = SamplingParams {
            temperature: 0.0,
            top_p: 0.9,
            top_k: 0,
        };
        assert_eq!(sample(&logits, &params, &mut rng(1)), 1);
    }

    #[test]
    fn negative_temperature_is_argmax() {
        let logits = [3.0, 1.0, 2.0];
        let params = SamplingParams {
            temperature: -1.0,
            top_p: 1.0,
            top_k: 0,
        };
        assert_eq!(sample(&logits, &params, &mut rng(1)), 0);
    }

    #[test]
    fn top_k_one_is_argmax_at_any_temperature() {
        let logits = [0.5, 0.1, 4.0, 3.9];
        for seed in 0..16 {
            let params = SamplingParams {
                temperature: 1.7,
                top_p: 0.4,
                top_k: 1,
            };
            assert_eq!(sample(&logits, &params, &mut rng(seed)), 2);
        }
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let logits = [1.0, 0.9, 0.8, 0.7, 0.6, 0.5];
        let params = SamplingParams {
            temperature: 0.8,
            top_p: 0.95,
            top_k: 4,
        };
        let a = sample(&logits, &params, &mut rng(42));
        let b = sample(&logits, &params, &mut rng(42));
        assert_eq!(a, b);
    }

    #[test]
    fn sampled_token_stays_inside_nucleus() {
        // Token 0 holds almost all the mass; a tight nucleus can only pick it.
        let logits = [10.0, 0.0, 0.0, 0.0];
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.5,
            top_k: 0,
        };
        for seed in 0..32 {
            assert_eq!(sample(&logits, &params, &mut rng(seed)), 0);
        }
    }

    #[test]
    fn degenerate_mass_falls_back_to_argmax() {
        let logits = [f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY];
        let params = SamplingParams {
            temperature: 1.0,
            top_p: 0.9,
            top_k: 0,
        };
        let t = sample(&logits, &params, &mut rng(7));
        assert!((0..3).contains(&t));
    }

    #[test]
    fn empty_logits_return_zero() {
        let params = SamplingParams::default();
        assert_eq!(sample(&[], &params, &mut rng(1)), 0);
    }
}
