// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Multiplier spreading sequential trace ids evenly over the u64 space.
const KNUTH_FACTOR: u64 = 1_111_111_111_111_111_111;

/// Keeps (100 * `sample_rate`)% of traces, deterministically by trace id.
///
/// Two tracers configured with the same rate reach the same verdict for the same trace.
#[derive(Clone, Copy, PartialEq)]
pub struct RateSampler {
    sample_rate: f64,
    threshold: u64,
}

impl fmt::Debug for RateSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateSampler")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl RateSampler {
    /// `sample_rate` is clamped to [0, 1]. NaN counts as 0.
    pub fn new(sample_rate: f64) -> Self {
        let sample_rate = if sample_rate.is_nan() {
            0.0
        } else {
            sample_rate.clamp(0.0, 1.0)
        };
        let threshold = if sample_rate >= 1.0 {
            u64::MAX
        } else {
            (sample_rate * u64::MAX as f64) as u64
        };
        RateSampler {
            sample_rate,
            threshold,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn sample(&self, trace_id: u64) -> bool {
        if self.sample_rate <= 0.0 {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        trace_id.wrapping_mul(KNUTH_FACTOR) <= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_is_clamped() {
        assert_eq!(RateSampler::new(1.5).sample_rate(), 1.0);
        assert_eq!(RateSampler::new(-0.3).sample_rate(), 0.0);
        assert_eq!(RateSampler::new(f64::NAN).sample_rate(), 0.0);
    }

    #[test]
    fn test_extremes() {
        let keep_all = RateSampler::new(1.0);
        let drop_all = RateSampler::new(0.0);
        for id in [1, 2, u64::MAX, 12345678901234567890] {
            assert!(keep_all.sample(id));
            assert!(!drop_all.sample(id));
        }
    }

    #[test]
    fn test_decision_is_deterministic() {
        let sampler = RateSampler::new(0.5);
        for id in 1..200u64 {
            assert_eq!(sampler.sample(id), RateSampler::new(0.5).sample(id));
        }
    }

    #[test]
    fn test_sequential_ids_follow_rate() {
        for rate in [0.1, 0.25, 0.5, 0.9] {
            let sampler = RateSampler::new(rate);
            let kept = (1..=10_000u64).filter(|id| sampler.sample(*id)).count();
            let expected = rate * 10_000.0;
            assert!(
                (kept as f64 - expected).abs() < 200.0,
                "rate {rate}: kept {kept}"
            );
        }
    }
}
