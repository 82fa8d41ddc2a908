use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff with downward jitter
///
/// Attempt `n` waits `base * 2^(n-1)`, capped at `max`, then shortened by a
/// random fraction of at most `jitter` so peers that failed together do not
/// retry in lockstep. The result never exceeds `max`.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in [0, 1]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1).saturating_sub(1).min(31);
        let capped = self.base.saturating_mul(1u32 << exp).min(self.max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let cut: f64 = rand::thread_rng().gen_range(0.0..=jitter);
        capped.saturating_sub(capped.mul_f64(cut))
    }
}
