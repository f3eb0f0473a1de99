use std::time::Duration;

use rand::Rng;

use crate::BackoffPolicy;

/// Bounded exponential backoff with jitter.
///
/// The n-th consecutive delay is `base * 2^n` capped at `max`, of which the
/// upper half is randomized. `reset()` brings the next delay back to `base`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        let base = policy.base_delay();
        Self {
            base,
            max: policy.max_delay().max(base),
            attempt: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Upper bound of the next delay, without jitter
    pub(crate) fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1).min(31);

        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        if jitter_ms == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
