//! Retry schedule for queued deliveries.
//!
//! Exponential growth from `base_delay`, capped at `max_delay`, with "equal
//! jitter": the top `jitter` fraction of each delay is randomised so retries
//! from many devices do not line up.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sigil_shared::config::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
}

impl Backoff {
    pub fn new(mut policy: RetryPolicy) -> Self {
        if !policy.jitter.is_finite() {
            policy.jitter = RetryPolicy::default().jitter;
        }
        policy.jitter = policy.jitter.clamp(0.0, 1.0);
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        let spread = ceiling.mul_f64(self.policy.jitter);
        let fixed = ceiling.saturating_sub(spread);

        let random = if spread.is_zero() {
            Duration::ZERO
        } else {
            spread.mul_f64(rng.gen_range(0.0..=1.0))
        };
        fixed + random
    }

    /// Un-jittered delay for `attempt`.
    fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.policy
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_delay)
    }

    /// When retry `attempt` is due. Always strictly later than `previous`,
    /// even once the delay has hit the ceiling or jitter pulls it back.
    pub fn next_attempt_at(
        &self,
        now: DateTime<Utc>,
        previous: DateTime<Utc>,
        attempt: u32,
    ) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(1));
        let candidate = now + delay;
        let floor = previous + chrono::Duration::milliseconds(1);
        candidate.max(floor)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.policy.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 6,
            jitter,
        }
    }

    #[test]
    fn grows_exponentially_to_ceiling() {
        let backoff = Backoff::new(policy(0.0));
        let delays: Vec<u64> = (1..=7).map(|a| backoff.delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 2000, 2000]);
    }

    #[test]
    fn jitter_stays_in_upper_band() {
        let backoff = Backoff::new(policy(0.5));
        let mut rng = rand::thread_rng();
        for attempt in 1..=6 {
            let ceiling = backoff.ceiling(attempt);
            for _ in 0..50 {
                let d = backoff.delay_with(attempt, &mut rng);
                assert!(d <= ceiling);
                assert!(d >= ceiling / 2);
            }
        }
    }

    #[test]
    fn lowest_jitter_draw_is_half_the_ceiling() {
        let backoff = Backoff::new(policy(0.5));
        let mut rng = StepRng::new(0, 0);
        assert_eq!(backoff.delay_with(3, &mut rng), Duration::from_millis(200));
    }

    #[test]
    fn next_attempt_strictly_increases() {
        let backoff = Backoff::new(policy(1.0));
        let now = Utc::now();
        let mut previous = now;
        for attempt in 1..=20 {
            // Retrying early (e.g. on connectivity restore) must still move forward.
            let next = backoff.next_attempt_at(now, previous, attempt);
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let backoff = Backoff::new(policy(0.0));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(2));
        assert!(backoff.exhausted(6));
        assert!(!backoff.exhausted(5));
    }

    #[test]
    fn non_finite_jitter_falls_back_to_default() {
        let backoff = Backoff::new(policy(f64::NAN));
        assert_eq!(backoff.policy().jitter, 0.5);
        let delay = backoff.delay(1);
        assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));

        let backoff = Backoff::new(policy(f64::INFINITY));
        assert_eq!(backoff.policy().jitter, 0.5);
    }
}
