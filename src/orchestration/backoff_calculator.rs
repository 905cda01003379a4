//! # Backoff Calculator
//!
//! Retry delay computation and retry eligibility for task attempts.
//!
//! ## Strategies
//!
//! - **Fixed**: `base`
//! - **Exponential**: `base * multiplier^attempt`
//! - **Linear**: `base * attempt`
//! - **Jittered**: exponential scaled by a random factor in `[0.5, 1.5]`
//!
//! Every strategy is capped at the policy's `max_delay`. `attempt` is the 1-based
//! number of the attempt that just failed, so with the default policy the first
//! retry waits 2s, the second 4s, the third 8s.

use crate::models::{BackoffStrategy, RetryPolicy};
use crate::orchestration::errors::TaskError;
use rand::Rng;
use std::time::Duration;

/// Delay before retrying after failed attempt number `attempt`
pub fn compute_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    compute_delay_with_rng(policy, attempt, &mut rand::thread_rng())
}

/// [`compute_delay`] with an explicit random source for the jittered strategy
pub fn compute_delay_with_rng<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    attempt: u32,
    rng: &mut R,
) -> Duration {
    let base = policy.base_delay.as_secs_f64();
    let exponential = || base * policy.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

    let seconds = match policy.strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Exponential => exponential(),
        BackoffStrategy::Linear => base * f64::from(attempt),
        BackoffStrategy::Jittered => exponential() * rng.gen_range(0.5..=1.5),
    };

    clamp(seconds, policy.max_delay)
}

fn clamp(seconds: f64, max: Duration) -> Duration {
    if !seconds.is_finite() || seconds >= max.as_secs_f64() {
        return max;
    }
    if seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(seconds)
}

/// Whether another attempt is allowed after attempt number `attempt` failed
///
/// Fatal error kinds never retry. Otherwise the kind must pass the policy's
/// kind filter and `attempt` must be below `max_attempts`.
pub fn should_retry(policy: &RetryPolicy, error: &TaskError, attempt: u32) -> bool {
    if error.kind.is_fatal() {
        return false;
    }
    if !policy.allows_kind(error.kind.name()) {
        return false;
    }
    attempt < policy.max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_exponential_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(compute_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(compute_delay(&policy, 2), Duration::from_secs(4));
        assert_eq!(compute_delay(&policy, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = RetryPolicy::default().with_strategy(BackoffStrategy::Fixed);
        assert_eq!(compute_delay(&fixed, 5), Duration::from_secs(1));

        let linear = RetryPolicy::default().with_strategy(BackoffStrategy::Linear);
        assert_eq!(compute_delay(&linear, 3), Duration::from_secs(3));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(30));
        assert_eq!(compute_delay(&policy, 10), Duration::from_secs(30));
        assert_eq!(compute_delay(&policy, u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default().with_strategy(BackoffStrategy::Jittered);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let delay = compute_delay_with_rng(&policy, 2, &mut rng);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_should_retry_respects_attempts_and_kinds() {
        let policy = RetryPolicy::default();
        let transient = TaskError::connection("reset by peer");
        assert!(should_retry(&policy, &transient, 1));
        assert!(should_retry(&policy, &transient, 2));
        assert!(!should_retry(&policy, &transient, 3));

        assert!(!should_retry(&policy, &TaskError::validation("bad input"), 1));

        let restricted = RetryPolicy::default_transient();
        assert!(!should_retry(&restricted, &TaskError::other("quota", "exhausted"), 1));
        assert!(should_retry(&restricted, &TaskError::timeout("slow"), 1));
    }
}
