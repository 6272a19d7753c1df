//! Retry scheduling: pure exponential backoff with a delay cap.
//!
//! Deterministic and side-effect-free so it can be unit-tested without
//! mocking time. Jitter is applied by the caller when the decision is
//! turned into a due time.

use std::time::Duration;

/// What to do with a delivery after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after this delay.
    RetryAfter(Duration),
    /// The attempt budget is spent; the record is abandoned.
    Exhausted,
}

/// Decide the next step after `attempts` attempts have been made.
///
/// Delay grows as `base_delay_ms * multiplier^(attempts - 1)`, capped at
/// `max_delay_ms`. Returns `Exhausted` exactly when `attempts` has reached
/// `max_attempts`.
pub fn next_retry(
    attempts: u32,
    base_delay_ms: u64,
    multiplier: u32,
    max_delay_ms: u64,
    max_attempts: u32,
) -> RetryDecision {
    if attempts >= max_attempts {
        return RetryDecision::Exhausted;
    }

    let base = base_delay_ms.max(1);
    let cap = max_delay_ms.max(base);
    let factor = (multiplier.max(1) as u64)
        .checked_pow(attempts.saturating_sub(1))
        .unwrap_or(u64::MAX);
    let delay = base.saturating_mul(factor).min(cap);

    RetryDecision::RetryAfter(Duration::from_millis(delay))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay_ms(decision: RetryDecision) -> u64 {
        match decision {
            RetryDecision::RetryAfter(d) => d.as_millis() as u64,
            RetryDecision::Exhausted => panic!("expected a retry"),
        }
    }

    #[test]
    fn first_retry_uses_base_delay() {
        assert_eq!(delay_ms(next_retry(1, 1000, 2, 60_000, 3)), 1000);
    }

    #[test]
    fn delay_doubles_per_attempt() {
        assert_eq!(delay_ms(next_retry(1, 1000, 2, 60_000, 10)), 1000);
        assert_eq!(delay_ms(next_retry(2, 1000, 2, 60_000, 10)), 2000);
        assert_eq!(delay_ms(next_retry(3, 1000, 2, 60_000, 10)), 4000);
        assert_eq!(delay_ms(next_retry(4, 1000, 2, 60_000, 10)), 8000);
    }

    #[test]
    fn delay_is_non_decreasing_until_cap() {
        let mut previous = 0;
        for attempts in 1..9 {
            let delay = delay_ms(next_retry(attempts, 100, 3, 50_000, 10));
            assert!(delay >= previous, "delay shrank at attempt {attempts}");
            previous = delay;
        }
    }

    #[test]
    fn delay_is_capped() {
        assert_eq!(delay_ms(next_retry(9, 1000, 10, 5000, 10)), 5000);
    }

    #[test]
    fn exhausted_exactly_at_max_attempts() {
        assert_ne!(next_retry(2, 1000, 2, 60_000, 3), RetryDecision::Exhausted);
        assert_eq!(next_retry(3, 1000, 2, 60_000, 3), RetryDecision::Exhausted);
        assert_eq!(next_retry(4, 1000, 2, 60_000, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn overflow_saturates_at_cap() {
        // multiplier^attempts would overflow u64; the delay must stay capped
        assert_eq!(delay_ms(next_retry(9, 60_000, 10, 60_000, 10)), 60_000);
    }

    #[test]
    fn three_attempt_scenario_delays() {
        // maxAttempts=3, base=1000ms, multiplier=2: failures schedule
        // ~1000ms then ~2000ms, and the third failure exhausts the budget.
        assert_eq!(delay_ms(next_retry(1, 1000, 2, 60_000, 3)), 1000);
        assert_eq!(delay_ms(next_retry(2, 1000, 2, 60_000, 3)), 2000);
        assert_eq!(next_retry(3, 1000, 2, 60_000, 3), RetryDecision::Exhausted);
    }
}
