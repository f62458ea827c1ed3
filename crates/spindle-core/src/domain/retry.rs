//! Retry policy: what happens to an abandoned item.

use std::time::Duration;

/// Where an abandoned item goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonDisposition {
    /// Back to pending after `delay` (zero = immediately).
    Retry { delay: Duration },
    /// Attempts exhausted.
    DeadLetter,
}

/// Retry policy for abandoned items.
///
/// An item that has been leased `max_attempts` times is dead-lettered on its
/// next abandon. Otherwise it is re-queued after an exponential backoff:
/// `base_delay * multiplier^(attempts - 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Immediate requeue, dead-letter after `max_attempts` leases.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Multipliers below 1.0 (or NaN / infinite) fall back to 1.0, a constant
    /// delay.
    pub fn with_backoff(mut self, base_delay: Duration, multiplier: f64) -> Self {
        self.base_delay = base_delay;
        self.multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        self
    }

    /// Delay before the next attempt, given the attempts made so far (1-indexed).
    ///
    /// Saturates at `Duration::MAX`; backends must add it to a deadline with
    /// checked arithmetic.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn disposition(&self, attempts: u32) -> AbandonDisposition {
        if attempts >= self.max_attempts {
            AbandonDisposition::DeadLetter
        } else {
            AbandonDisposition::Retry {
                delay: self.next_delay(attempts),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_retries_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.disposition(1),
            AbandonDisposition::Retry {
                delay: Duration::ZERO
            }
        );
    }

    #[rstest]
    #[case(1, Duration::from_secs(2))]
    #[case(2, Duration::from_secs(4))]
    #[case(3, Duration::from_secs(8))]
    fn exponential_backoff(#[case] attempts: u32, #[case] expected: Duration) {
        let policy = RetryPolicy::immediate(10).with_backoff(Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(attempts), expected);
    }

    #[rstest]
    #[case(1, false)]
    #[case(2, false)]
    #[case(3, true)]
    #[case(4, true)]
    fn dead_letters_once_attempts_are_exhausted(#[case] attempts: u32, #[case] dead: bool) {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(
            policy.disposition(attempts) == AbandonDisposition::DeadLetter,
            dead
        );
    }

    #[rstest]
    #[case(-2.0)]
    #[case(0.5)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn unusable_multipliers_mean_constant_delay(#[case] multiplier: f64) {
        let policy = RetryPolicy::immediate(10).with_backoff(Duration::from_millis(100), multiplier);

        assert_eq!(policy.multiplier, 1.0);
        assert_eq!(policy.next_delay(5), Duration::from_millis(100));
    }

    #[test]
    fn huge_backoff_saturates() {
        let policy = RetryPolicy::immediate(u32::MAX).with_backoff(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(1_000), Duration::MAX);
    }
}
