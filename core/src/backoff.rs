//! Exponential backoff with jitter and the retry decision

use std::time::Duration;

/// Upper bound (exclusive) of the random jitter fraction
pub const DEFAULT_MAX_JITTER: f64 = 0.1;

/// Backoff parameters shared by every operation of a dispatcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`
    pub max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

/// What to do after an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `attempt` (1-based retry count)
    Retry { attempt: u32, delay: Duration },
    /// The attempt budget is spent
    Exhausted,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// `min(base * 2^(attempt-1) * (1 + jitter), max_delay)`; zero for attempt 0
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX).min(64);
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent) * (1.0 + jitter.max(0.0));
        let capped = secs.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped)
    }

    /// Delay before retry number `attempt`, with fresh random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, fastrand::f64() * self.max_jitter)
    }

    /// Pure retry decision after `attempts_made` failed attempts
    ///
    /// An operation allowed `max_retries` retries gets `max_retries + 1`
    /// attempts in total.
    pub fn decide(&self, attempts_made: u32, max_retries: u32) -> RetryDecision {
        if attempts_made > max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            attempt: attempts_made,
            delay: self.delay(attempts_made),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(2000))
    }

    fn within(d: Duration, low_ms: f64, high_ms: f64) -> bool {
        let ms = d.as_secs_f64() * 1000.0;
        ms >= low_ms - 1e-6 && ms <= high_ms + 1e-6
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(0, 0.0), Duration::ZERO);
        assert!(within(p.delay_with_jitter(1, 0.0), 100.0, 100.0));
        assert!(within(p.delay_with_jitter(2, 0.0), 200.0, 200.0));
        assert!(within(p.delay_with_jitter(3, 0.0), 400.0, 400.0));
    }

    #[test]
    fn test_backoff_with_random_jitter_stays_in_band() {
        let p = policy();
        for _ in 0..200 {
            for k in 1..=4u32 {
                let base = 100.0 * f64::from(2u32.pow(k - 1));
                let d = p.delay(k);
                assert!(within(d, base, base * 1.1), "attempt {k}: {d:?}");
            }
        }
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(10, 0.05), Duration::from_millis(2000));
        assert_eq!(p.delay(40), Duration::from_millis(2000));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(2000));
    }

    #[test]
    fn test_decide_gives_max_retries_plus_one_attempts() {
        let p = policy();
        let mut attempts = 0;
        loop {
            attempts += 1;
            if p.decide(attempts, 3) == RetryDecision::Exhausted {
                break;
            }
        }
        assert_eq!(attempts, 4);
    }

    #[test]
    fn test_decide_reports_retry_number_and_delay() {
        let p = policy();
        match p.decide(2, 5) {
            RetryDecision::Retry { attempt, delay } => {
                assert_eq!(attempt, 2);
                assert!(within(delay, 200.0, 220.0));
            }
            RetryDecision::Exhausted => panic!("expected a retry"),
        }
        assert_eq!(p.decide(1, 0), RetryDecision::Exhausted);
    }
}
