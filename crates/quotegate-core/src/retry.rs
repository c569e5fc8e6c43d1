//! Retry scheduling for work items that failed every provider.

use std::time::Duration;

/// Backoff strategy between queue retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^retry_count`, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        /// Spread each delay uniformly over +/- 50%.
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl Backoff {
    pub fn delay(self, retry_count: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(seconds);
                if jitter {
                    spread(delay)
                } else {
                    delay
                }
            }
        }
    }
}

fn spread(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let half = millis / 2;
    Duration::from_millis(millis - half + fastrand::u64(0..=half.saturating_mul(2)))
}

/// How many times a work item is re-queued and how long it waits in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failures allowed before an item is dead-lettered.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether an item whose counter was just incremented to `retry_count` goes back to its lane.
    pub const fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before re-enqueueing, given the already-incremented retry counter.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        self.backoff.delay(retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(8));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_of_nominal_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..20 {
            let delay = backoff.delay(1).as_millis();
            assert!((200..=600).contains(&delay), "delay {delay}ms out of range");
        }
    }

    #[test]
    fn allows_counts_failures_against_max() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(10),
            },
        };
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!RetryPolicy::no_retry().allows(1));
    }
}
