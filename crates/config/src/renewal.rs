//! Renewal schedule and retry policy.

use std::time::Duration;
use validator::{Validate, ValidationError};

/// Renewal scheduling parameters. Immutable once handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct RenewalConfig {
    /// How often certificate freshness is checked
    #[validate(custom(function = "validate_check_interval"))]
    pub check_interval: Duration,

    /// Renew once remaining validity drops below this
    pub renew_threshold: Duration,

    /// Issuance attempts per cycle before falling back
    #[validate(range(min = 1, max = 1000))]
    pub max_retries: u32,

    /// Base unit of the linear backoff between attempts
    pub retry_interval: Duration,

    /// Upper bound on a single backoff sleep
    pub max_backoff: Duration,

    /// Minimum delay between process start and the first check
    pub startup_delay: Duration,

    /// Deadline for one issuance call
    #[validate(custom(function = "validate_nonzero"))]
    pub issue_timeout: Duration,
}

pub fn default_check_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

pub fn default_renew_threshold() -> Duration {
    Duration::from_secs(3 * 24 * 3600)
}

pub fn default_max_retries() -> u32 {
    12
}

pub fn default_retry_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

pub fn default_max_backoff() -> Duration {
    Duration::from_secs(3600)
}

pub fn default_startup_delay() -> Duration {
    Duration::from_secs(5 * 60)
}

pub fn default_issue_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            renew_threshold: default_renew_threshold(),
            max_retries: default_max_retries(),
            retry_interval: default_retry_interval(),
            max_backoff: default_max_backoff(),
            startup_delay: default_startup_delay(),
            issue_timeout: default_issue_timeout(),
        }
    }
}

impl RenewalConfig {
    /// Sleep before attempt number `attempt` (zero-based).
    ///
    /// The first attempt runs immediately; later attempts wait
    /// `attempt * retry_interval`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.retry_interval
            .saturating_mul(attempt)
            .min(self.max_backoff)
    }

    /// Delay before the first check after a (re)start.
    ///
    /// `since_last_check` is the time elapsed since the persisted last check,
    /// if any. The result is never shorter than `startup_delay`.
    pub fn initial_delay(&self, since_last_check: Option<Duration>) -> Duration {
        match since_last_check {
            Some(elapsed) if elapsed < self.check_interval => {
                (self.check_interval - elapsed).max(self.startup_delay)
            }
            _ => self.startup_delay,
        }
    }
}

fn validate_check_interval(interval: &Duration) -> Result<(), ValidationError> {
    if *interval < Duration::from_secs(60) {
        return Err(ValidationError::new("check_interval_too_short"));
    }
    Ok(())
}

fn validate_nonzero(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let config = RenewalConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(21_600));
        assert_eq!(config.renew_threshold, Duration::from_secs(259_200));
        assert_eq!(config.max_retries, 12);
        assert_eq!(config.retry_interval, Duration::from_secs(1_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_schedule() {
        let config = RenewalConfig::default();
        assert_eq!(config.backoff(0), Duration::ZERO);
        assert_eq!(config.backoff(1), Duration::from_secs(1_800));
        assert_eq!(config.backoff(2), Duration::from_secs(3_600));
        // Capped from here on
        assert_eq!(config.backoff(3), Duration::from_secs(3_600));
        assert_eq!(config.backoff(11), Duration::from_secs(3_600));
    }

    #[test]
    fn test_initial_delay_first_run() {
        let config = RenewalConfig::default();
        assert_eq!(config.initial_delay(None), Duration::from_secs(300));
    }

    #[test]
    fn test_initial_delay_resumes_interval() {
        let config = RenewalConfig::default();
        // Checked an hour ago: wait out the remaining five hours
        let delay = config.initial_delay(Some(Duration::from_secs(3600)));
        assert_eq!(delay, Duration::from_secs(5 * 3600));
    }

    #[test]
    fn test_initial_delay_never_below_cooldown() {
        let config = RenewalConfig::default();
        let almost_due = config.check_interval - Duration::from_secs(10);
        assert_eq!(config.initial_delay(Some(almost_due)), Duration::from_secs(300));

        let overdue = config.check_interval * 2;
        assert_eq!(config.initial_delay(Some(overdue)), Duration::from_secs(300));
    }

    #[test]
    fn test_validation_rejects_short_interval() {
        let config = RenewalConfig {
            check_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("check_interval"));
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let config = RenewalConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_backoff_matches_formula(attempt in 0u32..64, interval_secs in 0u64..7200) {
            let config = RenewalConfig {
                retry_interval: Duration::from_secs(interval_secs),
                ..Default::default()
            };
            let expected = if attempt == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs(interval_secs * u64::from(attempt)).min(Duration::from_secs(3600))
            };
            prop_assert_eq!(config.backoff(attempt), expected);
        }

        #[test]
        fn prop_backoff_non_decreasing(attempt in 0u32..64, interval_secs in 0u64..7200) {
            let config = RenewalConfig {
                retry_interval: Duration::from_secs(interval_secs),
                ..Default::default()
            };
            prop_assert!(config.backoff(attempt) <= config.backoff(attempt + 1));
            prop_assert!(config.backoff(attempt) <= config.max_backoff);
        }
    }
}
