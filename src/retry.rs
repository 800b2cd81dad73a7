//! Bounded retry with exponential backoff, used for loading transcription models.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts. `op` receives the 1-based
/// attempt number.
///
/// Exhaustion returns [`Error::Model`] naming the attempt count and the last error.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    retry_with_sleep(policy, thread::sleep, op)
}

/// [`retry_with_backoff`] with an injectable sleep.
pub fn retry_with_sleep<T>(
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration),
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= attempts => {
                return Err(Error::Model(format!(
                    "giving up after {attempt} attempts: {err}"
                )));
            }
            Err(err) => {
                let delay = policy.backoff_for(attempt);
                warn!(attempt, max_attempts = attempts, ?delay, error = %err, "attempt failed, retrying");
                sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_saturates() {
        let p = policy(10);
        assert_eq!(p.backoff_for(1), Duration::from_millis(100));
        assert_eq!(p.backoff_for(2), Duration::from_millis(200));
        assert_eq!(p.backoff_for(3), Duration::from_millis(350));
        assert_eq!(p.backoff_for(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut slept = Vec::new();
        let mut calls = 0;
        let result: Result<()> = retry_with_sleep(
            &policy(3),
            |d| slept.push(d),
            |_| {
                calls += 1;
                Err(Error::Model("weights missing".to_owned()))
            },
        );

        assert_eq!(calls, 3);
        assert_eq!(slept.len(), 2);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("3 attempts"), "{err}");
        assert!(err.contains("weights missing"), "{err}");
    }

    #[test]
    fn returns_first_success() -> anyhow::Result<()> {
        let value = retry_with_sleep(
            &policy(5),
            |_| {},
            |attempt| {
                if attempt < 3 {
                    Err(Error::msg("not yet"))
                } else {
                    Ok(attempt)
                }
            },
        )?;
        assert_eq!(value, 3);
        Ok(())
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = retry_with_sleep(&policy(0), |_| {}, |_| -> Result<()> {
            calls += 1;
            Err(Error::msg("no"))
        });
        assert_eq!(calls, 1);
    }
}
