//! Centralised retry/backoff policy shape, shared by the object-store
//! adapter and the collection coordinator. Both consume the same
//! `{attempts, baseDelay, backoffBase}` shape but are configured with
//! independent values.

use std::thread;
use std::time::Duration;

use crate::error::DbError;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_base: f64,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64, backoff_base: f64) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            base_delay_ms,
            backoff_base,
        }
    }

    /// Delay before retry attempt `i` (0-based: the delay slept *after* the
    /// `i`-th failure, before attempt `i + 1`).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = self.backoff_base.powi(attempt_index as i32);
        Duration::from_millis((self.base_delay_ms as f64 * factor) as u64)
    }

    /// Run `f` up to `attempts` times, sleeping `delay_for` between
    /// attempts, as long as `is_retryable` says the error is transient.
    /// Returns the last error once attempts are exhausted.
    pub fn run<T>(
        &self,
        mut f: impl FnMut() -> Result<T, DbError>,
        is_retryable: impl Fn(&DbError) -> bool,
    ) -> Result<T, DbError> {
        let mut last_err = None;
        for attempt in 0..self.attempts {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = is_retryable(&err);
                    last_err = Some(err);
                    if !retryable || attempt + 1 == self.attempts {
                        break;
                    }
                    thread::sleep(self.delay_for(attempt));
                }
            }
        }
        Err(last_err.expect("RetryPolicy::run always records an error on failure"))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(3, 1000, 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_until_success() {
        let policy = RetryPolicy::new(3, 1, 1.0);
        let calls = Cell::new(0);
        let result = policy.run(
            || {
                let n = calls.get() + 1;
                calls.set(n);
                if n < 3 {
                    Err(DbError::file_io_error("transient"))
                } else {
                    Ok(42)
                }
            },
            |e| e.is_transient_store_error(),
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn stops_on_non_retryable_error() {
        let policy = RetryPolicy::new(5, 1, 1.0);
        let calls = Cell::new(0);
        let result: Result<(), DbError> = policy.run(
            || {
                calls.set(calls.get() + 1);
                Err(DbError::permission_denied("nope"))
            },
            |e| e.is_transient_store_error(),
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
