//! Bounded retry loop for operations that race other processes for the
//! store's write lock.

use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};
use rand::Rng;

use crate::config::RetryPolicy;
use crate::error::{is_busy, Error, Result};

/// Exponential backoff calculator with jitter
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Get the next delay and bump the attempt counter.
    ///
    /// The delay doubles per attempt up to `max`; the upper half of it is
    /// randomized so that processes which collided once spread out.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let capped = self.initial.saturating_mul(factor).min(self.max);
        let half = capped / 2;
        let jitter_us = rand::thread_rng().gen_range(0..=half.as_micros() as u64);
        self.attempt = self.attempt.saturating_add(1);
        half + Duration::from_micros(jitter_us)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `operation` until it succeeds, fails with a non-contention error, or
/// the policy's attempt/time ceiling is reached.
///
/// Only busy/locked engine failures are retried. Exhausting the policy
/// turns the last of them into `Error::StoreBusy`.
pub fn with_retry<T, F>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let start = Instant::now();
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(Error::Storage(err)) if is_busy(&err) => err,
            Err(err) => return Err(err),
        };
        let elapsed = start.elapsed();
        if attempts >= policy.max_attempts || elapsed >= policy.max_elapsed {
            warn!(
                "[retry] store still busy after {} attempts in {:?}, giving up",
                attempts, elapsed
            );
            return Err(Error::StoreBusy {
                attempts,
                elapsed,
                source: err,
            });
        }
        let delay = backoff.next_delay().min(policy.max_elapsed - elapsed);
        trace!("[retry] attempt {} busy, sleeping {:?}", attempts, delay);
        thread::sleep(delay);
    }
}

#[cfg(test)]
mod retry_test {
    use super::*;
    use crate::config::AccessMode;
    use std::cell::Cell;

    fn busy() -> Error {
        Error::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            max_attempts,
            max_elapsed: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_increases() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();
        assert!(d1 >= Duration::from_millis(50) && d1 <= Duration::from_millis(100));
        assert!(d2 >= Duration::from_millis(100) && d2 <= Duration::from_millis(200));
        assert!(d3 >= Duration::from_millis(200) && d3 <= Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        for _ in 0..64 {
            assert!(backoff.next_delay() <= Duration::from_millis(500));
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    #[test]
    fn test_retries_until_success() {
        let calls = Cell::new(0);
        let result = with_retry(&quick(10), || {
            calls.set(calls.get() + 1);
            if calls.get() < 4 {
                Err(busy())
            } else {
                Ok("done")
            }
        });
        assert_eq!("done", result.unwrap());
        assert_eq!(4, calls.get());
    }

    #[test]
    fn test_gives_up_with_store_busy() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&quick(3), || {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        match result {
            Err(Error::StoreBusy { attempts, .. }) => assert_eq!(3, attempts),
            other => panic!("expected StoreBusy, got {:?}", other),
        }
        assert_eq!(3, calls.get());
    }

    #[test]
    fn test_elapsed_ceiling() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            max_attempts: u32::MAX,
            max_elapsed: Duration::from_millis(100),
        };
        let start = Instant::now();
        let result: Result<()> = with_retry(&policy, || Err(busy()));
        assert!(matches!(result, Err(Error::StoreBusy { .. })));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_other_errors_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = with_retry(&quick(10), || {
            calls.set(calls.get() + 1);
            Err(Error::ReadOnly {
                mode: AccessMode::ReadOnly,
            })
        });
        assert!(matches!(result, Err(Error::ReadOnly { .. })));
        assert_eq!(1, calls.get());
    }
}
