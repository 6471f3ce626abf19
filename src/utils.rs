use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cancellation request shared between the operator (Ctrl+C handler, UI
/// thread) and the blocking motion/acquisition loop.
///
/// Requesting a stop is idempotent and may happen from any thread; the
/// loop observes it at its next poll iteration.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Acknowledge a handled request so the next operation can run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a [`wait_until`] loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate returned `Ok(true)`
    Completed,
    /// The stop flag was raised before the predicate was satisfied
    Cancelled,
    /// The timeout elapsed first
    TimedOut,
}

/// Poll a predicate until it holds, a stop is requested, or time runs out
///
/// The stop flag is checked before every predicate call, so cancellation is
/// honoured at poll granularity and never in the middle of a request.
///
/// # Arguments
/// * `predicate` - Returns `Ok(true)` when done, `Ok(false)` to keep polling
/// * `poll_interval` - Sleep between predicate calls
/// * `timeout` - Upper bound on the wait, `None` waits indefinitely
/// * `stop` - Cancellation request
///
/// # Returns
/// * `Ok(WaitOutcome)` describing why the loop ended
/// * `Err(e)` as soon as the predicate fails
///
/// # Example
/// ```
/// use std::time::Duration;
/// use emittance_scanner::utils::{wait_until, StopFlag, WaitOutcome};
///
/// let mut polls = 0;
/// let outcome = wait_until(
///     || {
///         polls += 1;
///         Ok::<bool, ()>(polls >= 3)
///     },
///     Duration::from_millis(1),
///     Some(Duration::from_secs(1)),
///     &StopFlag::new(),
/// );
/// assert_eq!(outcome, Ok(WaitOutcome::Completed));
/// ```
pub fn wait_until<F, E>(
    mut predicate: F,
    poll_interval: Duration,
    timeout: Option<Duration>,
    stop: &StopFlag,
) -> Result<WaitOutcome, E>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();

    loop {
        if stop.is_requested() {
            return Ok(WaitOutcome::Cancelled);
        }

        if predicate()? {
            return Ok(WaitOutcome::Completed);
        }

        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                return Ok(WaitOutcome::TimedOut);
            }
        }

        if !poll_interval.is_zero() {
            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until_success() {
        let mut count = 0;

        let result = wait_until(
            || {
                count += 1;
                Ok::<bool, &str>(count >= 3)
            },
            Duration::from_millis(1),
            Some(Duration::from_millis(500)),
            &StopFlag::new(),
        );

        assert_eq!(result, Ok(WaitOutcome::Completed));
        assert_eq!(count, 3);
    }

    #[test]
    fn test_wait_until_timeout() {
        let result = wait_until(
            || Ok::<bool, &str>(false),
            Duration::from_millis(5),
            Some(Duration::from_millis(30)),
            &StopFlag::new(),
        );

        assert_eq!(result, Ok(WaitOutcome::TimedOut));
    }

    #[test]
    fn test_wait_until_error() {
        let result = wait_until(
            || Err::<bool, &str>("link down"),
            Duration::from_millis(1),
            None,
            &StopFlag::new(),
        );

        assert_eq!(result, Err("link down"));
    }

    #[test]
    fn test_wait_until_cancelled_between_polls() {
        let stop = StopFlag::new();
        let remote = stop.clone();
        let mut polls = 0;

        let result = wait_until(
            || {
                polls += 1;
                if polls == 2 {
                    remote.request();
                }
                Ok::<bool, &str>(false)
            },
            Duration::ZERO,
            None,
            &stop,
        );

        assert_eq!(result, Ok(WaitOutcome::Cancelled));
        assert_eq!(polls, 2);
    }

    #[test]
    fn test_pending_stop_skips_predicate() {
        let stop = StopFlag::new();
        stop.request();
        let mut called = false;

        let result = wait_until(
            || {
                called = true;
                Ok::<bool, &str>(true)
            },
            Duration::ZERO,
            None,
            &stop,
        );

        assert_eq!(result, Ok(WaitOutcome::Cancelled));
        assert!(!called);

        stop.reset();
        assert!(!stop.is_requested());
    }
}
