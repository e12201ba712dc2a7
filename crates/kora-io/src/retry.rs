use crate::store::StoreError;
use std::thread;
use std::time::{Duration, Instant};

/// Bounded exponential backoff for backend calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: StoreError,
    pub attempts: u32,
    /// The last error was not transient, so retrying was pointless.
    pub permanent: bool,
}

impl RetryPolicy {
    /// Policy without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let micros = (self.initial_backoff.as_micros() as f64 * factor)
            .min(self.max_backoff.as_micros() as f64);
        Duration::from_micros(micros.round() as u64)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called before
    /// each backoff sleep. When `deadline` is set, no sleep extends past it.
    pub fn run<T, F, R>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
        mut on_retry: R,
    ) -> Result<(T, u32), RetryFailure>
    where
        F: FnMut(u32) -> Result<T, StoreError>,
        R: FnMut(u32, &StoreError, Duration),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match op(attempt) {
                Ok(value) => return Ok((value, attempt)),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    permanent: true,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    permanent: false,
                });
            }

            let delay = self.backoff_after(attempt);
            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        permanent: false,
                    });
                }
            }
            on_retry(attempt, &error, delay);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            attempt += 1;
        }
    }
}
