use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result};

/// Bounded retry with randomized backoff.
///
/// Fatal exchange errors abort immediately; anything else is retried
/// up to `max_attempts` with a uniformly random pause drawn from
/// `[backoff_min, backoff_max]` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_min: Duration::from_secs(5),
            backoff_max: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// A policy without pauses, for tests and fast-failing probes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_min: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts.max(1) {
            match action().await {
                Ok(value) => return Ok(value),
                Err(Error::Exchange(exchange_error)) if exchange_error.is_fatal() => {
                    return Err(Error::Exchange(exchange_error));
                }
                Err(error) => {
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        %error,
                        "exchange call failed"
                    );
                    last_error = Some(error);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff()).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Exchange(crate::error::ExchangeError::Other(format!(
                "{label}: no attempts executed"
            )))
        }))
    }

    fn backoff(&self) -> Duration {
        let min = self.backoff_min.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        if max <= min {
            return self.backoff_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
