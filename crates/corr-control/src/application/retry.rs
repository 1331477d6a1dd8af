//! RetryPolicy: bounded polling shared by the arm and schedule protocols.
//!
//! A policy caps a polling loop three ways: a maximum number of attempts, a
//! backoff between attempts, and an overall deadline.  Leaving both the
//! attempt cap and the deadline unset polls forever.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::clock::Clock;

/// Delay between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * factor^(attempt-1)`, capped at `max`.
    Exponential {
        initial: Duration,
        factor: u32,
        max: Duration,
    },
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let exponent = attempt.saturating_sub(1).min(31);
                let scale = factor.max(1).saturating_pow(exponent);
                initial.saturating_mul(scale).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` means no attempt cap.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// Upper bound on the time from the first attempt to giving up.
    /// `None` means no deadline.
    pub deadline: Option<Duration>,
}

/// The loop gave up; `last` is what the final attempt reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<R> {
    pub attempts: u32,
    pub last: R,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration, deadline: Option<Duration>) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed(interval),
            deadline,
        }
    }

    pub fn attempts(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff: Backoff::Fixed(interval),
            deadline: None,
        }
    }

    /// Runs `attempt` until it returns `Ok`, sleeping on `clock` between
    /// attempts.  An attempt whose following sleep would cross the deadline
    /// is the last one.
    ///
    /// # Errors
    ///
    /// [`Exhausted`] carrying the last attempt's `Err` value.
    pub async fn run<T, R, F, Fut>(&self, clock: &dyn Clock, mut attempt: F) -> Result<T, Exhausted<R>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, R>>,
    {
        let started = clock.now();
        let mut n = 0u32;
        loop {
            n += 1;
            let last = match attempt(n).await {
                Ok(done) => return Ok(done),
                Err(last) => last,
            };
            if self.max_attempts.is_some_and(|max| n >= max) {
                return Err(Exhausted { attempts: n, last });
            }
            let delay = self.backoff.delay(n);
            if let Some(deadline) = self.deadline {
                let elapsed = clock.now().duration_since(started).unwrap_or_default();
                if elapsed + delay > deadline {
                    return Err(Exhausted { attempts: n, last });
                }
            }
            clock.sleep(delay).await;
        }
    }
}
