//! Deadline- and attempt-bounded polling with cancellation.
//!
//! Every verification stage waits on the same loop: query, classify the
//! observation as pending, ready or failed, then sleep. The loop checks the
//! cancellation token on every tick and while a check is in flight, so an
//! interrupt never waits for a stage budget to drain.
//!
//! # Example
//!
//! ```ignore
//! let poller = Poller::new("manifest", Duration::from_secs(10), Duration::from_secs(600), cancel);
//! let state = poller
//!     .run(|| async {
//!         match store.manifest(key).await? {
//!             None => Ok(Tick::Pending(ManifestState::NotFound)),
//!             Some(m) if m.done() => Ok(Tick::Ready(m)),
//!             Some(m) => Ok(Tick::Pending(ManifestState::from(m))),
//!         }
//!     })
//!     .await;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;

/// Classification of one poll observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick<T, S> {
    /// Not there yet; keep polling. Carries what was observed.
    Pending(S),
    /// Terminal success
    Ready(T),
    /// Terminal failure; stop without waiting further
    Failed(S),
}

/// Why a poll loop stopped without a ready value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<S> {
    /// Budget exhausted
    Timeout {
        /// Last pending observation, `None` if no check ever completed
        last: Option<S>,
        /// Last check error, if the most recent checks failed
        last_error: Option<String>,
        /// Checks performed
        attempts: u32,
        /// Wall time spent
        waited: Duration,
    },
    /// The check reported a terminal failure
    Failed(S),
    /// The cancellation token fired
    Cancelled,
}

/// Reusable polling policy
#[derive(Debug, Clone)]
pub struct Poller {
    description: String,
    interval: Duration,
    max_wait: Duration,
    max_attempts: Option<u32>,
    delay_first: bool,
    cancel: CancellationToken,
}

impl Poller {
    /// Create a poller that checks immediately, then every `interval`, until
    /// `max_wait` has elapsed.
    pub fn new(
        description: impl Into<String>,
        interval: Duration,
        max_wait: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            description: description.into(),
            interval,
            max_wait,
            max_attempts: None,
            delay_first: false,
            cancel,
        }
    }

    /// Stop after `attempts` checks even if time remains
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sleep one interval before every check, including the first
    pub fn delay_first(mut self) -> Self {
        self.delay_first = true;
        self
    }

    /// Configured wait budget
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Run the loop until `check` is ready, fails, the budget runs out, or
    /// the token is cancelled.
    ///
    /// A zero budget (`max_wait` or `max_attempts`) times out without ever
    /// invoking `check`. Errors returned by `check` are logged and treated as
    /// pending, except cancellation which ends the loop.
    pub async fn run<T, S, F, Fut>(&self, mut check: F) -> Result<T, PollError<S>>
    where
        S: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Tick<T, S>, Error>>,
    {
        let start = Instant::now();
        let mut last: Option<S> = None;
        let mut last_error: Option<String> = None;
        let mut attempts = 0u32;

        if self.max_wait.is_zero() || self.max_attempts == Some(0) {
            return Err(PollError::Timeout {
                last,
                last_error,
                attempts,
                waited: Duration::ZERO,
            });
        }

        loop {
            if self.delay_first || attempts > 0 {
                let remaining = self.max_wait.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Err(PollError::Timeout {
                        last,
                        last_error,
                        attempts,
                        waited: start.elapsed(),
                    });
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(PollError::Cancelled),
                    _ = tokio::time::sleep(self.interval.min(remaining)) => {}
                }
            }

            if self.cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }

            attempts += 1;
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PollError::Cancelled),
                outcome = check() => outcome,
            };

            match outcome {
                Ok(Tick::Ready(value)) => {
                    debug!(
                        what = %self.description,
                        attempts,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Condition met"
                    );
                    return Ok(value);
                }
                Ok(Tick::Failed(observed)) => return Err(PollError::Failed(observed)),
                Ok(Tick::Pending(observed)) => {
                    debug!(
                        what = %self.description,
                        attempt = attempts,
                        observed = %observed,
                        "Waiting..."
                    );
                    last = Some(observed);
                    last_error = None;
                }
                Err(e) if e.is_cancellation() => return Err(PollError::Cancelled),
                Err(e) => {
                    warn!(
                        what = %self.description,
                        attempt = attempts,
                        error = %e,
                        "Poll check failed, will retry"
                    );
                    last_error = Some(e.to_string());
                }
            }

            if self.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(PollError::Timeout {
                    last,
                    last_error,
                    attempts,
                    waited: start.elapsed(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn poller(max_wait: Duration) -> Poller {
        Poller::new(
            "test condition",
            Duration::from_secs(10),
            max_wait,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_times_out_without_checking() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), PollError<String>> = poller(Duration::ZERO)
            .run(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(Tick::Ready(())) }
            })
            .await;

        assert!(matches!(
            result,
            Err(PollError::Timeout {
                last: None,
                attempts: 0,
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_pending_ticks() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poller(Duration::from_secs(600))
            .run(|| {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Ok(Tick::Pending(format!("tick {n}")))
                    } else {
                        Ok(Tick::Ready(n))
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), PollError<String>> = poller(Duration::from_secs(600))
            .run(|| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(Tick::Failed("file 1 failed".to_string())) }
            })
            .await;

        assert_eq!(result, Err(PollError::Failed("file 1 failed".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_last_observation() {
        let started = Instant::now();
        let result: Result<(), PollError<String>> = poller(Duration::from_secs(35))
            .run(|| async { Ok(Tick::Pending("2/4 files pending".to_string())) })
            .await;

        match result {
            Err(PollError::Timeout {
                last, attempts, ..
            }) => {
                assert_eq!(last.as_deref(), Some("2/4 files pending"));
                // t=0, 10, 20, 30, 35
                assert_eq!(attempts, 5);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_are_tolerated_and_reported() {
        let result: Result<(), PollError<String>> = poller(Duration::from_secs(15))
            .run(|| async { Err(Error::store("cost", "pod not ready")) })
            .await;

        match result {
            Err(PollError::Timeout {
                last, last_error, ..
            }) => {
                assert!(last.is_none());
                assert!(last_error.unwrap().contains("pod not ready"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_unblocks_the_loop() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let p = Poller::new(
            "summary",
            Duration::from_secs(10),
            Duration::from_secs(900),
            cancel,
        );
        let result: Result<(), PollError<String>> = p
            .run(|| {
                if c.fetch_add(1, Ordering::SeqCst) == 1 {
                    trigger.cancel();
                }
                async { Ok(Tick::Pending("empty".to_string())) }
            })
            .await;

        assert_eq!(result, Err(PollError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_bound_with_leading_delay() {
        let started = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), PollError<u64>> = Poller::new(
            "experiments",
            Duration::from_secs(60),
            Duration::from_secs(3600),
            CancellationToken::new(),
        )
        .with_max_attempts(3)
        .delay_first()
        .run(|| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(Tick::Pending(0)) }
        })
        .await;

        assert!(matches!(result, Err(PollError::Timeout { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(180));
    }
}
