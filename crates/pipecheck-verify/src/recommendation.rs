//! Optimization engine check: experiments, then recommendations.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use pipecheck_common::{AbsenceReason, Error, PollError, Poller, Result, Tick};

use crate::context::ScenarioContext;
use crate::store::OptimizationStore;

/// Counts observed in the optimization engine store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecommendationState {
    /// Experiments matching the correlation key
    pub experiments: u64,
    /// Recommendations matching the correlation key
    pub recommendations: u64,
}

impl fmt::Display for RecommendationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} experiments, {} recommendations",
            self.experiments, self.recommendations
        )
    }
}

/// Waits for the optimization engine to act on the uploaded data
///
/// Unlike the fixed-interval store polls this is attempt-bounded: every
/// attempt sleeps the backoff first, then checks.
#[derive(Clone)]
pub struct RecommendationChecker {
    store: Arc<dyn OptimizationStore>,
    backoff: Duration,
}

impl fmt::Debug for RecommendationChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecommendationChecker")
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RecommendationChecker {
    /// Create a checker sleeping `backoff` before each attempt
    pub fn new(store: Arc<dyn OptimizationStore>, backoff: Duration) -> Self {
        Self { store, backoff }
    }

    /// One observation; recommendations are only counted once an experiment
    /// exists
    pub async fn observe(&self, correlation_key: &str) -> Result<RecommendationState> {
        let experiments = self.store.experiment_count(correlation_key).await?;
        if experiments == 0 {
            return Ok(RecommendationState::default());
        }
        let recommendations = self.store.recommendation_count(correlation_key).await?;
        Ok(RecommendationState {
            experiments,
            recommendations,
        })
    }

    /// Wait for at least one recommendation
    ///
    /// Running out of budget without any experiment is reported as
    /// `no-experiment`; with experiments but no recommendation as
    /// `no-recommendation`.
    #[instrument(skip(self, ctx))]
    pub async fn wait_for_recommendation(
        &self,
        ctx: &ScenarioContext,
        correlation_key: &str,
        max_wait: Duration,
        max_attempts: u32,
    ) -> Result<RecommendationState> {
        let poller = Poller::new(
            "optimization recommendations",
            self.backoff,
            ctx.budget(max_wait),
            ctx.cancel_token().clone(),
        )
        .with_max_attempts(max_attempts)
        .delay_first();

        let most_experiments = &AtomicU64::new(0);
        let attempts = &AtomicU32::new(0);
        let result = poller
            .run(|| async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                let state = self.observe(correlation_key).await?;
                most_experiments.fetch_max(state.experiments, Ordering::Relaxed);
                Ok(if state.recommendations > 0 {
                    Tick::Ready(state)
                } else {
                    Tick::Pending(state)
                })
            })
            .await;

        match result {
            Ok(state) => {
                info!(%state, "Recommendations available");
                Ok(state)
            }
            Err(PollError::Cancelled) => Err(Error::cancelled("recommendation check")),
            Err(PollError::Timeout { .. }) | Err(PollError::Failed(_)) => {
                let reason = if most_experiments.load(Ordering::Relaxed) == 0 {
                    AbsenceReason::NoExperiment
                } else {
                    AbsenceReason::NoRecommendation
                };
                Err(Error::RecommendationAbsent {
                    reason,
                    correlation_key: correlation_key.to_string(),
                    attempts: attempts.load(Ordering::Relaxed),
                })
            }
        }
    }
}
