//! Per-run state threaded explicitly through every stage.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use pipecheck_common::{Error, Result};

use crate::diagnostics::Diagnostics;

/// Longest correlation key accepted; keys end up in SQL and source names
const MAX_CORRELATION_KEY_LEN: usize = 128;

/// Everything a stage needs to know about the run it belongs to
///
/// There is no ambient state: the token, the resource handle and every
/// artifact are passed along with this context rather than stored globally.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    run_id: String,
    correlation_key: String,
    cancel: CancellationToken,
    deadline: Instant,
    diagnostics: Diagnostics,
}

impl ScenarioContext {
    /// Create a context for one run
    ///
    /// Fails if the correlation key contains characters outside
    /// `[A-Za-z0-9._-]`.
    pub fn new(
        correlation_key: impl Into<String>,
        overall_deadline: Duration,
        cancel: CancellationToken,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let correlation_key = correlation_key.into();
        validate_correlation_key(&correlation_key)?;

        Ok(Self {
            run_id: diagnostics.run_id().to_string(),
            correlation_key,
            cancel,
            deadline: Instant::now() + overall_deadline,
            diagnostics,
        })
    }

    /// Run identifier used for diagnostics and source names
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Key tying the upload to every downstream record
    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    /// Token fired on user interrupt
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the run has been interrupted
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the overall deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// A stage budget clamped to the overall deadline
    pub fn budget(&self, stage_max: Duration) -> Duration {
        stage_max.min(self.remaining())
    }

    /// Diagnostic log owner for this run
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Await `fut` unless the run is interrupted first
    ///
    /// Used around single network calls so an interrupt does not wait for
    /// a per-call timeout to elapse.
    pub async fn guard<T, F>(&self, stage: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled(stage)),
            result = fut => result,
        }
    }
}

/// Generate a correlation key of the form `test-cluster-<unix seconds>`
pub fn generate_correlation_key() -> String {
    format!("test-cluster-{}", chrono::Utc::now().timestamp())
}

/// Accept only keys safe to embed in names, paths and SQL literals
pub fn validate_correlation_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_CORRELATION_KEY_LEN {
        return Err(Error::config(format!(
            "correlation key must be 1..={} characters",
            MAX_CORRELATION_KEY_LEN
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::config(format!(
            "correlation key '{}' may only contain [A-Za-z0-9._-]",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(deadline: Duration) -> ScenarioContext {
        let dir = tempfile::tempdir().unwrap();
        ScenarioContext::new(
            "test-cluster-1700000000",
            deadline,
            CancellationToken::new(),
            Diagnostics::new(dir.path(), "run1"),
        )
        .unwrap()
    }

    #[test]
    fn generated_keys_are_valid() {
        let key = generate_correlation_key();
        assert!(key.starts_with("test-cluster-"));
        assert!(validate_correlation_key(&key).is_ok());
    }

    #[test]
    fn unsafe_keys_are_rejected() {
        assert!(validate_correlation_key("").is_err());
        assert!(validate_correlation_key("a'b").is_err());
        assert!(validate_correlation_key("a%b").is_err());
        assert!(validate_correlation_key(&"x".repeat(129)).is_err());
        assert!(validate_correlation_key("cluster_1.prod-2").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn budgets_are_clamped_to_deadline() {
        let ctx = context(Duration::from_secs(100));
        assert_eq!(ctx.budget(Duration::from_secs(600)), Duration::from_secs(100));
        assert_eq!(ctx.budget(Duration::from_secs(30)), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(150)).await;
        assert_eq!(ctx.budget(Duration::from_secs(30)), Duration::ZERO);
    }

    #[tokio::test]
    async fn guard_returns_cancelled_on_interrupt() {
        let ctx = context(Duration::from_secs(60));
        ctx.cancel_token().cancel();

        let result: Result<()> = ctx
            .guard("upload", async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
    }
}
