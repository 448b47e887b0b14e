//! Scenario sequencing, cleanup policy and the final verdict.
//!
//! Stages run strictly in order and the first failure ends the run:
//! authenticate, register, propagation, upload, manifest, summary,
//! recommendation. Whatever the outcome, the runner decides whether the test
//! resource is deleted and whether the diagnostics directory survives.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use pipecheck_common::{Error, Result};

use crate::auth::TokenProvider;
use crate::config::TimingConfig;
use crate::context::ScenarioContext;
use crate::pipeline::PipelineVerifier;
use crate::recommendation::RecommendationChecker;
use crate::registry::{ResourceHandle, ResourceRegistrar};
use crate::sample::ReportFile;
use crate::store::{OptimizationStore, RelationalStore};
use crate::upload::PayloadUploader;

/// Longest stage detail shown in the summary table
const MAX_DETAIL_LEN: usize = 200;

/// What happens to the test resource when a run does not pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Delete when nothing downstream is worth inspecting, keep otherwise
    #[default]
    Auto,
    /// Keep the resource on every failure
    KeepOnFailure,
    /// Delete the resource regardless of outcome
    Always,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every stage succeeded
    Passed,
    /// A stage failed
    Failed,
    /// The user interrupted the run
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one stage
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Stage name
    pub name: &'static str,
    /// Whether the stage succeeded
    pub passed: bool,
    /// Wall time spent in the stage
    pub duration: Duration,
    /// Observed state on success, error text on failure
    pub detail: String,
}

/// Aggregated result of a scenario run
#[derive(Debug)]
pub struct Verdict {
    /// Correlation key of the run
    pub correlation_key: String,
    /// Run identifier
    pub run_id: String,
    /// How the run ended
    pub outcome: Outcome,
    /// Stages in execution order; stages never reached are absent
    pub stages: Vec<StageReport>,
    /// The error that ended the run
    pub error: Option<Error>,
    /// Registry ids of the test resource
    pub resource: ResourceHandle,
    /// Whether the test resource still exists in the registry
    pub resource_retained: bool,
    /// Diagnostic logs kept for post-mortem inspection
    pub diagnostics: Vec<PathBuf>,
    /// Why cleanup could not delete the resource, if it tried and failed
    pub cleanup_error: Option<String>,
}

impl Verdict {
    /// Whether every stage passed
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }

    /// Process exit code: 0 passed, 1 failed, 130 interrupted
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Passed => 0,
            Outcome::Failed => 1,
            Outcome::Cancelled => 130,
        }
    }

    /// Name of the stage that ended the run
    pub fn failed_stage(&self) -> Option<&'static str> {
        self.stages.iter().find(|s| !s.passed).map(|s| s.name)
    }

    /// Operator guidance for the failure, if any
    pub fn remediation(&self) -> Option<String> {
        self.error
            .as_ref()
            .filter(|e| !e.is_cancellation())
            .map(Error::remediation)
    }

    /// Log the stage table and what was left behind
    pub fn log_summary(&self) {
        let total: Duration = self.stages.iter().map(|s| s.duration).sum();
        let passed = self.stages.iter().filter(|s| s.passed).count();
        let failed = self.stages.len() - passed;

        info!("========================================");
        info!("  PIPELINE VERIFICATION {}", self.correlation_key.to_uppercase());
        info!("========================================");
        for s in &self.stages {
            let tag = if s.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", s.name, s.duration.as_secs_f64());
            if !s.detail.is_empty() {
                info!("        -> {}", truncate(&s.detail, MAX_DETAIL_LEN));
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total) - {}",
            passed,
            failed,
            total.as_secs_f64(),
            self.outcome
        );
        info!("========================================");

        if let Some(e) = &self.error {
            if !e.is_cancellation() {
                error!(category = e.category(), "{}", e);
                info!("Remediation: {}", e.remediation());
            }
        }
        if self.resource_retained {
            if let Some(id) = &self.resource.source_id {
                info!(
                    source_id = %id,
                    "Test resource retained; remove with `pipecheck cleanup --source-id {}`",
                    id
                );
            }
        }
        if let Some(reason) = &self.cleanup_error {
            warn!(%reason, "Cleanup did not complete");
        }
        for path in &self.diagnostics {
            info!(path = %path.display(), "Retained diagnostic log");
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Whether the resource is deleted for this outcome
///
/// `accepted` is set once the gateway has taken the payload; from then on
/// the pipeline holds state tied to the resource that a failed run wants
/// preserved.
pub fn should_unregister(policy: CleanupPolicy, outcome: Outcome, accepted: bool) -> bool {
    match (policy, outcome) {
        (CleanupPolicy::Always, _) => true,
        (_, Outcome::Passed | Outcome::Cancelled) => true,
        (CleanupPolicy::KeepOnFailure, Outcome::Failed) => false,
        (CleanupPolicy::Auto, Outcome::Failed) => !accepted,
    }
}

/// Runs every stage against the pipeline under test
pub struct ScenarioRunner {
    tokens: TokenProvider,
    registrar: ResourceRegistrar,
    uploader: PayloadUploader,
    relational: Arc<dyn RelationalStore>,
    pipeline: PipelineVerifier,
    recommendations: RecommendationChecker,
    timing: TimingConfig,
    cleanup: CleanupPolicy,
    files: Vec<ReportFile>,
}

impl fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("tokens", &self.tokens)
            .field("registrar", &self.registrar)
            .field("uploader", &self.uploader)
            .field("cleanup", &self.cleanup)
            .field("files", &self.files.len())
            .finish()
    }
}

impl ScenarioRunner {
    /// Wire a runner from its collaborators
    pub fn new(
        tokens: TokenProvider,
        registrar: ResourceRegistrar,
        uploader: PayloadUploader,
        relational: Arc<dyn RelationalStore>,
        optimization: Arc<dyn OptimizationStore>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            pipeline: PipelineVerifier::new(relational.clone(), timing.poll_interval()),
            recommendations: RecommendationChecker::new(
                optimization,
                timing.recommendation_backoff(),
            ),
            tokens,
            registrar,
            uploader,
            relational,
            timing,
            cleanup: CleanupPolicy::default(),
            files: Vec::new(),
        }
    }

    /// Override the cleanup policy
    pub fn with_cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }

    /// Upload these files instead of generated samples
    pub fn with_files(mut self, files: Vec<ReportFile>) -> Self {
        self.files = files;
        self
    }

    /// Run the scenario to a verdict
    ///
    /// Never returns early without cleanup: the resource handle is resolved
    /// according to the policy on every path, including interrupts.
    #[instrument(
        skip(self, ctx),
        fields(correlation_key = %ctx.correlation_key(), run_id = %ctx.run_id())
    )]
    pub async fn run(&self, ctx: &ScenarioContext) -> Verdict {
        let key = ctx.correlation_key();
        let mut handle = ResourceHandle::new(key, self.registrar.source_name(key));
        let mut stages = Vec::new();
        let mut accepted = false;

        info!("Starting pipeline verification");
        let result = self
            .run_stages(ctx, &mut handle, &mut stages, &mut accepted)
            .await;

        let outcome = match &result {
            Ok(()) => Outcome::Passed,
            Err(e) if e.is_cancellation() || ctx.is_cancelled() => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        };

        let mut cleanup_error = None;
        if should_unregister(self.cleanup, outcome, accepted) {
            if let Err(e) = self.registrar.unregister(&mut handle).await {
                warn!(error = %e, "Failed to delete test resource");
                cleanup_error = Some(e.to_string());
            }
        } else if handle.source_id.is_some() {
            info!(source_id = ?handle.source_id, "Keeping test resource for inspection");
        }

        let diagnostics = match outcome {
            Outcome::Passed | Outcome::Cancelled => {
                ctx.diagnostics().purge();
                Vec::new()
            }
            Outcome::Failed => ctx.diagnostics().retained(),
        };

        Verdict {
            correlation_key: key.to_string(),
            run_id: ctx.run_id().to_string(),
            outcome,
            stages,
            error: result.err(),
            resource_retained: handle.source_id.is_some(),
            resource: handle,
            diagnostics,
            cleanup_error,
        }
    }

    async fn run_stages(
        &self,
        ctx: &ScenarioContext,
        handle: &mut ResourceHandle,
        stages: &mut Vec<StageReport>,
        accepted: &mut bool,
    ) -> Result<()> {
        let key = ctx.correlation_key();
        let timing = &self.timing;

        let token = timed(stages, "authenticate", self.tokens.get_token(ctx), |t| {
            format!("token from {} valid until {}", t.issuer(), t.expires_at())
        })
        .await?;

        let start = Instant::now();
        let registered = self.registrar.register(ctx, handle).await;
        let source_id = handle.source_id.clone().unwrap_or_default();
        record(stages, "register", start, registered, |_| {
            format!("source {}", source_id)
        })?;

        timed(
            stages,
            "propagation",
            self.registrar.wait_for_propagation(
                ctx,
                self.relational.as_ref(),
                timing.poll_interval(),
                timing.registration_wait(),
            ),
            |p| format!("provider {}", p.uuid),
        )
        .await?;

        let start = Instant::now();
        let upload = self.uploader.upload(ctx, &token, &self.files).await;
        if let Err(Error::Upload { status: 401, .. }) = &upload {
            self.tokens.invalidate();
        }
        let receipt = record(stages, "upload", start, upload, |r| {
            format!("HTTP {} request {}", r.status, r.request_id)
        })?;
        *accepted = true;
        info!(request_id = %receipt.request_id, "Gateway accepted payload");

        timed(
            stages,
            "manifest",
            self.pipeline
                .wait_for_manifest_processing(ctx, key, timing.manifest_wait()),
            ToString::to_string,
        )
        .await?;

        timed(
            stages,
            "summary",
            self.pipeline.wait_for_summary(ctx, key, timing.summary_wait()),
            ToString::to_string,
        )
        .await?;

        timed(
            stages,
            "recommendation",
            self.recommendations.wait_for_recommendation(
                ctx,
                key,
                timing.recommendation_wait(),
                timing.recommendation_attempts,
            ),
            ToString::to_string,
        )
        .await?;

        info!("Pipeline verified end to end");
        Ok(())
    }
}

async fn timed<T, F, D>(
    stages: &mut Vec<StageReport>,
    name: &'static str,
    fut: F,
    describe: D,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
    D: FnOnce(&T) -> String,
{
    let start = Instant::now();
    let result = fut.await;
    record(stages, name, start, result, describe)
}

fn record<T, D>(
    stages: &mut Vec<StageReport>,
    name: &'static str,
    start: Instant,
    result: Result<T>,
    describe: D,
) -> Result<T>
where
    D: FnOnce(&T) -> String,
{
    let duration = start.elapsed();
    let (passed, detail) = match &result {
        Ok(value) => {
            info!(stage = name, elapsed_ms = duration.as_millis() as u64, "Stage passed");
            (true, describe(value))
        }
        Err(e) => {
            warn!(
                stage = name,
                elapsed_ms = duration.as_millis() as u64,
                error = %e,
                "Stage failed"
            );
            (false, e.to_string())
        }
    };
    stages.push(StageReport {
        name,
        passed,
        duration,
        detail,
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecheck_common::AbsenceReason;

    fn verdict(outcome: Outcome, error: Option<Error>) -> Verdict {
        Verdict {
            correlation_key: "test-cluster-1".to_string(),
            run_id: "run".to_string(),
            outcome,
            stages: vec![
                StageReport {
                    name: "authenticate",
                    passed: true,
                    duration: Duration::from_millis(20),
                    detail: String::new(),
                },
                StageReport {
                    name: "upload",
                    passed: outcome == Outcome::Passed,
                    duration: Duration::from_millis(50),
                    detail: "x".repeat(500),
                },
            ],
            error,
            resource: ResourceHandle::existing("10"),
            resource_retained: true,
            diagnostics: Vec::new(),
            cleanup_error: None,
        }
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(verdict(Outcome::Passed, None).exit_code(), 0);
        assert_eq!(
            verdict(Outcome::Failed, Some(Error::upload(401, "no"))).exit_code(),
            1
        );
        assert_eq!(
            verdict(Outcome::Cancelled, Some(Error::cancelled("summary"))).exit_code(),
            130
        );
    }

    #[test]
    fn failed_stage_and_remediation() {
        let v = verdict(Outcome::Failed, Some(Error::upload(401, "expired")));
        assert_eq!(v.failed_stage(), Some("upload"));
        assert!(v.remediation().unwrap().contains("bearer token"));
        v.log_summary();

        let cancelled = verdict(Outcome::Cancelled, Some(Error::cancelled("summary")));
        assert!(cancelled.remediation().is_none());
    }

    #[test]
    fn soft_failure_guidance_differs_from_hard() {
        let soft = Error::RecommendationAbsent {
            reason: AbsenceReason::NoRecommendation,
            correlation_key: "k".to_string(),
            attempts: 30,
        };
        let hard = Error::RecommendationAbsent {
            reason: AbsenceReason::NoExperiment,
            correlation_key: "k".to_string(),
            attempts: 30,
        };
        assert_ne!(
            verdict(Outcome::Failed, Some(soft)).remediation(),
            verdict(Outcome::Failed, Some(hard)).remediation()
        );
    }

    /// Story: the resource survives only failures after the gateway took
    /// the payload
    #[test]
    fn story_cleanup_policy_by_outcome() {
        use CleanupPolicy::*;
        use Outcome::*;

        assert!(should_unregister(Auto, Passed, true));
        assert!(should_unregister(Auto, Cancelled, true));
        assert!(should_unregister(Auto, Failed, false));
        assert!(!should_unregister(Auto, Failed, true));

        assert!(!should_unregister(KeepOnFailure, Failed, false));
        assert!(should_unregister(KeepOnFailure, Cancelled, true));

        assert!(should_unregister(Always, Failed, true));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        assert_eq!(truncate("ééé", 3), "é");
    }

    #[tokio::test]
    async fn record_keeps_error_text() {
        let mut stages = Vec::new();
        let result: Result<()> = record(
            &mut stages,
            "register",
            Instant::now(),
            Err(Error::config("boom")),
            |_| String::new(),
        );
        assert!(result.is_err());
        assert!(!stages[0].passed);
        assert!(stages[0].detail.contains("boom"));
    }
}
