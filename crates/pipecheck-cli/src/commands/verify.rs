//! Verify command - run the full pipeline scenario
//!
//! Authenticates, registers a test resource, uploads a report payload and
//! follows it through manifest processing, summary aggregation and the
//! optimization engine. The exit code reflects the verdict: 0 passed,
//! 1 failed, 130 interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pipecheck_verify::{
    generate_correlation_key, CleanupPolicy, CostStore, OptimizationEngineStore, PayloadUploader,
    PsqlPod, ReportFile, ReportKind, ResourceRegistrar, ScenarioContext, ScenarioRunner,
    TokenProvider,
};

use crate::config::Overrides;
use crate::{Error, GlobalArgs, Result};

/// Verify command arguments
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Correlation key tying the upload to downstream records (default: test-cluster-<unix time>)
    #[arg(long, env = "PIPECHECK_CORRELATION_KEY")]
    pub correlation_key: Option<String>,

    /// Cost usage report to upload instead of a generated sample (repeatable)
    #[arg(long = "file", value_name = "PATH")]
    pub files: Vec<PathBuf>,

    /// Resource optimization report to upload (repeatable)
    #[arg(long = "ros-file", value_name = "PATH")]
    pub ros_files: Vec<PathBuf>,

    /// Keep the test resource on every failure
    #[arg(long, conflicts_with = "always_cleanup")]
    pub keep_resources: bool,

    /// Delete the test resource whatever the outcome
    #[arg(long)]
    pub always_cleanup: bool,

    /// Print the effective configuration (secrets redacted) and exit
    #[arg(long)]
    pub print_config: bool,

    #[command(flatten)]
    pub overrides: Overrides,
}

impl VerifyArgs {
    fn cleanup_policy(&self) -> CleanupPolicy {
        if self.keep_resources {
            CleanupPolicy::KeepOnFailure
        } else if self.always_cleanup {
            CleanupPolicy::Always
        } else {
            CleanupPolicy::Auto
        }
    }

    fn report_files(&self) -> Result<Vec<ReportFile>> {
        let cost = self
            .files
            .iter()
            .map(|p| ReportFile::from_path(p, ReportKind::Cost));
        let ros = self
            .ros_files
            .iter()
            .map(|p| ReportFile::from_path(p, ReportKind::ResourceOptimization));
        Ok(cost.chain(ros).collect::<pipecheck_common::Result<Vec<_>>>()?)
    }
}

/// Run the verify command, returning the verdict's exit code
pub async fn run(global: &GlobalArgs, args: VerifyArgs) -> Result<i32> {
    let client = super::kube_client(global).await?;
    let config = super::resolve_config(global, &args.overrides, Some(&client)).await?;

    if args.print_config {
        // client_secret is never serialized
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(0);
    }
    config.validate()?;

    let files = args.report_files()?;
    let correlation_key = args
        .correlation_key
        .clone()
        .unwrap_or_else(generate_correlation_key);

    let timing = &config.timing;
    let tokens = TokenProvider::from_config(&config.identity, timing.http_timeout())?;
    let registrar = ResourceRegistrar::from_config(&config.registry, timing.http_timeout())?;
    let uploader = PayloadUploader::from_config(&config.gateway, timing.http_timeout())?;

    let schema = config
        .relational_store
        .schema
        .clone()
        .ok_or_else(|| Error::validation("relational_store.schema is required"))?;
    let relational = CostStore::new(
        PsqlPod::new(
            client.clone(),
            config.relational_store.clone(),
            "cost",
            timing.query_timeout(),
        ),
        schema,
    )?;
    let optimization = OptimizationEngineStore::new(PsqlPod::new(
        client,
        config.optimization_store.clone(),
        "optimization",
        timing.query_timeout(),
    ));

    let runner = ScenarioRunner::new(
        tokens,
        registrar,
        uploader,
        Arc::new(relational),
        Arc::new(optimization),
        timing.clone(),
    )
    .with_cleanup(args.cleanup_policy())
    .with_files(files);

    let cancel = CancellationToken::new();
    super::cancel_on_interrupt(cancel.clone());

    let ctx = ScenarioContext::new(
        correlation_key,
        timing.overall_deadline(),
        cancel,
        super::diagnostics(&config),
    )?;
    info!(
        correlation_key = %ctx.correlation_key(),
        run_id = %ctx.run_id(),
        diagnostics = %ctx.diagnostics().dir().display(),
        "Verifying pipeline"
    );

    let verdict = runner.run(&ctx).await;
    verdict.log_summary();
    Ok(verdict.exit_code())
}
