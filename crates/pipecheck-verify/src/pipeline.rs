//! Manifest and summary verification against the relational store.
//!
//! Manifest state per correlation key moves
//! `NotFound -> Pending -> Complete | Failed`. The summary wait re-derives the
//! manifest state on every tick and only consults the summary table once the
//! manifest is complete, so it cannot succeed ahead of manifest processing
//! even when called out of order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};

use pipecheck_common::{Error, PipelineStage, PollError, Poller, Progress, Result, Tick};

use crate::context::ScenarioContext;
use crate::store::{FileState, RelationalStore};

/// Observed state of the manifest for a correlation key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestState {
    /// No manifest recorded yet
    NotFound,
    /// Manifest recorded, files still processing
    Pending {
        /// Manifest row id
        manifest_id: i64,
        /// Files the manifest declared
        total: u32,
        /// Files not yet processed
        pending: u32,
    },
    /// Every file processed successfully
    Complete {
        /// Manifest row id
        manifest_id: i64,
        /// Files processed
        total: u32,
    },
    /// At least one file failed
    Failed {
        /// Manifest row id
        manifest_id: i64,
        /// Names of the failed files
        failed_files: Vec<String>,
    },
    /// The manifest belongs to another correlation key
    Mismatch {
        /// Key the manifest carried
        found: String,
    },
}

impl ManifestState {
    /// Whether a manifest row has been seen
    pub fn is_found(&self) -> bool {
        !matches!(self, ManifestState::NotFound)
    }
}

impl fmt::Display for ManifestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestState::NotFound => write!(f, "manifest not found"),
            ManifestState::Pending { total, pending, .. } => {
                write!(f, "manifest found, {}/{} files pending", pending, total)
            }
            ManifestState::Complete { total, .. } => {
                write!(f, "manifest complete, {}/{} files processed", total, total)
            }
            ManifestState::Failed { failed_files, .. } => {
                write!(f, "manifest failed: {} failed", failed_files.join(", "))
            }
            ManifestState::Mismatch { found } => {
                write!(f, "manifest belongs to {}", found)
            }
        }
    }
}

/// Observed state of the aggregated summary for a correlation key
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryState {
    /// Manifest processing has not completed
    AwaitingManifest(ManifestState),
    /// No summary rows yet
    Empty,
    /// Rows exist but their aggregated values are still zero
    Unpopulated {
        /// Rows present
        row_count: u64,
    },
    /// Rows exist with non-zero usage
    Populated {
        /// Rows present
        row_count: u64,
        /// Summed CPU usage
        cpu_core_hours: f64,
        /// Summed memory usage
        memory_gigabyte_hours: f64,
    },
    /// Summary rows belong to another correlation key
    Mismatch {
        /// Key the rows carried
        found: String,
    },
}

impl fmt::Display for SummaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryState::AwaitingManifest(m) => write!(f, "awaiting manifest ({})", m),
            SummaryState::Empty => write!(f, "no summary rows"),
            SummaryState::Unpopulated { row_count } => {
                write!(f, "{} summary rows with no usage yet", row_count)
            }
            SummaryState::Populated {
                row_count,
                cpu_core_hours,
                memory_gigabyte_hours,
            } => write!(
                f,
                "{} summary rows, {:.3} cpu core-hours, {:.3} memory GB-hours",
                row_count, cpu_core_hours, memory_gigabyte_hours
            ),
            SummaryState::Mismatch { found } => write!(f, "summary rows belong to {}", found),
        }
    }
}

/// Polls the relational store for manifest and summary progress
#[derive(Clone)]
pub struct PipelineVerifier {
    store: Arc<dyn RelationalStore>,
    interval: Duration,
}

impl fmt::Debug for PipelineVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineVerifier")
            .field("interval", &self.interval)
            .finish()
    }
}

impl PipelineVerifier {
    /// Create a verifier polling `store` every `interval`
    pub fn new(store: Arc<dyn RelationalStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// One observation of the manifest for `correlation_key`
    pub async fn observe_manifest(&self, correlation_key: &str) -> Result<ManifestState> {
        let Some(manifest) = self.store.manifest(correlation_key).await? else {
            return Ok(ManifestState::NotFound);
        };
        if manifest.cluster_id != correlation_key {
            return Ok(ManifestState::Mismatch {
                found: manifest.cluster_id,
            });
        }

        let statuses = self.store.file_statuses(manifest.id).await?;
        let failed_files: Vec<String> = statuses
            .iter()
            .filter(|s| s.state == FileState::Failed)
            .map(|s| s.name.clone())
            .collect();
        if !failed_files.is_empty() {
            return Ok(ManifestState::Failed {
                manifest_id: manifest.id,
                failed_files,
            });
        }

        // files without a status row yet count as pending
        let total = manifest.file_count.max(statuses.len() as u32);
        let succeeded = statuses
            .iter()
            .filter(|s| s.state == FileState::Success)
            .count() as u32;

        let complete = if total == 0 {
            manifest.completed_at.is_some()
        } else {
            succeeded >= total
        };

        if complete {
            Ok(ManifestState::Complete {
                manifest_id: manifest.id,
                total,
            })
        } else {
            Ok(ManifestState::Pending {
                manifest_id: manifest.id,
                total,
                pending: total - succeeded,
            })
        }
    }

    /// One observation of the summary, gated on manifest completion
    pub async fn observe_summary(&self, correlation_key: &str) -> Result<SummaryState> {
        let manifest = self.observe_manifest(correlation_key).await?;
        if !matches!(manifest, ManifestState::Complete { .. }) {
            return Ok(SummaryState::AwaitingManifest(manifest));
        }

        Ok(match self.store.summary(correlation_key).await? {
            None => SummaryState::Empty,
            Some(s) if s.cluster_id != correlation_key => SummaryState::Mismatch {
                found: s.cluster_id,
            },
            Some(s) if s.row_count == 0 => SummaryState::Empty,
            Some(s) if s.cpu_core_hours <= 0.0 && s.memory_gigabyte_hours <= 0.0 => {
                SummaryState::Unpopulated {
                    row_count: s.row_count,
                }
            }
            Some(s) => SummaryState::Populated {
                row_count: s.row_count,
                cpu_core_hours: s.cpu_core_hours,
                memory_gigabyte_hours: s.memory_gigabyte_hours,
            },
        })
    }

    /// Wait until every file of the manifest is processed
    ///
    /// A failed file ends the wait at once. `max_wait` is clamped to the
    /// scenario deadline; a zero budget times out without querying.
    #[instrument(skip(self, ctx))]
    pub async fn wait_for_manifest_processing(
        &self,
        ctx: &ScenarioContext,
        correlation_key: &str,
        max_wait: Duration,
    ) -> Result<ManifestState> {
        let poller = Poller::new(
            "manifest processing",
            self.interval,
            ctx.budget(max_wait),
            ctx.cancel_token().clone(),
        );

        let result = poller
            .run(|| async move {
                let state = self.observe_manifest(correlation_key).await?;
                Ok(match state {
                    ManifestState::Complete { .. } => Tick::Ready(state),
                    ManifestState::Failed { .. } | ManifestState::Mismatch { .. } => {
                        Tick::Failed(state)
                    }
                    _ => Tick::Pending(state),
                })
            })
            .await;

        match result {
            Ok(state) => {
                info!(%state, "Manifest processed");
                Ok(state)
            }
            Err(PollError::Failed(ManifestState::Mismatch { found })) => {
                Err(mismatch("manifest lookup", correlation_key, found))
            }
            Err(PollError::Failed(state)) => Err(Error::ProcessingFailed {
                stage: PipelineStage::Manifest,
                correlation_key: correlation_key.to_string(),
                detail: state.to_string(),
            }),
            Err(PollError::Cancelled) => Err(Error::cancelled("manifest processing")),
            Err(PollError::Timeout {
                last,
                last_error,
                waited,
                ..
            }) => {
                let progress = if last.as_ref().is_some_and(ManifestState::is_found) {
                    Progress::Incomplete
                } else {
                    Progress::NeverStarted
                };
                Err(Error::PipelineTimeout {
                    stage: PipelineStage::Manifest,
                    progress,
                    last_observed: describe(last.as_ref(), last_error),
                    waited,
                })
            }
        }
    }

    /// Wait until summary rows with non-zero usage exist
    ///
    /// Never reports success before the manifest is complete.
    #[instrument(skip(self, ctx))]
    pub async fn wait_for_summary(
        &self,
        ctx: &ScenarioContext,
        correlation_key: &str,
        max_wait: Duration,
    ) -> Result<SummaryState> {
        let poller = Poller::new(
            "summary population",
            self.interval,
            ctx.budget(max_wait),
            ctx.cancel_token().clone(),
        );

        let result = poller
            .run(|| async move {
                let state = self.observe_summary(correlation_key).await?;
                Ok(match state {
                    SummaryState::Populated { .. } => Tick::Ready(state),
                    SummaryState::Mismatch { .. }
                    | SummaryState::AwaitingManifest(ManifestState::Failed { .. })
                    | SummaryState::AwaitingManifest(ManifestState::Mismatch { .. }) => {
                        Tick::Failed(state)
                    }
                    _ => Tick::Pending(state),
                })
            })
            .await;

        match result {
            Ok(state) => {
                info!(%state, "Summary populated");
                Ok(state)
            }
            Err(PollError::Failed(SummaryState::Mismatch { found }))
            | Err(PollError::Failed(SummaryState::AwaitingManifest(ManifestState::Mismatch {
                found,
            }))) => Err(mismatch("summary lookup", correlation_key, found)),
            Err(PollError::Failed(state)) => Err(Error::ProcessingFailed {
                stage: PipelineStage::Summary,
                correlation_key: correlation_key.to_string(),
                detail: state.to_string(),
            }),
            Err(PollError::Cancelled) => Err(Error::cancelled("summary population")),
            Err(PollError::Timeout {
                last,
                last_error,
                waited,
                ..
            }) => {
                let progress = match last {
                    Some(SummaryState::Unpopulated { .. }) => Progress::Incomplete,
                    _ => Progress::NeverStarted,
                };
                Err(Error::PipelineTimeout {
                    stage: PipelineStage::Summary,
                    progress,
                    last_observed: describe(last.as_ref(), last_error),
                    waited,
                })
            }
        }
    }
}

fn mismatch(origin: &str, expected: &str, found: String) -> Error {
    Error::CorrelationMismatch {
        origin: origin.to_string(),
        expected: expected.to_string(),
        found,
    }
}

fn describe<S: fmt::Display>(last: Option<&S>, last_error: Option<String>) -> String {
    match (last, last_error) {
        (_, Some(err)) => format!("last check failed: {}", err),
        (Some(state), None) => state.to_string(),
        (None, None) => "no observation before the budget ran out".to_string(),
    }
}
