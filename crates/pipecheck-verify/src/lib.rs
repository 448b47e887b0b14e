//! End-to-end verification of the cost ingestion pipeline
//!
//! A run authenticates, registers a test resource, uploads a report payload
//! and then follows it through manifest processing, summary aggregation and
//! the optimization engine, ending in a [`Verdict`].

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod http;
pub mod pipeline;
pub mod recommendation;
pub mod registry;
pub mod sample;
pub mod scenario;
pub mod store;
pub mod upload;

pub use auth::{Token, TokenProvider};
pub use config::ScenarioConfig;
pub use context::{generate_correlation_key, validate_correlation_key, ScenarioContext};
pub use diagnostics::{AttemptLog, Diagnostics};
pub use pipeline::{ManifestState, PipelineVerifier, SummaryState};
pub use recommendation::{RecommendationChecker, RecommendationState};
pub use registry::{ResourceHandle, ResourceRegistrar};
pub use sample::{ReportFile, ReportKind, ReportWindow};
pub use scenario::{CleanupPolicy, Outcome, ScenarioRunner, StageReport, Verdict};
pub use store::{
    CostStore, OptimizationEngineStore, OptimizationStore, PsqlPod, RelationalStore, SqlRunner,
};
pub use upload::{PayloadUploader, ReportManifest, UploadArtifact, UploadReceipt};
