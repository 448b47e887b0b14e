//! Full scenario runs against in-process fakes of every external service.
//!
//! The identity provider, registry and gateway are axum servers on
//! `127.0.0.1:0`. The stores are an in-memory pipeline that only knows about
//! manifests the fake gateway actually received, so the correlation key seen
//! downstream is the one that travelled inside the uploaded archive.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Multipart, Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use pipecheck_common::{AbsenceReason, Error, RegistrationStage, Result};
use pipecheck_verify::config::{RegistryConfig, TimingConfig};
use pipecheck_verify::store::{FileState, FileStatus, ManifestRecord, ProviderRecord, SummaryRecord};
use pipecheck_verify::upload::MANIFEST_NAME;
use pipecheck_verify::{
    Diagnostics, OptimizationStore, Outcome, PayloadUploader, RelationalStore, ReportManifest,
    ResourceHandle, ResourceRegistrar, ScenarioContext, ScenarioRunner, TokenProvider, Verdict,
};

const KEY: &str = "test-cluster-1700000000";

// =============================================================================
// Identity provider
// =============================================================================

async fn token_handler(
    State(hits): State<Arc<AtomicU32>>,
    Form(_form): Form<HashMap<String, String>>,
) -> Json<Value> {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"access_token": format!("tok-{}", n), "expires_in": 300}))
}

async fn start_idp() -> (String, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route("/realms/test/protocol/openid-connect/token", post(token_handler))
        .with_state(hits.clone());
    (serve(app).await + "/realms/test", hits)
}

// =============================================================================
// Resource registry
// =============================================================================

#[derive(Clone, Default)]
struct Registry {
    calls: Arc<Mutex<Vec<String>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    fail_sources: bool,
    fail_authentications: bool,
}

async fn source_types(State(r): State<Registry>) -> Json<Value> {
    r.calls.lock().push("GET source_types".to_string());
    Json(json!({"data": [{"id": "1", "name": "openshift"}]}))
}

async fn application_types(State(r): State<Registry>) -> Json<Value> {
    r.calls.lock().push("GET application_types".to_string());
    Json(json!({"data": [{"id": "2", "name": "/insights/platform/cost-management"}]}))
}

async fn create_source(State(r): State<Registry>) -> (StatusCode, Json<Value>) {
    r.calls.lock().push("POST sources".to_string());
    if r.fail_sources {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"errors": []})));
    }
    (StatusCode::CREATED, Json(json!({"id": "10"})))
}

async fn create_authentication(State(r): State<Registry>) -> (StatusCode, Json<Value>) {
    r.calls.lock().push("POST authentications".to_string());
    if r.fail_authentications {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"errors": []})));
    }
    (StatusCode::CREATED, Json(json!({"id": "20"})))
}

async fn create_application(State(r): State<Registry>) -> (StatusCode, Json<Value>) {
    r.calls.lock().push("POST applications".to_string());
    (StatusCode::CREATED, Json(json!({"id": "30"})))
}

async fn delete_source(State(r): State<Registry>, AxumPath(id): AxumPath<String>) -> StatusCode {
    r.calls.lock().push(format!("DELETE sources/{}", id));
    let mut deleted = r.deleted.lock();
    if deleted.contains(&id) {
        return StatusCode::NOT_FOUND;
    }
    deleted.push(id);
    StatusCode::NO_CONTENT
}

async fn start_registry(registry: Registry) -> String {
    let app = Router::new()
        .route("/api/sources/v3.1/source_types", get(source_types))
        .route("/api/sources/v3.1/application_types", get(application_types))
        .route("/api/sources/v3.1/sources", post(create_source))
        .route("/api/sources/v3.1/sources/{id}", delete(delete_source))
        .route("/api/sources/v3.1/authentications", post(create_authentication))
        .route("/api/sources/v3.1/applications", post(create_application))
        .with_state(registry);
    serve(app).await + "/api/sources/v3.1"
}

// =============================================================================
// Ingestion gateway
// =============================================================================

#[derive(Clone)]
struct Gateway {
    status: StatusCode,
    received: Arc<Mutex<Vec<ReportManifest>>>,
}

fn manifest_of(archive: &[u8]) -> Option<ReportManifest> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.path().ok()?.to_string_lossy() == MANIFEST_NAME {
            let mut json = String::new();
            entry.read_to_string(&mut json).ok()?;
            return serde_json::from_str(&json).ok();
        }
    }
    None
}

async fn upload_handler(
    State(gw): State<Gateway>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> StatusCode {
    assert!(headers.contains_key("authorization"));
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("file") {
            let bytes = field.bytes().await.unwrap();
            if gw.status.is_success() {
                gw.received.lock().push(manifest_of(&bytes).unwrap());
            }
        }
    }
    gw.status
}

async fn start_gateway(status: StatusCode) -> (String, Gateway) {
    let gw = Gateway {
        status,
        received: Arc::default(),
    };
    let app = Router::new()
        .route("/api/ingress/v1/upload", post(upload_handler))
        .with_state(gw.clone());
    (serve(app).await + "/api/ingress/v1/upload", gw)
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

// =============================================================================
// Pipeline stores
// =============================================================================

/// Manifests, summaries and optimization artifacts derived from what the
/// gateway received
struct FakePipeline {
    received: Arc<Mutex<Vec<ReportManifest>>>,
    summary_rows: u64,
    experiments: u64,
    recommendations: u64,
    manifest_queries: AtomicU32,
    /// Interrupts the run the first time the summary is queried
    interrupt_on_summary: Option<CancellationToken>,
}

impl FakePipeline {
    fn new(received: Arc<Mutex<Vec<ReportManifest>>>) -> Self {
        Self {
            received,
            summary_rows: 24,
            experiments: 1,
            recommendations: 3,
            manifest_queries: AtomicU32::new(0),
            interrupt_on_summary: None,
        }
    }

    fn latest(&self) -> Option<ReportManifest> {
        self.received.lock().last().cloned()
    }
}

#[async_trait]
impl RelationalStore for FakePipeline {
    async fn provider_for_cluster(&self, correlation_key: &str) -> Result<Option<ProviderRecord>> {
        Ok(Some(ProviderRecord {
            uuid: "provider-1".to_string(),
            name: format!("pipecheck-{}", correlation_key),
            cluster_id: correlation_key.to_string(),
        }))
    }

    async fn manifest(&self, _correlation_key: &str) -> Result<Option<ManifestRecord>> {
        self.manifest_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.latest().map(|m| ManifestRecord {
            id: 1,
            cluster_id: m.cluster_id,
            file_count: (m.files.len() + m.resource_optimization_files.len()) as u32,
            completed_at: None,
        }))
    }

    async fn file_statuses(&self, _manifest_id: i64) -> Result<Vec<FileStatus>> {
        let Some(m) = self.latest() else {
            return Ok(Vec::new());
        };
        Ok(m.files
            .iter()
            .chain(&m.resource_optimization_files)
            .map(|name| FileStatus {
                name: name.clone(),
                state: FileState::Success,
            })
            .collect())
    }

    async fn summary(&self, _correlation_key: &str) -> Result<Option<SummaryRecord>> {
        if let Some(cancel) = &self.interrupt_on_summary {
            cancel.cancel();
            return Ok(None);
        }
        Ok(self.latest().map(|m| SummaryRecord {
            cluster_id: m.cluster_id,
            row_count: self.summary_rows,
            cpu_core_hours: 0.75,
            memory_gigabyte_hours: 1.5,
        }))
    }
}

#[async_trait]
impl OptimizationStore for FakePipeline {
    async fn experiment_count(&self, correlation_key: &str) -> Result<u64> {
        let matches = self.latest().is_some_and(|m| m.cluster_id.contains(correlation_key));
        Ok(if matches { self.experiments } else { 0 })
    }

    async fn recommendation_count(&self, correlation_key: &str) -> Result<u64> {
        let matches = self.latest().is_some_and(|m| m.cluster_id.contains(correlation_key));
        Ok(if matches { self.recommendations } else { 0 })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Services {
    issuer: String,
    idp_hits: Arc<AtomicU32>,
    registry_url: String,
    registry: Registry,
    gateway_url: String,
    gateway: Gateway,
}

async fn start_services(registry: Registry, gateway_status: StatusCode) -> Services {
    let (issuer, idp_hits) = start_idp().await;
    let registry_url = start_registry(registry.clone()).await;
    let (gateway_url, gateway) = start_gateway(gateway_status).await;
    Services {
        issuer,
        idp_hits,
        registry_url,
        registry,
        gateway_url,
        gateway,
    }
}

fn timing() -> TimingConfig {
    TimingConfig {
        poll_interval_secs: 1,
        registration_wait_secs: 5,
        manifest_wait_secs: 5,
        summary_wait_secs: 5,
        recommendation_wait_secs: 5,
        recommendation_attempts: 2,
        recommendation_backoff_secs: 0,
        overall_deadline_secs: 60,
        http_timeout_secs: 5,
        query_timeout_secs: 5,
    }
}

fn registrar(url: &str) -> ResourceRegistrar {
    let config = RegistryConfig {
        base_url: Some(url.to_string()),
        ..Default::default()
    };
    ResourceRegistrar::new(reqwest::Client::new(), config).unwrap()
}

fn runner(services: &Services, pipeline: Arc<FakePipeline>, scratch: &Path) -> ScenarioRunner {
    let tokens = TokenProvider::new(
        reqwest::Client::new(),
        &services.issuer,
        "/protocol/openid-connect/token",
        "pipecheck",
        "hunter2",
        Duration::from_secs(60),
    );
    let uploader = PayloadUploader::new(
        reqwest::Client::new(),
        &services.gateway_url,
        "application/vnd.redhat.hccm.tar+tgz",
    )
    .with_temp_dir(scratch);

    ScenarioRunner::new(
        tokens,
        registrar(&services.registry_url),
        uploader,
        pipeline.clone(),
        pipeline,
        timing(),
    )
}

fn context(logs: &Path, cancel: CancellationToken) -> ScenarioContext {
    let diagnostics = Diagnostics::new(logs, "run-1");
    ScenarioContext::new(KEY, Duration::from_secs(60), cancel, diagnostics).unwrap()
}

fn calls(services: &Services) -> Vec<String> {
    services.registry.calls.lock().clone()
}

fn single_cost_file() -> Vec<pipecheck_verify::ReportFile> {
    let window = pipecheck_verify::ReportWindow::hour_of(chrono::Utc::now());
    let mut files = pipecheck_verify::sample::generate("single", window).unwrap();
    files.truncate(1);
    files
}

fn assert_stages(verdict: &Verdict, expected: &[(&str, bool)]) {
    let actual: Vec<(&str, bool)> = verdict.stages.iter().map(|s| (s.name, s.passed)).collect();
    assert_eq!(actual, expected);
}

// =============================================================================
// Scenarios
// =============================================================================

/// Story: a single-file upload is accepted, processed, summarised and
/// recommended on, and the run leaves nothing behind
#[tokio::test]
async fn story_single_file_upload_verifies_end_to_end() {
    let services = start_services(Registry::default(), StatusCode::ACCEPTED).await;
    let pipeline = Arc::new(FakePipeline::new(services.gateway.received.clone()));
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, pipeline.clone(), scratch.path())
        .with_files(single_cost_file())
        .run(&ctx)
        .await;
    verdict.log_summary();

    assert_eq!(verdict.outcome, Outcome::Passed, "{:?}", verdict.error);
    assert_eq!(verdict.exit_code(), 0);
    assert_stages(
        &verdict,
        &[
            ("authenticate", true),
            ("register", true),
            ("propagation", true),
            ("upload", true),
            ("manifest", true),
            ("summary", true),
            ("recommendation", true),
        ],
    );

    // the manifest that travelled through the gateway carries the run's key
    let received = services.gateway.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].cluster_id, KEY);
    assert_eq!(received[0].files.len(), 1);
    assert!(received[0].resource_optimization_files.is_empty());
    assert_eq!(pipeline.manifest(KEY).await.unwrap().unwrap().file_count, 1);

    // passed: resource deleted, diagnostics and archive gone
    assert!(!verdict.resource_retained);
    assert_eq!(*services.registry.deleted.lock(), vec!["10".to_string()]);
    assert!(verdict.diagnostics.is_empty());
    assert!(!ctx.diagnostics().dir().exists());
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

    // one token fetch served the whole run
    assert_eq!(services.idp_hits.load(Ordering::SeqCst), 1);
}

/// Story: the gateway rejects the token, nothing reaches the pipeline, and
/// the resource is still cleaned up
#[tokio::test]
async fn story_rejected_token_fails_upload_and_still_cleans_up() {
    let services = start_services(Registry::default(), StatusCode::UNAUTHORIZED).await;
    let pipeline = Arc::new(FakePipeline::new(services.gateway.received.clone()));
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, pipeline.clone(), scratch.path()).run(&ctx).await;

    assert_eq!(verdict.outcome, Outcome::Failed);
    assert_eq!(verdict.exit_code(), 1);
    assert!(matches!(verdict.error, Some(Error::Upload { status: 401, .. })));
    assert_eq!(verdict.failed_stage(), Some("upload"));
    assert!(verdict.remediation().unwrap().contains("bearer token"));

    assert_eq!(pipeline.manifest_queries.load(Ordering::SeqCst), 0);
    assert!(services.gateway.received.lock().is_empty());
    assert_eq!(*services.registry.deleted.lock(), vec!["10".to_string()]);
    assert!(!verdict.resource_retained);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

/// Story: creating the source fails, so no bindings are created and
/// cleanup has nothing to delete
#[tokio::test]
async fn story_source_creation_failure_stops_before_bindings() {
    let registry = Registry {
        fail_sources: true,
        ..Default::default()
    };
    let services = start_services(registry, StatusCode::ACCEPTED).await;
    let pipeline = Arc::new(FakePipeline::new(services.gateway.received.clone()));
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, pipeline, scratch.path()).run(&ctx).await;

    match &verdict.error {
        Some(Error::Registration { stage, .. }) => {
            assert_eq!(*stage, RegistrationStage::CreateSource);
            assert_eq!(stage.number(), 2);
        }
        other => panic!("expected registration error, got {:?}", other),
    }
    assert_stages(&verdict, &[("authenticate", true), ("register", false)]);

    let calls = calls(&services);
    assert!(calls.contains(&"POST sources".to_string()));
    assert!(!calls.iter().any(|c| c == "POST authentications" || c == "POST applications"));
    assert!(!calls.iter().any(|c| c.starts_with("DELETE")));

    assert!(verdict.resource.source_id.is_none());
    assert!(verdict.cleanup_error.is_none());
    assert!(services.gateway.received.lock().is_empty());

    // registration failed: its attempt log is kept
    assert_eq!(verdict.diagnostics.len(), 1);
    assert!(verdict.diagnostics[0].exists());
}

/// Story: the source is created but its authentication is rejected, so the
/// orphaned source is deleted during cleanup
#[tokio::test]
async fn story_authentication_failure_deletes_orphaned_source() {
    let registry = Registry {
        fail_authentications: true,
        ..Default::default()
    };
    let services = start_services(registry, StatusCode::ACCEPTED).await;
    let pipeline = Arc::new(FakePipeline::new(services.gateway.received.clone()));
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, pipeline, scratch.path()).run(&ctx).await;

    match &verdict.error {
        Some(Error::Registration { stage, .. }) => {
            assert_eq!(*stage, RegistrationStage::CreateAuthentication);
            assert_eq!(stage.number(), 3);
        }
        other => panic!("expected registration error, got {:?}", other),
    }
    assert_eq!(verdict.exit_code(), 1);
    assert_stages(&verdict, &[("authenticate", true), ("register", false)]);

    let calls = calls(&services);
    assert!(!calls.iter().any(|c| c == "POST applications"));
    assert_eq!(calls.last().map(String::as_str), Some("DELETE sources/10"));
    assert_eq!(*services.registry.deleted.lock(), vec!["10".to_string()]);
    assert!(!verdict.resource_retained);
    assert!(verdict.cleanup_error.is_none());
    assert!(services.gateway.received.lock().is_empty());

    // failed before the gateway saw anything: the registration log is kept
    assert_eq!(verdict.diagnostics.len(), 1);
}

/// Story: everything up to the summary works but the optimization engine
/// never sees the payload
#[tokio::test]
async fn story_missing_experiment_retains_resource_for_inspection() {
    let services = start_services(Registry::default(), StatusCode::ACCEPTED).await;
    let mut pipeline = FakePipeline::new(services.gateway.received.clone());
    pipeline.experiments = 0;
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, Arc::new(pipeline), scratch.path()).run(&ctx).await;

    let err = verdict.error.as_ref().unwrap();
    assert!(matches!(
        err,
        Error::RecommendationAbsent {
            reason: AbsenceReason::NoExperiment,
            attempts: 2,
            ..
        }
    ));
    assert!(!err.is_data_density_issue());
    assert_eq!(verdict.failed_stage(), Some("recommendation"));
    assert_eq!(verdict.stages.iter().filter(|s| s.passed).count(), 6);

    // the payload was accepted, so the resource stays for post-mortem
    assert!(verdict.resource_retained);
    assert_eq!(verdict.resource.source_id.as_deref(), Some("10"));
    assert!(services.registry.deleted.lock().is_empty());
}

/// Story: experiments exist but recommendations do not, which points at
/// data density rather than a broken pipeline
#[tokio::test]
async fn story_missing_recommendation_is_reported_as_data_density() {
    let services = start_services(Registry::default(), StatusCode::ACCEPTED).await;
    let mut pipeline = FakePipeline::new(services.gateway.received.clone());
    pipeline.recommendations = 0;
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, Arc::new(pipeline), scratch.path()).run(&ctx).await;

    let err = verdict.error.as_ref().unwrap();
    assert!(matches!(
        err,
        Error::RecommendationAbsent {
            reason: AbsenceReason::NoRecommendation,
            ..
        }
    ));
    assert!(err.is_data_density_issue());
    assert_eq!(verdict.outcome, Outcome::Failed);
}

/// Story: an interrupt during the summary wait ends the run within a tick,
/// deletes the resource and discards the diagnostics
#[tokio::test]
async fn story_interrupt_during_summary_wait_cleans_up() {
    let services = start_services(Registry::default(), StatusCode::ACCEPTED).await;
    let cancel = CancellationToken::new();
    let mut pipeline = FakePipeline::new(services.gateway.received.clone());
    pipeline.interrupt_on_summary = Some(cancel.clone());
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), cancel);

    let started = tokio::time::Instant::now();
    let verdict = runner(&services, Arc::new(pipeline), scratch.path()).run(&ctx).await;

    assert_eq!(verdict.outcome, Outcome::Cancelled);
    assert_eq!(verdict.exit_code(), 130);
    assert!(verdict.error.as_ref().unwrap().is_cancellation());
    assert_eq!(verdict.failed_stage(), Some("summary"));
    // one tick is a second; the whole run stays well below the summary budget
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(*services.registry.deleted.lock(), vec!["10".to_string()]);
    assert!(!verdict.resource_retained);
    assert!(verdict.diagnostics.is_empty());
    assert!(!ctx.diagnostics().dir().exists());
}

/// Story: deleting a resource twice is a no-op the second time
#[tokio::test]
async fn story_unregister_after_cleanup_is_a_no_op() {
    let services = start_services(Registry::default(), StatusCode::ACCEPTED).await;
    let pipeline = Arc::new(FakePipeline::new(services.gateway.received.clone()));
    let logs = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let ctx = context(logs.path(), CancellationToken::new());

    let verdict = runner(&services, pipeline, scratch.path()).run(&ctx).await;
    assert!(verdict.passed());

    let mut handle = ResourceHandle::existing("10");
    registrar(&services.registry_url).unregister(&mut handle).await.unwrap();
    assert!(handle.source_id.is_none());

    let deletes = calls(&services)
        .into_iter()
        .filter(|c| c == "DELETE sources/10")
        .count();
    assert_eq!(deletes, 2);
}
