//! Scenario configuration.
//!
//! One YAML document describes every endpoint, credential, store location and
//! polling budget a run needs. Every section has defaults, so a config file
//! only has to name what differs from a stock deployment:
//!
//! ```yaml
//! identity:
//!   issuer_url: https://sso.example.com/auth/realms/redhat-external
//!   client_id: cost-management-operator
//! registry:
//!   base_url: http://sources-api.cost-mgmt.svc:8000/api/sources/v3.1
//! gateway:
//!   base_url: http://ingress.cost-mgmt.svc:3000
//! timing:
//!   summary_wait_secs: 1200
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pipecheck_common::{Error, Result};

/// Full configuration for one scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// OAuth2 identity provider
    pub identity: IdentityConfig,
    /// Resource registry API
    pub registry: RegistryConfig,
    /// Ingestion gateway
    pub gateway: GatewayConfig,
    /// Relational store holding manifests and summaries
    pub relational_store: StoreTarget,
    /// Optimization engine store
    #[serde(default = "StoreTarget::optimization_default")]
    pub optimization_store: StoreTarget,
    /// Polling budgets
    pub timing: TimingConfig,
    /// Diagnostic log location
    pub diagnostics: DiagnosticsConfig,
    /// Where to look up endpoints and credentials left unset above
    pub discovery: DiscoveryConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            registry: RegistryConfig::default(),
            gateway: GatewayConfig::default(),
            relational_store: StoreTarget::default(),
            optimization_store: StoreTarget::optimization_default(),
            timing: TimingConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// OAuth2 client-credentials settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Issuer URL including the realm
    pub issuer_url: Option<String>,
    /// OAuth client id
    pub client_id: Option<String>,
    /// OAuth client secret
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    /// Token endpoint path relative to the issuer
    pub token_path: String,
    /// Refresh a cached token this long before it expires
    pub refresh_margin_secs: u64,
    /// Skip TLS verification (development clusters)
    pub insecure_tls: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            client_id: None,
            client_secret: None,
            token_path: "/protocol/openid-connect/token".to_string(),
            refresh_margin_secs: 60,
            insecure_tls: false,
        }
    }
}

/// Resource registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// API base URL, e.g. `http://sources-api:8000/api/sources/v3.1`
    pub base_url: Option<String>,
    /// Tenant org id sent in the identity header
    pub org_id: String,
    /// Username sent in the identity header
    pub username: String,
    /// Source type name to resolve
    pub source_type: String,
    /// Application type name to resolve
    pub application_type: String,
    /// Prefix for created source names
    pub source_name_prefix: String,
    /// Bucket name carried in the application's extra configuration
    pub bucket: String,
    /// Skip TLS verification (development clusters)
    pub insecure_tls: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            org_id: "1234567".to_string(),
            username: "pipecheck".to_string(),
            source_type: "openshift".to_string(),
            application_type: "/insights/platform/cost-management".to_string(),
            source_name_prefix: "pipecheck".to_string(),
            bucket: "pipecheck-reports".to_string(),
            insecure_tls: false,
        }
    }
}

/// Ingestion gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway base URL
    pub base_url: Option<String>,
    /// Upload path appended to the base URL
    pub upload_path: String,
    /// Content type identifying the payload as a cost/usage report
    pub content_type: String,
    /// Skip TLS verification (development clusters)
    pub insecure_tls: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            upload_path: "/api/ingress/v1/upload".to_string(),
            content_type: "application/vnd.redhat.hccm.tar+tgz".to_string(),
            insecure_tls: false,
        }
    }
}

impl GatewayConfig {
    /// Full upload URL, if a base URL is configured
    pub fn upload_url(&self) -> Option<String> {
        self.base_url.as_ref().map(|base| {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.upload_path.trim_start_matches('/')
            )
        })
    }
}

/// Location of a PostgreSQL instance reachable through pod exec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreTarget {
    /// Namespace of the database pod
    pub namespace: String,
    /// Label selector for the database pod
    pub pod_selector: String,
    /// Container to exec into (first container if unset)
    pub container: Option<String>,
    /// Database name
    pub database: String,
    /// Database user
    pub user: String,
    /// Tenant schema holding summary tables
    pub schema: Option<String>,
}

impl Default for StoreTarget {
    fn default() -> Self {
        Self {
            namespace: "cost-mgmt".to_string(),
            pod_selector: "app.kubernetes.io/component=database".to_string(),
            container: None,
            database: "koku".to_string(),
            user: "koku".to_string(),
            schema: Some("org1234567".to_string()),
        }
    }
}

impl StoreTarget {
    /// Defaults for the optimization engine database
    pub fn optimization_default() -> Self {
        Self {
            pod_selector: "app.kubernetes.io/component=ros-database".to_string(),
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            schema: None,
            ..Self::default()
        }
    }
}

/// Polling budgets, all configurable
///
/// The defaults reflect observed CI timing and carry no further meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between store polls
    pub poll_interval_secs: u64,
    /// Budget for registration to reach the ingestion service
    pub registration_wait_secs: u64,
    /// Budget for manifest processing
    pub manifest_wait_secs: u64,
    /// Budget for summary population
    pub summary_wait_secs: u64,
    /// Wall-clock budget for the optimization engine check
    pub recommendation_wait_secs: u64,
    /// Attempt budget for the optimization engine check
    pub recommendation_attempts: u32,
    /// Sleep before each optimization engine attempt
    pub recommendation_backoff_secs: u64,
    /// Budget for the whole scenario
    pub overall_deadline_secs: u64,
    /// Per-request HTTP timeout
    pub http_timeout_secs: u64,
    /// Per-query store timeout
    pub query_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            registration_wait_secs: 300,
            manifest_wait_secs: 600,
            summary_wait_secs: 900,
            recommendation_wait_secs: 1800,
            recommendation_attempts: 30,
            recommendation_backoff_secs: 60,
            overall_deadline_secs: 3600,
            http_timeout_secs: 30,
            query_timeout_secs: 60,
        }
    }
}

impl TimingConfig {
    /// Interval between store polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Registration propagation budget
    pub fn registration_wait(&self) -> Duration {
        Duration::from_secs(self.registration_wait_secs)
    }

    /// Manifest processing budget
    pub fn manifest_wait(&self) -> Duration {
        Duration::from_secs(self.manifest_wait_secs)
    }

    /// Summary population budget
    pub fn summary_wait(&self) -> Duration {
        Duration::from_secs(self.summary_wait_secs)
    }

    /// Optimization engine wall-clock budget
    pub fn recommendation_wait(&self) -> Duration {
        Duration::from_secs(self.recommendation_wait_secs)
    }

    /// Sleep before each optimization engine attempt
    pub fn recommendation_backoff(&self) -> Duration {
        Duration::from_secs(self.recommendation_backoff_secs)
    }

    /// Whole-scenario budget
    pub fn overall_deadline(&self) -> Duration {
        Duration::from_secs(self.overall_deadline_secs)
    }

    /// Per-request HTTP timeout
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Per-query store timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Diagnostic log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Directory receiving per-attempt logs
    pub dir: PathBuf,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("pipecheck"),
        }
    }
}

/// Cluster objects consulted when endpoints or credentials are not configured
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Namespace holding the routes and the client secret
    pub namespace: String,
    /// Route exposing the identity provider
    pub identity_route: String,
    /// Realm path appended to the identity route host
    pub identity_realm_path: String,
    /// Route exposing the ingestion gateway
    pub gateway_route: String,
    /// Route exposing the registry API
    pub registry_route: String,
    /// Path appended to the registry route host
    pub registry_api_path: String,
    /// Secret holding the OAuth client credentials
    pub client_secret_name: String,
    /// Key of the client id in that secret
    pub client_id_key: String,
    /// Key of the client secret in that secret
    pub client_secret_key: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: "cost-mgmt".to_string(),
            identity_route: "keycloak".to_string(),
            identity_realm_path: "/auth/realms/kubernetes".to_string(),
            gateway_route: "ingress".to_string(),
            registry_route: "sources-api".to_string(),
            registry_api_path: "/api/sources/v3.1".to_string(),
            client_secret_name: "cost-management-operator-client".to_string(),
            client_id_key: "client_id".to_string(),
            client_secret_key: "client_secret".to_string(),
        }
    }
}

impl ScenarioConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid scenario config: {}", e)))
    }

    /// Read and parse a YAML file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Reject configurations that cannot possibly run
    ///
    /// Called before any network activity.
    pub fn validate(&self) -> Result<()> {
        require(&self.identity.issuer_url, "identity.issuer_url")?;
        require(&self.identity.client_id, "identity.client_id")?;
        require(&self.identity.client_secret, "identity.client_secret")?;
        require(&self.registry.base_url, "registry.base_url")?;
        require(&self.gateway.base_url, "gateway.base_url")?;

        if self.timing.poll_interval_secs == 0 {
            return Err(Error::config("timing.poll_interval_secs must be > 0"));
        }
        if self.timing.recommendation_backoff_secs == 0 {
            return Err(Error::config(
                "timing.recommendation_backoff_secs must be > 0",
            ));
        }
        if self.timing.http_timeout_secs == 0 || self.timing.query_timeout_secs == 0 {
            return Err(Error::config("per-call timeouts must be > 0"));
        }
        if let Some(schema) = &self.relational_store.schema {
            crate::store::validate_identifier(schema)?;
        }
        Ok(())
    }
}

fn require(value: &Option<String>, field: &str) -> Result<()> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(Error::config(format!("{} is required", field))),
    }
}
