//! Registration of the test resource with the resource registry API.
//!
//! A resource is a source plus an authentication and an application bound to
//! it. Creation is a strict sequence where each call needs the source id from
//! the one before. The [`ResourceHandle`] is filled in as ids are assigned so
//! that a failure partway through still leaves enough to clean up.

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use pipecheck_common::retry::{retry_transient, RetryConfig};
use pipecheck_common::{Error, PollError, Poller, RegistrationStage, Result, Tick};

use crate::config::RegistryConfig;
use crate::context::ScenarioContext;
use crate::diagnostics::AttemptLog;
use crate::http;
use crate::store::{ProviderRecord, RelationalStore};

/// Tenant identity header required by every registry call
pub const IDENTITY_HEADER: &str = "x-rh-identity";

/// Ids assigned to a registered resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Correlation key the resource was registered under
    pub correlation_key: String,
    /// Source name
    pub source_name: String,
    /// Source id, once created
    pub source_id: Option<String>,
    /// Authentication id, once created
    pub authentication_id: Option<String>,
    /// Application id, once created
    pub application_id: Option<String>,
}

impl ResourceHandle {
    /// An empty handle for a resource about to be registered
    pub fn new(correlation_key: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            correlation_key: correlation_key.into(),
            source_name: source_name.into(),
            ..Default::default()
        }
    }

    /// A handle for a source created by an earlier run
    pub fn existing(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Default::default()
        }
    }
}

/// Registry ids may be serialized as strings or numbers
fn id_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(default, deserialize_with = "id_string")]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    data: Vec<Created>,
}

/// Build the base64 identity header for `org_id`
pub fn identity_header(org_id: &str, username: &str) -> String {
    let identity = json!({
        "identity": {
            "account_number": org_id,
            "org_id": org_id,
            "type": "User",
            "internal": { "org_id": org_id },
            "user": { "username": username, "is_org_admin": true },
        },
        "entitlements": { "cost_management": { "is_entitled": true } },
    });
    base64::engine::general_purpose::STANDARD.encode(identity.to_string())
}

/// Creates, confirms and deletes test resources
#[derive(Debug, Clone)]
pub struct ResourceRegistrar {
    client: reqwest::Client,
    base_url: String,
    identity: String,
    config: RegistryConfig,
    retry: RetryConfig,
}

impl ResourceRegistrar {
    /// Create a registrar for the registry at `config.base_url`
    pub fn new(client: reqwest::Client, config: RegistryConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::config("registry.base_url is required"))?;
        Ok(Self {
            client,
            base_url,
            identity: identity_header(&config.org_id, &config.username),
            config,
            retry: RetryConfig::default(),
        })
    }

    /// Create a registrar from config with a per-request timeout
    pub fn from_config(config: &RegistryConfig, timeout: Duration) -> Result<Self> {
        Self::new(
            http::build_client(timeout, config.insecure_tls)?,
            config.clone(),
        )
    }

    /// Override the retry policy used for lookups and deletes
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Name given to the source of a run
    pub fn source_name(&self, correlation_key: &str) -> String {
        format!("{}-{}", self.config.source_name_prefix, correlation_key)
    }

    /// Register the resource for `handle.correlation_key`
    ///
    /// Ids are written into `handle` as soon as they are assigned. The first
    /// failing step ends the sequence; later steps are never attempted.
    #[instrument(skip(self, ctx, handle), fields(correlation_key = %handle.correlation_key))]
    pub async fn register(&self, ctx: &ScenarioContext, handle: &mut ResourceHandle) -> Result<()> {
        let mut log = ctx.diagnostics().begin("registration")?;
        match self.register_steps(ctx, handle, &mut log).await {
            Ok(()) => {
                log.succeed();
                info!(
                    source_id = handle.source_id.as_deref().unwrap_or_default(),
                    "Registered test resource"
                );
                Ok(())
            }
            Err(e) => {
                log.fail(&e);
                Err(e)
            }
        }
    }

    async fn register_steps(
        &self,
        ctx: &ScenarioContext,
        handle: &mut ResourceHandle,
        log: &mut AttemptLog,
    ) -> Result<()> {
        let source_type_id = self
            .lookup_id(ctx, log, "source_types", &self.config.source_type)
            .await?;
        let application_type_id = self
            .lookup_id(ctx, log, "application_types", &self.config.application_type)
            .await?;

        let source_id = self
            .create(
                ctx,
                log,
                RegistrationStage::CreateSource,
                "sources",
                json!({
                    "name": handle.source_name,
                    "source_type_id": source_type_id,
                    "source_ref": handle.correlation_key,
                }),
            )
            .await?;
        handle.source_id = Some(source_id.clone());

        let authentication_id = self
            .create(
                ctx,
                log,
                RegistrationStage::CreateAuthentication,
                "authentications",
                json!({
                    "resource_type": "Source",
                    "resource_id": source_id,
                    "authtype": "token",
                    "username": handle.correlation_key,
                }),
            )
            .await?;
        handle.authentication_id = Some(authentication_id);

        let application_id = self
            .create(
                ctx,
                log,
                RegistrationStage::CreateApplication,
                "applications",
                json!({
                    "source_id": source_id,
                    "application_type_id": application_type_id,
                    "extra": {
                        "bucket": self.config.bucket,
                        "cluster_id": handle.correlation_key,
                    },
                }),
            )
            .await?;
        handle.application_id = Some(application_id);
        Ok(())
    }

    async fn lookup_id(
        &self,
        ctx: &ScenarioContext,
        log: &mut AttemptLog,
        collection: &str,
        name: &str,
    ) -> Result<String> {
        let url = http::join_url(&self.base_url, collection);
        log.record(format_args!("GET {}?filter[name]={}", url, name));

        // transport failures that outlast the retries still belong to step 1
        let listing = retry_transient(&self.retry, collection, ctx.cancel_token(), || {
            ctx.guard(collection, self.fetch_listing(&url, name))
        })
        .await
        .map_err(|e| match e {
            Error::Registration { .. } | Error::Cancelled { .. } => e,
            other => {
                log.record(format_args!("{} lookup failed: {}", collection, other));
                Error::registration(
                    RegistrationStage::LookupTypes,
                    format!("{} lookup failed: {}", collection, other),
                )
            }
        })?;

        listing
            .data
            .into_iter()
            .find_map(|item| item.id)
            .ok_or_else(|| {
                Error::registration(
                    RegistrationStage::LookupTypes,
                    format!("{} has no entry named '{}'", collection, name),
                )
            })
    }

    async fn fetch_listing(&self, url: &str, name: &str) -> Result<Listing> {
        let response = self
            .client
            .get(url)
            .query(&[("filter[name]", name)])
            .header(IDENTITY_HEADER, &self.identity)
            .send()
            .await
            .map_err(|e| Error::http("registry lookup", &e))?;

        let status = response.status();
        if status.is_server_error() {
            let body = http::error_body(response, &[]).await;
            return Err(Error::http_status("registry lookup", status.as_u16(), &body));
        }
        if !status.is_success() {
            let body = http::error_body(response, &[]).await;
            return Err(Error::registration(
                RegistrationStage::LookupTypes,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }
        response.json().await.map_err(|e| {
            Error::registration(
                RegistrationStage::LookupTypes,
                format!("unexpected response shape: {}", e),
            )
        })
    }

    async fn create(
        &self,
        ctx: &ScenarioContext,
        log: &mut AttemptLog,
        stage: RegistrationStage,
        collection: &str,
        body: Value,
    ) -> Result<String> {
        let url = http::join_url(&self.base_url, collection);
        log.record(format_args!("POST {} {}", url, body));

        let send = async {
            self.client
                .post(&url)
                .header(IDENTITY_HEADER, &self.identity)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::registration(stage, format!("request failed: {}", e)))
        };
        let response = ctx.guard(stage.as_str(), send).await?;

        let status = response.status();
        if !status.is_success() {
            let body = http::error_body(response, &[]).await;
            log.record(format_args!("HTTP {} {}", status.as_u16(), body));
            return Err(Error::registration(
                stage,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        let created: Created = response.json().await.map_err(|e| {
            Error::registration(stage, format!("unexpected response shape: {}", e))
        })?;
        let id = created
            .id
            .ok_or_else(|| Error::registration(stage, "response carried no id"))?;

        log.record(format_args!("HTTP {} id={}", status.as_u16(), id));
        debug!(stage = %stage, id = %id, "Created registry record");
        Ok(id)
    }

    /// Wait until the ingestion service has a provider for the resource
    ///
    /// Confirms the registration event made it through the queue rather than
    /// only that the registry accepted the calls.
    #[instrument(skip(self, ctx, store), fields(correlation_key = %ctx.correlation_key()))]
    pub async fn wait_for_propagation(
        &self,
        ctx: &ScenarioContext,
        store: &dyn RelationalStore,
        interval: Duration,
        max_wait: Duration,
    ) -> Result<ProviderRecord> {
        let key = ctx.correlation_key();
        let budget = ctx.budget(max_wait);
        let poller = Poller::new(
            "provider propagation",
            interval,
            budget,
            ctx.cancel_token().clone(),
        );

        // pending observations describe the wait; a failure carries the foreign key
        let result = poller
            .run(|| async move {
                match store.provider_for_cluster(key).await? {
                    None => Ok(Tick::Pending("no provider yet".to_string())),
                    Some(p) if p.cluster_id != key => Ok(Tick::Failed(p.cluster_id)),
                    Some(p) => Ok(Tick::Ready(p)),
                }
            })
            .await;

        match result {
            Ok(provider) => {
                info!(provider = %provider.uuid, "Registration propagated");
                Ok(provider)
            }
            Err(PollError::Cancelled) => Err(Error::cancelled("registration propagation")),
            Err(PollError::Failed(found)) => Err(Error::CorrelationMismatch {
                origin: "provider lookup".to_string(),
                expected: key.to_string(),
                found,
            }),
            Err(PollError::Timeout { waited, .. }) => Err(Error::RegistrationTimeout {
                correlation_key: key.to_string(),
                waited,
            }),
        }
    }

    /// Delete the resource's source, cascading to its bindings
    ///
    /// A handle without a source id and a source already gone are both
    /// no-ops. Transient failures are retried. Runs without the scenario's
    /// cancellation so that interrupt cleanup still completes.
    #[instrument(skip(self, handle), fields(source_id = ?handle.source_id))]
    pub async fn unregister(&self, handle: &mut ResourceHandle) -> Result<()> {
        let Some(source_id) = handle.source_id.clone() else {
            debug!("Nothing registered, skipping unregister");
            return Ok(());
        };

        let url = http::join_url(&self.base_url, &format!("sources/{}", source_id));
        let status = retry_transient(&self.retry, "unregister", &CancellationToken::new(), || {
            self.delete_source(&url)
        })
        .await?;

        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("Source already deleted");
        } else {
            info!("Deleted test resource");
        }
        handle.source_id = None;
        handle.authentication_id = None;
        handle.application_id = None;
        Ok(())
    }

    async fn delete_source(&self, url: &str) -> Result<reqwest::StatusCode> {
        let response = self
            .client
            .delete(url)
            .header(IDENTITY_HEADER, &self.identity)
            .send()
            .await
            .map_err(|e| Error::http("unregister", &e))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(status);
        }

        let body = http::error_body(response, &[]).await;
        warn!(status = status.as_u16(), body = %body, "Failed to delete source");
        Err(Error::http_status("unregister", status.as_u16(), &body))
    }
}
