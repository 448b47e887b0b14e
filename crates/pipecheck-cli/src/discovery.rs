//! Fill endpoints and credentials left unset from the cluster.
//!
//! Hosts come from OpenShift routes in the pipeline namespace; the OAuth
//! client credentials come from a secret. Only missing values are looked up,
//! so anything set in the config file or on the command line wins.

use kube::Client;
use tracing::info;

use pipecheck_common::kube_utils::{get_secret_string, route_url};
use pipecheck_common::Result;
use pipecheck_verify::http::join_url;
use pipecheck_verify::ScenarioConfig;

/// Values read from the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovered {
    /// Base URL of the identity provider route
    pub identity_route: Option<String>,
    /// Base URL of the registry route
    pub registry_route: Option<String>,
    /// Base URL of the gateway route
    pub gateway_route: Option<String>,
    /// OAuth client id
    pub client_id: Option<String>,
    /// OAuth client secret
    pub client_secret: Option<String>,
}

/// Whether any endpoint or credential still has to come from the cluster
pub fn needs_discovery(config: &ScenarioConfig) -> bool {
    config.identity.issuer_url.is_none()
        || config.identity.client_id.is_none()
        || config.identity.client_secret.is_none()
        || config.registry.base_url.is_none()
        || config.gateway.base_url.is_none()
}

/// Look up every missing value and write it into `config`
pub async fn discover_endpoints(client: &Client, config: &mut ScenarioConfig) -> Result<()> {
    let d = config.discovery.clone();
    let mut found = Discovered::default();

    if config.identity.issuer_url.is_none() {
        found.identity_route = Some(route_url(client, &d.namespace, &d.identity_route).await?);
    }
    if config.registry.base_url.is_none() {
        found.registry_route = Some(registry_route(client, config).await?);
    }
    if config.gateway.base_url.is_none() {
        found.gateway_route = Some(route_url(client, &d.namespace, &d.gateway_route).await?);
    }
    if config.identity.client_id.is_none() {
        found.client_id = Some(
            get_secret_string(client, &d.namespace, &d.client_secret_name, &d.client_id_key)
                .await?,
        );
    }
    if config.identity.client_secret.is_none() {
        found.client_secret = Some(
            get_secret_string(
                client,
                &d.namespace,
                &d.client_secret_name,
                &d.client_secret_key,
            )
            .await?,
        );
    }

    apply(config, found);
    Ok(())
}

/// Look up only the registry endpoint
pub async fn discover_registry(client: &Client, config: &mut ScenarioConfig) -> Result<()> {
    let found = Discovered {
        registry_route: Some(registry_route(client, config).await?),
        ..Default::default()
    };
    apply(config, found);
    Ok(())
}

async fn registry_route(client: &Client, config: &ScenarioConfig) -> Result<String> {
    let d = &config.discovery;
    route_url(client, &d.namespace, &d.registry_route).await
}

/// Write discovered values into `config`, appending the configured paths
pub fn apply(config: &mut ScenarioConfig, found: Discovered) {
    let d = &config.discovery;

    if let Some(route) = found.identity_route {
        let issuer = join_url(&route, &d.identity_realm_path);
        info!(issuer = %issuer, "Discovered identity provider");
        config.identity.issuer_url = Some(issuer);
    }
    if let Some(route) = found.registry_route {
        let url = join_url(&route, &d.registry_api_path);
        info!(url = %url, "Discovered registry API");
        config.registry.base_url = Some(url);
    }
    if let Some(route) = found.gateway_route {
        info!(url = %route, "Discovered ingestion gateway");
        config.gateway.base_url = Some(route);
    }
    if let Some(id) = found.client_id {
        info!(client_id = %id, "Read OAuth client id from secret");
        config.identity.client_id = Some(id);
    }
    if found.client_secret.is_some() {
        info!("Read OAuth client secret from secret");
        config.identity.client_secret = found.client_secret;
    }
}
