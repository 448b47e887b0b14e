//! CLI commands

use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pipecheck_common::kube_utils::create_client;
use pipecheck_verify::{Diagnostics, ScenarioConfig};

use crate::config::{self, Overrides};
use crate::discovery::{discover_endpoints, needs_discovery};
use crate::{GlobalArgs, Result};

pub mod cleanup;
pub mod token;
pub mod verify;

/// Generate a short run ID (8 hex chars) naming the diagnostics directory.
pub fn generate_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Build a kube client from the global flags.
pub async fn kube_client(global: &GlobalArgs) -> Result<Client> {
    Ok(create_client(global.kubeconfig.as_deref(), global.context.as_deref()).await?)
}

/// Load config, apply overrides and fill gaps from the cluster.
///
/// `client` is reused for discovery when the caller already has one; otherwise
/// one is only created if something is actually missing.
pub async fn resolve_config(
    global: &GlobalArgs,
    overrides: &Overrides,
    client: Option<&Client>,
) -> Result<ScenarioConfig> {
    let mut config = config::load(global.config.as_deref())?;
    overrides.apply(&mut config);

    if needs_discovery(&config) {
        debug!("Endpoints or credentials missing, discovering from cluster");
        match client {
            Some(client) => discover_endpoints(client, &mut config).await?,
            None => {
                let client = kube_client(global).await?;
                discover_endpoints(&client, &mut config).await?;
            }
        }
    }
    Ok(config)
}

/// Diagnostics for a new run under the configured directory.
pub fn diagnostics(config: &ScenarioConfig) -> Diagnostics {
    Diagnostics::new(&config.diagnostics.dir, generate_run_id())
}

/// Cancel `token` on the first Ctrl-C.
pub fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping and cleaning up");
            token.cancel();
        }
    });
}
