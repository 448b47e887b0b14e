//! Cleanup command - delete a test resource retained by a failed run
//!
//! Deleting a source that no longer exists succeeds, so the command can be
//! repeated safely.

use clap::Args;
use tracing::info;

use pipecheck_verify::{ResourceHandle, ResourceRegistrar};

use crate::config::Overrides;
use crate::discovery::discover_registry;
use crate::{Error, GlobalArgs, Result};

/// Cleanup command arguments
#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Registry id of the source to delete (printed by the failed run)
    #[arg(long)]
    pub source_id: String,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Run the cleanup command
pub async fn run(global: &GlobalArgs, args: CleanupArgs) -> Result<()> {
    let source_id = args.source_id.trim();
    if !is_valid_source_id(source_id) {
        return Err(Error::validation(format!("invalid source id '{}'", args.source_id)));
    }

    let mut config = crate::config::load(global.config.as_deref())?;
    args.overrides.apply(&mut config);
    if config.registry.base_url.is_none() {
        let client = super::kube_client(global).await?;
        discover_registry(&client, &mut config).await?;
    }

    let registrar =
        ResourceRegistrar::from_config(&config.registry, config.timing.http_timeout())?;
    let mut handle = ResourceHandle::existing(source_id);
    registrar.unregister(&mut handle).await?;

    info!(source_id = %source_id, "Test resource removed");
    Ok(())
}

// ids end up in the request path
fn is_valid_source_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_ids_are_path_safe() {
        assert!(is_valid_source_id("10"));
        assert!(is_valid_source_id("3f2a-77"));
        assert!(!is_valid_source_id(""));
        assert!(!is_valid_source_id("10/../applications"));
        assert!(!is_valid_source_id("10?force=true"));
    }
}
