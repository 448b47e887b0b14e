//! Scenario configuration resolution for the CLI.
//!
//! The config file resolution chain (highest priority first):
//! 1. Explicit `--config` flag
//! 2. `PIPECHECK_CONFIG` environment variable
//! 3. `~/.pipecheck/config.yaml`
//! 4. Built-in defaults
//!
//! Individual flags and their environment variables override values read
//! from the file.

use std::path::{Path, PathBuf};

use clap::Args;
use tracing::{debug, info};

use pipecheck_verify::ScenarioConfig;

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".pipecheck";
const CONFIG_FILE_NAME: &str = "config.yaml";
const PIPECHECK_CONFIG_ENV: &str = "PIPECHECK_CONFIG";

/// Where a config file came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// `--config`
    Flag(PathBuf),
    /// `PIPECHECK_CONFIG`
    Env(PathBuf),
    /// `~/.pipecheck/config.yaml`
    Home(PathBuf),
}

impl ConfigSource {
    /// Path of the file
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::Flag(p) | ConfigSource::Env(p) | ConfigSource::Home(p) => p,
        }
    }
}

/// Path to `~/.pipecheck/config.yaml`, if a home directory is known
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Resolve the config file using the priority chain
///
/// Returns `None` to use built-in defaults. The home file is only picked
/// when it exists; explicit paths are returned as given.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<ConfigSource> {
    resolve_from(
        explicit,
        std::env::var(PIPECHECK_CONFIG_ENV).ok().as_deref(),
        default_config_path(),
    )
}

fn resolve_from(
    explicit: Option<&Path>,
    env: Option<&str>,
    home: Option<PathBuf>,
) -> Option<ConfigSource> {
    if let Some(path) = explicit {
        return Some(ConfigSource::Flag(path.to_path_buf()));
    }
    if let Some(path) = env.filter(|p| !p.is_empty()) {
        return Some(ConfigSource::Env(PathBuf::from(path)));
    }
    home.filter(|p| p.exists()).map(ConfigSource::Home)
}

/// Load the scenario config through the resolution chain
///
/// An explicitly named file that does not exist is an error rather than a
/// silent fall back to defaults.
pub fn load(explicit: Option<&Path>) -> Result<ScenarioConfig> {
    match resolve_config_path(explicit) {
        Some(source) => load_source(&source),
        None => {
            debug!("No config file found, using defaults");
            Ok(ScenarioConfig::default())
        }
    }
}

fn load_source(source: &ConfigSource) -> Result<ScenarioConfig> {
    let path = source.path();
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    info!(path = %path.display(), "Loading scenario config");
    Ok(ScenarioConfig::from_path(path)?)
}

/// Endpoint and credential overrides shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// OAuth issuer URL (realm base)
    #[arg(long, env = "PIPECHECK_ISSUER_URL")]
    pub issuer_url: Option<String>,

    /// OAuth client id
    #[arg(long, env = "PIPECHECK_CLIENT_ID")]
    pub client_id: Option<String>,

    /// OAuth client secret
    #[arg(long, env = "PIPECHECK_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Resource registry API base URL
    #[arg(long, env = "PIPECHECK_REGISTRY_URL")]
    pub registry_url: Option<String>,

    /// Ingestion gateway base URL
    #[arg(long, env = "PIPECHECK_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Namespace the pipeline is deployed in
    #[arg(long, short = 'n', env = "PIPECHECK_NAMESPACE")]
    pub namespace: Option<String>,

    /// Tenant schema holding the summary tables
    #[arg(long, env = "PIPECHECK_SCHEMA")]
    pub schema: Option<String>,

    /// Directory for diagnostic logs
    #[arg(long, env = "PIPECHECK_DIAGNOSTICS_DIR")]
    pub diagnostics_dir: Option<PathBuf>,

    /// Skip TLS verification for the identity provider and gateway
    #[arg(long)]
    pub insecure: bool,
}

impl Overrides {
    /// Apply every override that was given
    pub fn apply(&self, config: &mut ScenarioConfig) {
        if let Some(v) = &self.issuer_url {
            config.identity.issuer_url = Some(v.clone());
        }
        if let Some(v) = &self.client_id {
            config.identity.client_id = Some(v.clone());
        }
        if let Some(v) = &self.client_secret {
            config.identity.client_secret = Some(v.clone());
        }
        if let Some(v) = &self.registry_url {
            config.registry.base_url = Some(v.clone());
        }
        if let Some(v) = &self.gateway_url {
            config.gateway.base_url = Some(v.clone());
        }
        if let Some(ns) = &self.namespace {
            config.discovery.namespace = ns.clone();
            config.relational_store.namespace = ns.clone();
        }
        if let Some(schema) = &self.schema {
            config.relational_store.schema = Some(schema.clone());
        }
        if let Some(dir) = &self.diagnostics_dir {
            config.diagnostics.dir = dir.clone();
        }
        if self.insecure {
            config.identity.insecure_tls = true;
            config.registry.insecure_tls = true;
            config.gateway.insecure_tls = true;
        }
    }
}
