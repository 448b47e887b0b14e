//! pipecheck CLI library

pub mod commands;
pub mod config;
pub mod discovery;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// pipecheck - end-to-end verification of the cost ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "pipecheck")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Scenario config file (default: $PIPECHECK_CONFIG, then ~/.pipecheck/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Kubeconfig for the cluster running the pipeline
    #[arg(long, global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full verification scenario
    Verify(commands::verify::VerifyArgs),
    /// Obtain a token to check identity provider settings
    Token(commands::token::TokenArgs),
    /// Delete a test resource left behind by a failed run
    Cleanup(commands::cleanup::CleanupArgs),
}

impl Cli {
    /// Run the CLI command, returning the process exit code
    pub async fn run(self) -> Result<i32> {
        match self.command {
            Commands::Verify(args) => commands::verify::run(&self.global, args).await,
            Commands::Token(args) => commands::token::run(&self.global, args).await.map(|_| 0),
            Commands::Cleanup(args) => commands::cleanup::run(&self.global, args).await.map(|_| 0),
        }
    }
}
