//! Token command - check identity provider settings
//!
//! Obtains a token with the configured client credentials and prints the
//! issuer and expiry. The token itself is only printed with `--show`.

use clap::Args;
use tokio_util::sync::CancellationToken;

use pipecheck_verify::{generate_correlation_key, ScenarioContext, Token, TokenProvider};

use crate::config::Overrides;
use crate::{GlobalArgs, Result};

/// Token command arguments
#[derive(Args, Debug)]
pub struct TokenArgs {
    /// Print the access token itself
    #[arg(long)]
    pub show: bool,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Run the token command
pub async fn run(global: &GlobalArgs, args: TokenArgs) -> Result<()> {
    let config = super::resolve_config(global, &args.overrides, None).await?;
    let timing = &config.timing;
    let provider = TokenProvider::from_config(&config.identity, timing.http_timeout())?;

    let cancel = CancellationToken::new();
    super::cancel_on_interrupt(cancel.clone());
    let ctx = ScenarioContext::new(
        generate_correlation_key(),
        timing.http_timeout(),
        cancel,
        super::diagnostics(&config),
    )?;

    match provider.get_token(&ctx).await {
        Ok(token) => {
            ctx.diagnostics().purge();
            println!("{}", describe(&token, args.show));
            Ok(())
        }
        Err(e) => {
            for path in ctx.diagnostics().retained() {
                eprintln!("diagnostic log: {}", path.display());
            }
            Err(e.into())
        }
    }
}

fn describe(token: &Token, show: bool) -> String {
    let mut out = format!("issuer:     {}\nexpires_at: {}", token.issuer(), token.expires_at());
    if show {
        out.push_str(&format!("\ntoken:      {}", token.secret()));
    }
    out
}
