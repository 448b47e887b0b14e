//! OAuth2 client-credentials token provider with expiry-aware caching.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use pipecheck_common::{Error, Result};

use crate::config::IdentityConfig;
use crate::context::ScenarioContext;
use crate::http::{self, MAX_BODY_IN_ERROR};

/// Lifetime assumed when the issuer omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 300;

/// Upper bound on an issued token's lifetime
const MAX_EXPIRES_IN_SECS: u64 = 86_400;

/// A bearer token and when it stops being valid
///
/// Debug output never contains the token value.
#[derive(Clone)]
pub struct Token {
    value: String,
    issuer: String,
    expires_at: Instant,
    expires_at_utc: DateTime<Utc>,
}

impl Token {
    /// Wrap a token issued now with the given lifetime
    pub fn new(value: impl Into<String>, issuer: impl Into<String>, lifetime: Duration) -> Self {
        let expires_at_utc = Utc::now()
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            value: value.into(),
            issuer: issuer.into(),
            expires_at: Instant::now() + lifetime,
            expires_at_utc,
        }
    }

    /// The raw token, for the `Authorization` header only
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// Issuer that minted the token
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Wall-clock expiry
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at_utc
    }

    /// Whether the token is still usable `margin` from now
    pub fn is_valid_for(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .field("expires_at", &self.expires_at_utc)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Obtains bearer tokens from the identity provider and caches them
pub struct TokenProvider {
    client: reqwest::Client,
    issuer: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_margin: Duration,
    cache: RwLock<Option<Token>>,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl TokenProvider {
    /// Create a provider for an issuer and client credentials
    pub fn new(
        client: reqwest::Client,
        issuer: impl Into<String>,
        token_path: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_margin: Duration,
    ) -> Self {
        let issuer = issuer.into();
        Self {
            token_url: http::join_url(&issuer, token_path),
            client,
            issuer,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_margin,
            cache: RwLock::new(None),
        }
    }

    /// Create a provider from the identity section of the config
    pub fn from_config(config: &IdentityConfig, timeout: Duration) -> Result<Self> {
        let missing = |field: &str| Error::config(format!("identity.{} is required", field));
        let issuer = config.issuer_url.clone().ok_or_else(|| missing("issuer_url"))?;
        let client_id = config.client_id.clone().ok_or_else(|| missing("client_id"))?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or_else(|| missing("client_secret"))?;

        Ok(Self::new(
            http::build_client(timeout, config.insecure_tls)?,
            issuer,
            &config.token_path,
            client_id,
            client_secret,
            Duration::from_secs(config.refresh_margin_secs),
        ))
    }

    /// Issuer URL
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Return the cached token, fetching a new one when absent or about to
    /// expire
    ///
    /// Failures are never retried: a bad credential fails identically on
    /// every attempt.
    #[instrument(skip(self, ctx), fields(issuer = %self.issuer))]
    pub async fn get_token(&self, ctx: &ScenarioContext) -> Result<Token> {
        if let Some(token) = self.cached() {
            debug!("Using cached token");
            return Ok(token);
        }

        let token = ctx.guard("token-fetch", self.fetch(ctx)).await?;
        *self.cache.write() = Some(token.clone());
        info!(expires_at = %token.expires_at(), "Obtained access token");
        Ok(token)
    }

    /// Drop the cached token (e.g. after a 401)
    pub fn invalidate(&self) {
        if self.cache.write().take().is_some() {
            debug!(issuer = %self.issuer, "Invalidated cached token");
        }
    }

    fn cached(&self) -> Option<Token> {
        self.cache
            .read()
            .as_ref()
            .filter(|t| t.is_valid_for(self.refresh_margin))
            .cloned()
    }

    async fn fetch(&self, ctx: &ScenarioContext) -> Result<Token> {
        let mut log = ctx.diagnostics().begin("token-fetch")?;
        log.record(format_args!(
            "POST {} grant_type=client_credentials client_id={}",
            self.token_url, self.client_id
        ));

        let response = match self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let message = format!("token request failed: {}", e);
                log.fail(&message);
                return Err(Error::auth(&self.issuer, message));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let message = format!("HTTP {}: <unreadable body: {}>", status.as_u16(), e);
                log.fail(&message);
                return Err(Error::auth(&self.issuer, message));
            }
        };
        let redacted = http::truncate(
            &http::redact(&body, &[self.client_secret.as_str()]),
            MAX_BODY_IN_ERROR,
        );
        log.record(format_args!("HTTP {} {}", status.as_u16(), redacted));

        if !status.is_success() {
            let message = format!("HTTP {}: {}", status.as_u16(), redacted);
            log.fail(&message);
            return Err(Error::auth(&self.issuer, message));
        }

        let parsed: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let message = format!("undecodable token response: {}", e);
                log.fail(&message);
                return Err(Error::auth(&self.issuer, message));
            }
        };

        let access_token = match parsed.access_token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => {
                let message = match (parsed.error, parsed.error_description) {
                    (Some(error), Some(desc)) => format!("{}: {}", error, desc),
                    (Some(error), None) => error,
                    _ => "response carried no access_token".to_string(),
                };
                log.fail(&message);
                return Err(Error::auth(&self.issuer, message));
            }
        };

        let lifetime = Duration::from_secs(
            parsed
                .expires_in
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
                .min(MAX_EXPIRES_IN_SECS),
        );
        log.record(format_args!("token issued, expires in {}s", lifetime.as_secs()));
        log.succeed();

        Ok(Token::new(access_token, self.issuer.clone(), lifetime))
    }
}
