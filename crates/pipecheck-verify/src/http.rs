//! HTTP client construction and response-body hygiene.

use std::time::Duration;

use serde_json::Value;

use pipecheck_common::{Error, Result};

/// Response bodies embedded in errors are cut to this many characters
pub const MAX_BODY_IN_ERROR: usize = 512;

/// Placeholder written in place of secrets
pub const REDACTED: &str = "[REDACTED]";

/// JSON keys whose values are always redacted
const SENSITIVE_KEYS: &[&str] = &[
    "access_token",
    "refresh_token",
    "id_token",
    "client_secret",
    "password",
];

/// Build a client with a per-request timeout
///
/// `insecure` disables certificate verification for development clusters
/// fronted by self-signed routes.
pub fn build_client(timeout: Duration, insecure: bool) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| Error::config(format!("failed to create HTTP client: {}", e)))
}

/// Remove secrets from a response body before it is logged or embedded
///
/// JSON bodies have sensitive fields replaced wholesale; every literal in
/// `secrets` is then masked wherever it still appears.
pub fn redact(body: &str, secrets: &[&str]) -> String {
    let mut out = match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            redact_value(&mut value);
            value.to_string()
        }
        Err(_) => body.to_string(),
    };
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret, REDACTED);
    }
    out
}

fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    *v = Value::String(REDACTED.to_string());
                } else {
                    redact_value(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        _ => {}
    }
}

/// Cut `text` to at most `max` characters, marking the cut
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}... ({} bytes total)", &text[..idx], text.len()),
        None => text.to_string(),
    }
}

/// Read a response body for an error message: redacted and truncated
pub async fn error_body(response: reqwest::Response, secrets: &[&str]) -> String {
    match response.text().await {
        Ok(body) if body.is_empty() => "<empty body>".to_string(),
        Ok(body) => truncate(&redact(&body, secrets), MAX_BODY_IN_ERROR),
        Err(e) => format!("<unreadable body: {}>", e),
    }
}

/// Join a base URL and a relative path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
