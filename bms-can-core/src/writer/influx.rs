//! HTTP store sink
//!
//! Posts line protocol bodies to an InfluxDB 3 style write endpoint:
//!
//! ```text
//! POST {endpoint}/api/v3/write_lp?db={database}&precision=nanosecond
//! Authorization: Bearer <token>
//! ```
//!
//! Status mapping: 2xx is an acknowledgement. Client errors that will fail the
//! same way on every retry (bad request, auth, missing database, payload too
//! large, unprocessable) are rejections. Timeouts, throttling, server errors
//! and transport failures are treated as the store being unreachable.

use super::StoreSink;
use crate::error::WriteError;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Write endpoint path, relative to the configured base URL
pub const WRITE_PATH: &str = "/api/v3/write_lp";

/// Store connection settings (the credential is supplied separately)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the store
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Target database
    pub database: String,

    /// Per-request timeout (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8181".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl StoreConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            endpoint: default_endpoint(),
            database: database.into(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    /// Full write URL without the query string
    pub fn write_url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), WRITE_PATH)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Bearer credential; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Read a credential from an environment variable; None if unset or blank
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Blocking HTTP sink for the store's write API
pub struct HttpStoreSink {
    client: Client,
    url: String,
    database: String,
    credential: Credential,
}

impl HttpStoreSink {
    /// Build the HTTP client; must not be called from inside an async runtime
    pub fn new(config: &StoreConfig, credential: Credential) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("bms-can-logger/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: config.write_url(),
            database: config.database.clone(),
            credential,
        })
    }
}

impl StoreSink for HttpStoreSink {
    fn write(&mut self, body: &str) -> Result<(), WriteError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[("db", self.database.as_str()), ("precision", "nanosecond")])
            .bearer_auth(self.credential.expose())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body.to_string())
            .send()
            .map_err(|e| WriteError::Unreachable(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().unwrap_or_default();
        Err(classify_status(status, &text))
    }

    fn describe(&self) -> String {
        format!("{} (db {})", self.url, self.database)
    }
}

/// Error body shapes returned by the write API
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success response to a write error
pub fn classify_status(status: StatusCode, body: &str) -> WriteError {
    let detail = error_detail(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string()
    });
    let reason = format!("HTTP {}: {}", status.as_u16(), detail);

    match status {
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => WriteError::Rejected(reason),
        _ => WriteError::Unreachable(reason),
    }
}

fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.or(parsed.message),
        Err(_) => Some(body.chars().take(512).collect()),
    }
}
