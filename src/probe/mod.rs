//! Connectivity prober
//!
//! One strategy per category behind [`ProbeStrategy`]. The [`Prober`] owns the
//! registry, enforces the timeout around every strategy and normalizes the
//! outcome into a [`ProbeResult`].

mod api;
mod cloud;
#[cfg(test)]
pub(crate) mod fake;
mod nosql;
mod relational;
mod saas;
pub mod sigv4;
pub mod tls;

pub use api::ApiProbe;
pub use cloud::CloudProbe;
pub use nosql::NoSqlProbe;
pub use relational::RelationalProbe;
pub use saas::SaasProbe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::builder::ConnectionTarget;
use crate::catalog::{Category, HttpMethod};
use crate::error::ErrorCode;

type HmacSha256 = Hmac<Sha256>;

/// Default bound on a single probe
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalized probe outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub message: String,
    pub tested_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn connected(latency: Duration, message: impl Into<String>) -> Self {
        Self {
            success: true,
            latency_ms: latency.as_millis() as u64,
            error_code: None,
            message: message.into(),
            tested_at: Utc::now(),
        }
    }

    pub fn failed(code: ErrorCode, latency: Duration, message: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: latency.as_millis() as u64,
            error_code: Some(code),
            message: message.into(),
            tested_at: Utc::now(),
        }
    }

    /// One-line summary stored as the connection's last test result
    pub fn summary(&self) -> String {
        match self.error_code {
            None => format!("Connected in {}ms: {}", self.latency_ms, self.message),
            Some(code) => format!("{} after {}ms: {}", code, self.latency_ms, self.message),
        }
    }
}

/// Classified strategy failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProbeError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProbeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unreachable, message)
    }

    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthRejected, message)
    }

    pub fn handshake(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandshakeFailed, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnexpectedResponse, message)
    }

    /// Map a socket-level error
    pub fn from_io(context: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::new(ErrorCode::Timeout, format!("{}: {}", context, err)),
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::InvalidData => Self::handshake(format!("{}: {}", context, err)),
            _ => Self::unreachable(format!("{}: {}", context, err)),
        }
    }
}

/// Probe for one category
///
/// Implementations perform the narrowest read-only operation that proves
/// reachability and authentication. The returned message describes what was
/// verified. The caller applies the timeout; `timeout` is passed so nested
/// clients can size their own limits.
#[async_trait]
pub trait ProbeStrategy: Send + Sync {
    fn category(&self) -> Category;

    async fn probe(&self, target: &ConnectionTarget, timeout: Duration) -> Result<String, ProbeError>;
}

/// Category registry plus timeout enforcement
#[derive(Clone)]
pub struct Prober {
    strategies: HashMap<Category, Arc<dyn ProbeStrategy>>,
    timeout: Duration,
}

impl Prober {
    /// Prober with the built-in strategy for every probe-able category
    pub fn new(timeout: Duration) -> Self {
        let http = http_client();
        Self::empty(timeout)
            .with_strategy(Arc::new(RelationalProbe))
            .with_strategy(Arc::new(NoSqlProbe::default()))
            .with_strategy(Arc::new(ApiProbe::new(http.clone())))
            .with_strategy(Arc::new(CloudProbe::new(http.clone())))
            .with_strategy(Arc::new(SaasProbe::new(http)))
    }

    /// Prober with no strategies registered
    pub fn empty(timeout: Duration) -> Self {
        Self {
            strategies: HashMap::new(),
            timeout,
        }
    }

    /// Register or replace the strategy for its category
    pub fn with_strategy(mut self, strategy: Arc<dyn ProbeStrategy>) -> Self {
        self.strategies.insert(strategy.category(), strategy);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn probe(&self, target: &ConnectionTarget) -> ProbeResult {
        self.probe_with_timeout(target, self.timeout).await
    }

    /// Run the category's strategy, bounded by `timeout`
    ///
    /// Dropping the strategy future on timeout closes its sockets.
    pub async fn probe_with_timeout(&self, target: &ConnectionTarget, timeout: Duration) -> ProbeResult {
        let start = Instant::now();

        if !target.is_probe_eligible() {
            return ProbeResult::failed(
                ErrorCode::UnsupportedOperation,
                Duration::ZERO,
                "custom connection strings are not tested automatically",
            );
        }

        let Some(strategy) = self.strategies.get(&target.category()) else {
            return ProbeResult::failed(
                ErrorCode::UnsupportedOperation,
                Duration::ZERO,
                format!("no probe available for {} connections", target.category().as_str()),
            );
        };

        let outcome = tokio::time::timeout(timeout, strategy.probe(target, timeout)).await;
        let latency = start.elapsed();

        let result = match outcome {
            Ok(Ok(message)) => ProbeResult::connected(latency, message),
            Ok(Err(e)) => ProbeResult::failed(e.code, latency, e.message),
            Err(_) => ProbeResult::failed(
                ErrorCode::Timeout,
                latency,
                format!("no response within {}ms", timeout.as_millis()),
            ),
        };

        debug!(
            connection_type = %target.connection_type(),
            address = %target.address(),
            success = result.success,
            latency_ms = result.latency_ms,
            "Probe finished"
        );

        scrub(result, target)
    }
}

/// Remove secret values that a driver may have echoed into the message
fn scrub(mut result: ProbeResult, target: &ConnectionTarget) -> ProbeResult {
    for secret in target.secret_values() {
        if !secret.is_empty() && result.message.contains(secret) {
            result.message = result.message.replace(secret, "***");
        }
    }
    result
}

/// Shared HTTP client used by the HTTP-based strategies
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("connwatch/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(3))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Open a TCP connection, mapping failures into the taxonomy
pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ProbeError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProbeError::from_io(&format!("connect to {}:{}", host, port), &e))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

pub(crate) fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
    }
}

/// Map a transport failure from reqwest
pub(crate) fn classify_reqwest(err: &reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::new(ErrorCode::Timeout, "request timed out");
    }

    let detail = error_chain(err);
    let lower = detail.to_ascii_lowercase();
    if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake") {
        ProbeError::handshake(detail)
    } else if err.is_connect() {
        ProbeError::unreachable(detail)
    } else if err.is_decode() || err.is_body() {
        ProbeError::unexpected(detail)
    } else {
        ProbeError::unreachable(detail)
    }
}

/// Map an HTTP status from a read-only request
pub(crate) fn classify_status(status: reqwest::StatusCode, what: &str) -> Result<(), ProbeError> {
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(ProbeError::auth_rejected(format!("{} rejected the credentials (HTTP {})", what, status.as_u16())))
    } else {
        Err(ProbeError::unexpected(format!("{} answered HTTP {}", what, status.as_u16())))
    }
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
