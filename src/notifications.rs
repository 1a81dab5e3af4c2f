//! Webhook delivery of probe and run events
//!
//! Each configured webhook subscribes to the event bus and POSTs matching
//! events as JSON. When a secret is configured the body is signed with
//! HMAC-SHA256 in `X-Connwatch-Signature: sha256=<hex>`. Delivery failures
//! are logged and dropped; nothing is retried.

use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::events::{Event, EventBus};
use crate::model::RunStatus;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Connwatch-Signature";
pub const EVENT_HEADER: &str = "X-Connwatch-Event";

pub struct WebhookNotifier {
    config: WebhookConfig,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("connwatch-notifications/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
        }
    }

    /// Whether this webhook wants the event
    pub fn accepts(&self, event: &Event) -> bool {
        if !self.config.events.is_empty() && !self.config.events.iter().any(|e| e == event.name()) {
            return false;
        }
        if self.config.failures_only {
            return match event {
                Event::ProbeCompleted(e) => !e.result.success,
                Event::RunCompleted(e) => e.status == RunStatus::Failed,
            };
        }
        true
    }

    /// POST one event
    pub async fn send(&self, event: &Event) -> Result<()> {
        let body = serde_json::to_string(event)?;

        let mut request = self
            .http_client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, event.name());

        if let Some(secret) = &self.config.secret {
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", sign(secret, &body)));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| anyhow!("Webhook request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("Webhook returned HTTP {}", response.status().as_u16()));
        }

        debug!(url = %self.config.url, event = event.name(), "Webhook notification sent");
        Ok(())
    }

    /// Deliver events from the bus until shutdown
    pub fn spawn(self, events: &EventBus, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            info!(url = %self.config.url, "Webhook notifier started");
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if !self.accepts(&event) {
                                continue;
                            }
                            if let Err(e) = self.send(&event).await {
                                error!(
                                    url = %self.config.url,
                                    event = event.name(),
                                    error = %e,
                                    "Failed to send notification"
                                );
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(url = %self.config.url, missed, "Webhook notifier fell behind, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(url = %self.config.url, "Webhook notifier stopped");
        })
    }
}

/// Hex HMAC-SHA256 of a payload
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Check a `sha256=<hex>` signature header
pub fn verify(secret: &str, body: &str, header: &str) -> bool {
    let Some(provided) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body.as_bytes());
    mac.verify_slice(&provided).is_ok()
}
