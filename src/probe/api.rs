//! REST, GraphQL and WebSocket endpoint probes

use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::time::Duration;

use super::{classify_reqwest, classify_status, ProbeError, ProbeStrategy};
use crate::builder::{ApiAuth, ApiTarget, ConnectionTarget};
use crate::catalog::{Category, ConnectionType};
use crate::error::ErrorCode;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const GRAPHQL_PING: &str = r#"{"query":"{ __typename }"}"#;

pub struct ApiProbe {
    client: reqwest::Client,
    /// WebSocket upgrades need a connection reqwest won't pool or negotiate to HTTP/2
    upgrade_client: reqwest::Client,
}

impl ApiProbe {
    pub fn new(client: reqwest::Client) -> Self {
        let upgrade_client = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_else(|_| client.clone());
        Self {
            client,
            upgrade_client,
        }
    }

    async fn probe_rest(&self, target: &ApiTarget, timeout: Duration) -> Result<String, ProbeError> {
        let request = with_auth(self.client.get(&target.url), &target.auth).timeout(timeout);
        let response = request.send().await.map_err(|e| classify_reqwest(&e))?;
        let status = response.status();
        classify_status(status, "endpoint")?;
        Ok(format!("GET {} returned HTTP {}", target.url, status.as_u16()))
    }

    async fn probe_graphql(&self, target: &ApiTarget, timeout: Duration) -> Result<String, ProbeError> {
        let request = self
            .client
            .post(&target.url)
            .header("Content-Type", "application/json")
            .body(GRAPHQL_PING)
            .timeout(timeout);
        let response = with_auth(request, &target.auth)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;
        classify_status(response.status(), "GraphQL endpoint")?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| ProbeError::unexpected("GraphQL endpoint did not return JSON"))?;

        if body.pointer("/data/__typename").is_some() {
            return Ok(format!("GraphQL endpoint {} answered __typename", target.url));
        }
        match body.get("errors").and_then(|e| e.get(0)).and_then(|e| e.get("message")) {
            Some(message) => Err(ProbeError::unexpected(format!(
                "GraphQL error: {}",
                message.as_str().unwrap_or("unknown")
            ))),
            None => Err(ProbeError::unexpected("GraphQL response has no data")),
        }
    }

    async fn probe_websocket(&self, target: &ApiTarget, timeout: Duration) -> Result<String, ProbeError> {
        // The upgrade request itself travels over http(s)
        let http_url = if let Some(rest) = target.url.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = target.url.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            return Err(ProbeError::new(ErrorCode::InvalidFormat, "WebSocket URL must use ws or wss"));
        };

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let key = base64::engine::general_purpose::STANDARD.encode(nonce);

        let request = self
            .upgrade_client
            .get(&http_url)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", &key)
            .timeout(timeout);
        let response = with_auth(request, &target.auth)
            .send()
            .await
            .map_err(|e| classify_reqwest(&e))?;

        let status = response.status();
        if status != reqwest::StatusCode::SWITCHING_PROTOCOLS {
            classify_status(status, "WebSocket endpoint")?;
            return Err(ProbeError::handshake(format!(
                "WebSocket upgrade refused with HTTP {}",
                status.as_u16()
            )));
        }

        let accept = response
            .headers()
            .get("Sec-WebSocket-Accept")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if accept != websocket_accept(&key) {
            return Err(ProbeError::handshake("invalid Sec-WebSocket-Accept in upgrade response"));
        }

        Ok(format!("WebSocket upgrade accepted by {}", target.url))
    }
}

#[async_trait]
impl ProbeStrategy for ApiProbe {
    fn category(&self) -> Category {
        Category::Api
    }

    async fn probe(&self, target: &ConnectionTarget, timeout: Duration) -> Result<String, ProbeError> {
        let ConnectionTarget::Api(target) = target else {
            return Err(ProbeError::new(
                ErrorCode::UnsupportedOperation,
                "api probe received a foreign target",
            ));
        };

        match target.protocol {
            ConnectionType::GraphQl => self.probe_graphql(target, timeout).await,
            ConnectionType::WebSocket => self.probe_websocket(target, timeout).await,
            _ => self.probe_rest(target, timeout).await,
        }
    }
}

fn with_auth(request: reqwest::RequestBuilder, auth: &ApiAuth) -> reqwest::RequestBuilder {
    match auth {
        ApiAuth::None => request,
        ApiAuth::Bearer(key) => request.bearer_auth(key.expose()),
        ApiAuth::Header { name, value } => request.header(name.as_str(), value.expose()),
    }
}

/// Expected `Sec-WebSocket-Accept` for a client key
fn websocket_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionDraft;
    use crate::probe::http_client;
    use crate::secrets::Secret;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server; `respond` builds the raw response from the request text
    async fn serve_once<F>(respond: F) -> u16
    where
        F: FnOnce(&str) -> String + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = respond(&request);
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        port
    }

    fn target(connection_type: ConnectionType, url: String, key: Option<&str>) -> ConnectionTarget {
        let mut draft = ConnectionDraft::new("app-1", connection_type);
        draft.server = Some(url);
        let secret = key.map(|k| Secret::ApiKey(k.to_string()));
        crate::builder::build(&draft, secret.as_ref()).unwrap()
    }

    fn header_value<'a>(request: &'a str, name: &str) -> Option<&'a str> {
        request.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    #[test]
    fn test_websocket_accept_rfc_example() {
        // RFC 6455 section 1.3
        assert_eq!(
            websocket_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn test_rest_success_sends_bearer() {
        let port = serve_once(|request| {
            if header_value(request, "authorization") == Some("Bearer k-1") {
                "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string()
            } else {
                "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n".to_string()
            }
        })
        .await;

        let probe = ApiProbe::new(http_client());
        let message = probe
            .probe(
                &target(ConnectionType::RestApi, format!("http://127.0.0.1:{}", port), Some("k-1")),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(message.contains("HTTP 200"));
    }

    #[tokio::test]
    async fn test_rest_unauthorized_is_auth_rejected() {
        let port = serve_once(|_| "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n".to_string()).await;
        let err = ApiProbe::new(http_client())
            .probe(
                &target(ConnectionType::RestApi, format!("http://127.0.0.1:{}", port), Some("bad")),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRejected);
    }

    #[tokio::test]
    async fn test_graphql_typename() {
        let port = serve_once(|_| {
            let body = r#"{"data":{"__typename":"Query"}}"#;
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
        })
        .await;

        let message = ApiProbe::new(http_client())
            .probe(
                &target(ConnectionType::GraphQl, format!("http://127.0.0.1:{}/graphql", port), None),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(message.contains("__typename"));
    }

    #[tokio::test]
    async fn test_websocket_upgrade_validates_accept() {
        let port = serve_once(|request| {
            let key = header_value(request, "sec-websocket-key").unwrap_or_default();
            format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                websocket_accept(key)
            )
        })
        .await;

        let message = ApiProbe::new(http_client())
            .probe(
                &target(ConnectionType::WebSocket, format!("ws://127.0.0.1:{}/live", port), None),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(message.contains("upgrade accepted"));
    }

    #[tokio::test]
    async fn test_websocket_wrong_accept_is_handshake_failure() {
        let port = serve_once(|_| {
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bogus\r\n\r\n"
                .to_string()
        })
        .await;

        let err = ApiProbe::new(http_client())
            .probe(
                &target(ConnectionType::WebSocket, format!("ws://127.0.0.1:{}/live", port), None),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandshakeFailed);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = ApiProbe::new(http_client())
            .probe(
                &target(ConnectionType::RestApi, format!("http://127.0.0.1:{}", port), None),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unreachable);
    }
}
