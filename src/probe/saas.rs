//! SaaS and warehouse API probes, driven by the catalog's probe request

use async_trait::async_trait;
use std::time::Duration;

use super::{classify_reqwest, classify_status, reqwest_method, ProbeError, ProbeStrategy};
use crate::builder::{ConnectionTarget, SaasCredential};
use crate::catalog::Category;
use crate::error::ErrorCode;

pub struct SaasProbe {
    client: reqwest::Client,
}

impl SaasProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProbeStrategy for SaasProbe {
    fn category(&self) -> Category {
        Category::Saas
    }

    async fn probe(&self, target: &ConnectionTarget, timeout: Duration) -> Result<String, ProbeError> {
        let ConnectionTarget::Saas(target) = target else {
            return Err(ProbeError::new(
                ErrorCode::UnsupportedOperation,
                "saas probe received a foreign target",
            ));
        };

        let mut request = self
            .client
            .request(reqwest_method(target.probe.method), &target.probe_url)
            .timeout(timeout);
        request = match &target.credential {
            SaasCredential::Bearer(token) => request.bearer_auth(token.expose()),
            SaasCredential::Basic { username, password } => {
                request.basic_auth(username, Some(password.expose()))
            }
        };
        for (name, value) in target.probe.headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = target.probe.body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| classify_reqwest(&e))?;
        let status = response.status();
        classify_status(status, target.connection_type.as_str())?;

        Ok(format!(
            "{} {} returned HTTP {}",
            reqwest_method(target.probe.method),
            target.probe_url,
            status.as_u16()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConnectionType;
    use crate::model::ConnectionDraft;
    use crate::probe::fake::serve;
    use crate::probe::http_client;
    use crate::secrets::Secret;

    #[tokio::test]
    async fn test_bearer_product_probe() {
        let port = serve(|req| {
            if req.path == "/services/data/" && req.header("authorization") == Some("Bearer sf-token") {
                (200, "[]".to_string())
            } else {
                (401, r#"[{"errorCode":"INVALID_SESSION_ID"}]"#.to_string())
            }
        })
        .await;

        let mut draft = ConnectionDraft::new("app-1", ConnectionType::Salesforce);
        draft.server = Some(format!("http://127.0.0.1:{}", port));

        let good = crate::builder::build(&draft, Some(&Secret::ApiKey("sf-token".to_string()))).unwrap();
        let message = SaasProbe::new(http_client())
            .probe(&good, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(message.contains("HTTP 200"));

        let bad = crate::builder::build(&draft, Some(&Secret::ApiKey("stale".to_string()))).unwrap();
        let err = SaasProbe::new(http_client())
            .probe(&bad, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRejected);
    }

    #[tokio::test]
    async fn test_basic_auth_product_probe() {
        let port = serve(|req| {
            // integration:pw
            if req.header("authorization") == Some("Basic aW50ZWdyYXRpb246cHc=") {
                (200, r#"{"result":[]}"#.to_string())
            } else {
                (401, "{}".to_string())
            }
        })
        .await;

        let mut draft = ConnectionDraft::new("app-1", ConnectionType::ServiceNow);
        draft.server = Some(format!("http://127.0.0.1:{}", port));
        draft.username = Some("integration".to_string());
        let target = crate::builder::build(&draft, Some(&Secret::Password("pw".to_string()))).unwrap();

        assert!(SaasProbe::new(http_client())
            .probe(&target, Duration::from_secs(2))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_warehouse_statement_probe_posts_body() {
        let port = serve(|req| {
            if req.method == "POST"
                && req.body.contains("SELECT 1")
                && req.header("x-snowflake-authorization-token-type") == Some("OAUTH")
            {
                (200, r#"{"code":"090001"}"#.to_string())
            } else {
                (500, "{}".to_string())
            }
        })
        .await;

        let mut draft = ConnectionDraft::new("app-1", ConnectionType::Snowflake);
        draft.server = Some(format!("http://127.0.0.1:{}", port));
        let target = crate::builder::build(&draft, Some(&Secret::ApiKey("oauth".to_string()))).unwrap();

        assert!(SaasProbe::new(http_client())
            .probe(&target, Duration::from_secs(2))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_server_error_is_unexpected_response() {
        let port = serve(|_| (503, "{}".to_string())).await;

        let mut draft = ConnectionDraft::new("app-1", ConnectionType::Databricks);
        draft.server = Some(format!("http://127.0.0.1:{}", port));
        let target = crate::builder::build(&draft, Some(&Secret::ApiKey("dapi".to_string()))).unwrap();

        let err = SaasProbe::new(http_client())
            .probe(&target, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnexpectedResponse);
    }
}
