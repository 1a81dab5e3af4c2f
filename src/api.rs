//! HTTP API for connection testing, connection strings and schedules
//!
//! Every route except `/health`, `/version` and `/connection-types` requires
//! the bearer token. Responses use the `{success, data?, error?}` envelope;
//! taxonomy failures carry their `ErrorCode` and its HTTP status.

use anyhow::Result;
use chrono::Utc;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::builder::{self, BuiltConnectionString};
use crate::catalog::{all_types, Category};
use crate::config::ProberConfig;
use crate::error::{code_response, json_error, json_response, ApiResponse, ErrorCode};
use crate::model::{ConnectionRecord, DraftWithSecret};
use crate::scheduler::{NewSchedule, ScheduleEngine, ScheduleError, ScheduleUpdate};
use crate::store::StoreError;
use crate::tester::{ConnectionTester, TestError, TestMode};

type ApiResult = Result<Response<Full<Bytes>>>;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub auth_token: String,
    pub max_body_bytes: usize,
    pub prober: ProberConfig,
}

/// Stored connection as returned to clients
#[derive(Debug, Serialize)]
struct ConnectionView {
    #[serde(flatten)]
    record: ConnectionRecord,
    category: Category,
    has_secret: bool,
}

impl From<ConnectionRecord> for ConnectionView {
    fn from(record: ConnectionRecord) -> Self {
        Self {
            category: record.category(),
            has_secret: record.encrypted_secret.is_some(),
            record,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TestOptions {
    connection_id: Option<String>,
    timeout_ms: Option<u64>,
}

pub struct ConnwatchApi {
    config: ApiConfig,
    tester: Arc<ConnectionTester>,
    engine: Arc<ScheduleEngine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnwatchApi {
    pub fn new(
        config: ApiConfig,
        tester: Arc<ConnectionTester>,
        engine: Arc<ScheduleEngine>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            tester,
            engine,
            shutdown_rx,
        }
    }

    /// Run the API server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "API server listening");
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, _addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { Ok::<_, hyper::Error>(api.handle(req).await) }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    fn check_auth<B>(&self, req: &Request<B>) -> bool {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| {
                auth.strip_prefix("Bearer ")
                    .unwrap_or(auth)
                    .eq(&self.config.auth_token)
            })
            .unwrap_or(false)
    }

    /// Route one request
    pub async fn handle<B>(self: Arc<Self>, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        // Unauthenticated informational routes
        match (&method, path.as_str()) {
            (&Method::GET, "/health") => {
                return json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}));
            }
            (&Method::GET, "/version") => {
                return json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "name": "connwatch",
                        "version": env!("CARGO_PKG_VERSION"),
                    }),
                );
            }
            (&Method::GET, "/connection-types") => {
                return json_response(StatusCode::OK, &ApiResponse::ok(all_types()));
            }
            _ => {}
        }

        if !self.check_auth(&req) {
            warn!(%path, "Unauthorized API request");
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let response = match (method, segments.as_slice()) {
            (Method::POST, ["test-connection"]) => self.test_connection(req).await,
            (Method::POST, ["connection-string", "build"]) => self.build_connection_string(req).await,

            (Method::POST, ["connections"]) => self.create_connection(req).await,
            (Method::GET, ["connections"]) => self.list_connections(req.uri()),
            (Method::GET, ["connections", id]) => self.get_connection(id),
            (Method::PUT, ["connections", id]) => self.update_connection(id, req).await,
            (Method::POST, ["connections", id, "test"]) => {
                let requested = query_param(req.uri(), "timeout_ms").and_then(|v| v.parse().ok());
                self.test_stored(id, self.config.prober.clamp_timeout(requested)).await
            }

            (Method::POST, ["schedules"]) => self.create_schedule(req).await,
            (Method::GET, ["schedules"]) => self.find_schedule(req.uri()),
            (Method::GET, ["schedules", id]) => Ok(schedule_result(self.engine.get(id), StatusCode::OK)),
            (Method::PUT, ["schedules", id]) => self.update_schedule(id, req).await,
            (Method::DELETE, ["schedules", id]) => Ok(match self.engine.delete(id) {
                Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok(serde_json::json!({"deleted": id}))),
                Err(e) => schedule_error_response(e),
            }),
            (Method::POST, ["schedules", id, "run-now"]) => {
                Ok(schedule_result(self.engine.run_now(id), StatusCode::ACCEPTED))
            }

            _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        };

        response.unwrap_or_else(|e| {
            error!(error = %e, "API error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {}", e))
        })
    }

    /// Read and parse a JSON body, or produce the error response
    async fn read_json<T, B>(&self, req: Request<B>) -> Result<T, Response<Full<Bytes>>>
    where
        T: DeserializeOwned,
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let body = match Limited::new(req.into_body(), self.config.max_body_bytes)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
            }
            Err(e) => {
                return Err(json_error(StatusCode::BAD_REQUEST, format!("Failed to read body: {}", e)));
            }
        };

        serde_json::from_slice(&body)
            .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)))
    }

    // ==================== Testing ====================

    async fn test_connection<B>(&self, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let value: serde_json::Value = match self.read_json(req).await {
            Ok(v) => v,
            Err(response) => return Ok(response),
        };
        let options: TestOptions = match serde_json::from_value(value.clone()) {
            Ok(o) => o,
            Err(e) => return Ok(json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e))),
        };

        let timeout = self.config.prober.clamp_timeout(options.timeout_ms);
        if let Some(id) = options.connection_id {
            return self.test_stored(&id, timeout).await;
        }

        let submitted: DraftWithSecret = match serde_json::from_value(value) {
            Ok(d) => d,
            Err(e) => return Ok(json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e))),
        };

        let outcome = self
            .tester
            .test_ad_hoc(&submitted.draft, submitted.secret.as_ref(), Some(timeout))
            .await;

        Ok(match outcome {
            Ok(result) => json_response(StatusCode::OK, &ApiResponse::ok(result)),
            Err(e) => test_error_response(e),
        })
    }

    async fn test_stored(&self, id: &str, timeout: Duration) -> ApiResult {
        Ok(match self.tester.test_record_within(id, TestMode::Manual, timeout).await {
            Ok(result) => json_response(StatusCode::OK, &ApiResponse::ok(result)),
            Err(e) => test_error_response(e),
        })
    }

    async fn build_connection_string<B>(&self, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let submitted: DraftWithSecret = match self.read_json(req).await {
            Ok(d) => d,
            Err(response) => return Ok(response),
        };

        Ok(match builder::build(&submitted.draft, submitted.secret.as_ref()) {
            Ok(target) => json_response(
                StatusCode::OK,
                &ApiResponse::ok(BuiltConnectionString::from(&target)),
            ),
            Err(e) => code_response(e.code(), e.to_string()),
        })
    }

    // ==================== Connections ====================

    async fn create_connection<B>(&self, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let submitted: DraftWithSecret = match self.read_json(req).await {
            Ok(d) => d,
            Err(response) => return Ok(response),
        };
        let DraftWithSecret { draft, secret } = submitted;

        if draft.application_id.trim().is_empty() {
            return Ok(code_response(ErrorCode::MissingField, "missing required field: application_id"));
        }

        // Reject records that could never be built
        if let Err(e) = builder::build(&draft, secret.as_ref()) {
            return Ok(code_response(e.code(), e.to_string()));
        }

        let encrypted = match secret.as_ref().map(|s| self.tester.codec().seal(s)).transpose() {
            Ok(encrypted) => encrypted,
            Err(e) => return Ok(code_response(ErrorCode::CredentialError, e.to_string())),
        };

        let record = draft.into_record(uuid::Uuid::new_v4().to_string(), encrypted, Utc::now());
        match self.tester.repository().insert_connection(&record) {
            Ok(()) => {}
            Err(StoreError::Conflict(message)) => return Ok(json_error(StatusCode::CONFLICT, message)),
            Err(e) => return Err(e.into()),
        }

        info!(
            connection_id = %record.id,
            application_id = %record.application_id,
            connection_type = %record.connection_type,
            "Connection created"
        );
        Ok(json_response(
            StatusCode::CREATED,
            &ApiResponse::ok(ConnectionView::from(record)),
        ))
    }

    /// Replace a connection's fields; the secret is kept unless a new one is given
    async fn update_connection<B>(&self, id: &str, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let submitted: DraftWithSecret = match self.read_json(req).await {
            Ok(d) => d,
            Err(response) => return Ok(response),
        };
        let DraftWithSecret { mut draft, secret } = submitted;

        let repo = self.tester.repository();
        let Some(existing) = repo.get_connection(id)? else {
            return Ok(json_error(StatusCode::NOT_FOUND, format!("connection {} not found", id)));
        };

        if draft.application_id.trim().is_empty() {
            draft.application_id = existing.application_id.clone();
        } else if draft.application_id != existing.application_id {
            return Ok(code_response(ErrorCode::InvalidFormat, "application_id cannot be changed"));
        }
        if draft.connection_type != existing.connection_type {
            return Ok(code_response(ErrorCode::InvalidFormat, "connection type cannot be changed"));
        }

        let encrypted = match &secret {
            Some(secret) => {
                if let Err(e) = builder::build(&draft, Some(secret)) {
                    return Ok(code_response(e.code(), e.to_string()));
                }
                match self.tester.codec().seal(secret) {
                    Ok(sealed) => Some(sealed),
                    Err(e) => return Ok(code_response(ErrorCode::CredentialError, e.to_string())),
                }
            }
            None => {
                let stored = match self.tester.open_secret(&existing) {
                    Ok(stored) => stored,
                    Err(e) => return Ok(code_response(ErrorCode::CredentialError, e.to_string())),
                };
                if let Err(e) = builder::build(&draft, stored.as_ref()) {
                    return Ok(code_response(e.code(), e.to_string()));
                }
                existing.encrypted_secret.clone()
            }
        };

        let mut record = draft.into_record(existing.id.clone(), encrypted, Utc::now());
        record.created_at = existing.created_at;
        match repo.update_connection(&record) {
            Ok(()) => {}
            Err(e @ StoreError::NotFound { .. }) => {
                return Ok(json_error(StatusCode::NOT_FOUND, e.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            connection_id = %record.id,
            application_id = %record.application_id,
            secret_replaced = secret.is_some(),
            "Connection updated"
        );
        self.get_connection(id)
    }

    fn list_connections(&self, uri: &Uri) -> ApiResult {
        let Some(application_id) = query_param(uri, "application_id") else {
            return Ok(code_response(ErrorCode::MissingField, "missing required field: application_id"));
        };

        let views: Vec<ConnectionView> = self
            .tester
            .repository()
            .list_connections(&application_id)?
            .into_iter()
            .filter(|c| c.application_id == application_id)
            .map(ConnectionView::from)
            .collect();
        Ok(json_response(StatusCode::OK, &ApiResponse::ok(views)))
    }

    fn get_connection(&self, id: &str) -> ApiResult {
        Ok(match self.tester.repository().get_connection(id)? {
            Some(record) => json_response(StatusCode::OK, &ApiResponse::ok(ConnectionView::from(record))),
            None => json_error(StatusCode::NOT_FOUND, format!("connection {} not found", id)),
        })
    }

    // ==================== Schedules ====================

    async fn create_schedule<B>(&self, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let input: NewSchedule = match self.read_json(req).await {
            Ok(i) => i,
            Err(response) => return Ok(response),
        };
        if input.application_id.trim().is_empty() {
            return Ok(code_response(ErrorCode::MissingField, "missing required field: application_id"));
        }
        Ok(schedule_result(self.engine.create(input), StatusCode::CREATED))
    }

    fn find_schedule(&self, uri: &Uri) -> ApiResult {
        let Some(application_id) = query_param(uri, "application_id") else {
            return Ok(code_response(ErrorCode::MissingField, "missing required field: application_id"));
        };
        Ok(match self.engine.get_for_application(&application_id) {
            Ok(Some(schedule)) => json_response(StatusCode::OK, &ApiResponse::ok(schedule)),
            Ok(None) => json_error(
                StatusCode::NOT_FOUND,
                format!("application {} has no schedule", application_id),
            ),
            Err(e) => schedule_error_response(e),
        })
    }

    async fn update_schedule<B>(&self, id: &str, req: Request<B>) -> ApiResult
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let update: ScheduleUpdate = match self.read_json(req).await {
            Ok(u) => u,
            Err(response) => return Ok(response),
        };
        Ok(schedule_result(self.engine.update(id, update), StatusCode::OK))
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn test_error_response(err: TestError) -> Response<Full<Bytes>> {
    if let Some(code) = err.code() {
        return code_response(code, err.to_string());
    }
    match err {
        TestError::NotFound(_) | TestError::Store(StoreError::NotFound { .. }) => {
            json_error(StatusCode::NOT_FOUND, err.to_string())
        }
        other => {
            error!(error = %other, "Connection test failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn schedule_result(
    result: Result<crate::model::ScheduleRecord, ScheduleError>,
    status: StatusCode,
) -> Response<Full<Bytes>> {
    match result {
        Ok(schedule) => json_response(status, &ApiResponse::ok(schedule)),
        Err(e) => schedule_error_response(e),
    }
}

fn schedule_error_response(err: ScheduleError) -> Response<Full<Bytes>> {
    match &err {
        ScheduleError::InvalidCron(_) => code_response(ErrorCode::InvalidFormat, err.to_string()),
        ScheduleError::NotFound(_) | ScheduleError::Store(StoreError::NotFound { .. }) => {
            json_error(StatusCode::NOT_FOUND, err.to_string())
        }
        ScheduleError::Conflict(_) | ScheduleError::AlreadyRunning(_) => {
            json_error(StatusCode::CONFLICT, err.to_string())
        }
        ScheduleError::ShuttingDown => json_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        ScheduleError::Store(_) => {
            error!(error = %err, "Schedule storage failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
