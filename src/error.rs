//! Error codes and JSON error responses shared by the builder, prober and API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Machine-readable outcome codes surfaced to callers
///
/// The set is closed and small on purpose: callers branch on it without
/// knowing anything about the target technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A required structural field was absent for the record's category
    MissingField,
    /// A custom override string failed basic syntactic validation
    InvalidFormat,
    /// DNS or network-level failure before any handshake
    Unreachable,
    /// Target reachable but credentials rejected
    AuthRejected,
    /// Operation did not complete within the bound
    Timeout,
    /// Category has no automated probe
    UnsupportedOperation,
    /// Stored secret could not be decrypted
    CredentialError,
    /// TLS or wire-protocol negotiation failed after the socket opened
    HandshakeFailed,
    /// Target answered, but not the way a healthy service does
    UnexpectedResponse,
}

impl ErrorCode {
    /// Get the HTTP status used when this code is returned synchronously
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::MissingField => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidFormat => StatusCode::BAD_REQUEST,
            ErrorCode::CredentialError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::UnsupportedOperation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Unreachable => StatusCode::BAD_GATEWAY,
            ErrorCode::AuthRejected => StatusCode::BAD_GATEWAY,
            ErrorCode::HandshakeFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::UnexpectedResponse => StatusCode::BAD_GATEWAY,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingField => "MissingField",
            ErrorCode::InvalidFormat => "InvalidFormat",
            ErrorCode::Unreachable => "Unreachable",
            ErrorCode::AuthRejected => "AuthRejected",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::UnsupportedOperation => "UnsupportedOperation",
            ErrorCode::CredentialError => "CredentialError",
            ErrorCode::HandshakeFailed => "HandshakeFailed",
            ErrorCode::UnexpectedResponse => "UnexpectedResponse",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Taxonomy code, or a plain string for transport-level failures
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// JSON envelope used by every API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Serialize a value into a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(body).unwrap_or_else(|e| {
        format!(
            r#"{{"success":false,"error":{{"code":"internal","message":"{}"}}}}"#,
            e.to_string().replace('"', "\\\"")
        )
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Build an error envelope response for a taxonomy code
pub fn code_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        code.status_code(),
        &ApiResponse::error(code.as_str(), message),
    )
}

/// Build an error envelope response for a transport-level failure
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let code = status
        .canonical_reason()
        .unwrap_or("error")
        .to_lowercase()
        .replace(' ', "_");
    json_response(status, &ApiResponse::error(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::MissingField.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::InvalidFormat.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::UnsupportedOperation.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ErrorCode::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorCode::Unreachable.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_code_serializes_as_name() {
        let json = serde_json::to_string(&ErrorCode::AuthRejected).unwrap();
        assert_eq!(json, "\"AuthRejected\"");
        let parsed: ErrorCode = serde_json::from_str("\"Timeout\"").unwrap();
        assert_eq!(parsed, ErrorCode::Timeout);
    }

    #[test]
    fn test_code_response_envelope() {
        let response = code_response(ErrorCode::MissingField, "server is required");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_error_envelope_json() {
        let body = ApiResponse::error("not_found", "schedule not found");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"not_found\""));
        assert!(!json.contains("\"data\""));
    }
}
