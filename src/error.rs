//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Domain errors surfaced by the lifecycle service and the auth layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unauthorized")]
    Unauthorized,
    #[error("instance not found")]
    NotFound,
    #[error("max pod count reached")]
    GlobalQuotaExceeded,
    #[error("max instances per user reached")]
    UserQuotaExceeded,
    #[error("max instances for this type reached")]
    TypeQuotaExceeded,
    #[error("unknown instance type: {0}")]
    UnknownType(String),
    #[error("persistent storage is disabled")]
    PersistenceDisabled,
    /// Orchestrator I/O failure. Retried by the next reconcile or clean pass
    /// when it happens in a background loop; surfaced to the caller when it
    /// happens during an explicit create or delete.
    #[error(transparent)]
    Orchestrator(#[from] anyhow::Error),
}

impl Error {
    /// Map a domain error to its wire-level error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Unauthorized => ErrorCode::Unauthorized,
            Error::NotFound => ErrorCode::NotFound,
            Error::GlobalQuotaExceeded => ErrorCode::GlobalQuotaExceeded,
            Error::UserQuotaExceeded => ErrorCode::UserQuotaExceeded,
            Error::TypeQuotaExceeded => ErrorCode::TypeQuotaExceeded,
            Error::UnknownType(_) => ErrorCode::UnknownType,
            Error::PersistenceDisabled => ErrorCode::PersistenceDisabled,
            Error::Orchestrator(_) => ErrorCode::InternalError,
        }
    }
}

/// Error codes carried in JSON error bodies and the X-Hakoniwa-Error header
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No or invalid session
    Unauthorized,
    /// Instance not in the registry, or not owned by the requester
    NotFound,
    /// Global pod quota reached
    GlobalQuotaExceeded,
    /// Per-user instance quota reached
    UserQuotaExceeded,
    /// Per-user-per-type instance quota reached
    TypeQuotaExceeded,
    /// Requested instance type is not in the catalog
    UnknownType,
    /// Persistent storage requested while globally disabled
    PersistenceDisabled,
    /// Malformed request
    BadRequest,
    /// Backend pod is unreachable
    BadGateway,
    /// Internal gateway error
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::GlobalQuotaExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UserQuotaExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::TypeQuotaExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UnknownType => StatusCode::BAD_REQUEST,
            ErrorCode::PersistenceDisabled => StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Hakoniwa-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::GlobalQuotaExceeded => "GLOBAL_QUOTA_EXCEEDED",
            ErrorCode::UserQuotaExceeded => "USER_QUOTA_EXCEEDED",
            ErrorCode::TypeQuotaExceeded => "TYPE_QUOTA_EXCEEDED",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::PersistenceDisabled => "PERSISTENCE_DISABLED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::BadGateway => "BAD_GATEWAY",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// The response body type used across the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Box a byte payload into the shared response body type
pub fn full_body(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with an X-Hakoniwa-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Hakoniwa-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Map a domain error to its JSON error response
pub fn domain_error_response(err: &Error) -> Response<GatewayBody> {
    json_error_response(err.code(), err.to_string())
}
