//! Error taxonomy and JSON error responses

use crate::reconciler::ClusterError;
use crate::registry::RegistryError;
use crate::resolver::ResolveError;
use crate::worker::ValidationError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the error code on every error response
pub const ERROR_HEADER: &str = "x-distributor-error";

/// Error codes for control and data plane failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed body, missing field or invalid identifier
    InvalidRequest,
    /// Identity already bound to a different routing key
    Conflict,
    /// Unknown routing key on a control API call
    WorkerNotFound,
    /// Cluster API unreachable, timed out or failed
    ClusterUnavailable,
    /// Host header does not address a worker
    UnresolvableHost,
    /// Host resolved but no worker is registered under it
    UnknownWorker,
    /// Failed to connect to the worker backend
    ConnectionFailed,
    /// Backend did not respond in time
    RequestTimeout,
    /// Unknown control API route
    NotFound,
    /// Internal error
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::WorkerNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ClusterUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UnresolvableHost => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownWorker => StatusCode::BAD_GATEWAY,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::WorkerNotFound => "WORKER_NOT_FOUND",
            ErrorCode::ClusterUnavailable => "CLUSTER_UNAVAILABLE",
            ErrorCode::UnresolvableHost => "UNRESOLVABLE_HOST",
            ErrorCode::UnknownWorker => "UNKNOWN_WORKER",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Failures surfaced by the control API
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Conflict(RegistryError),

    #[error("worker not found: {0}")]
    NotFound(String),

    #[error("cluster operation failed: {0}")]
    BackendUnavailable(#[from] ClusterError),

    #[error("invalid host: {0}")]
    RouteResolution(#[from] ResolveError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::InvalidRequest,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::NotFound(_) => ErrorCode::WorkerNotFound,
            Error::BackendUnavailable(_) => ErrorCode::ClusterUnavailable,
            Error::RouteResolution(_) => ErrorCode::UnresolvableHost,
        }
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e.to_string())
    }
}

impl From<RegistryError> for Error {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Invalid(v) => v.into(),
            conflict @ RegistryError::Conflict { .. } => Error::Conflict(conflict),
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Machine-readable error code
    pub code: ErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                self.error.replace('\\', "\\\\").replace('"', "\\\""),
                self.code.as_header_value()
            )
        })
    }
}

/// Build a JSON response with a fixed body
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a JSON error response with the error code header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();
    let mut response = json_response(code.status_code(), body);
    response.headers_mut().insert(
        ERROR_HEADER,
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
