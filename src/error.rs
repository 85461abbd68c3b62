//! Error taxonomy for the control plane and its JSON rendering for the admin API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the route, credential and discovery layers
#[derive(Debug, Error)]
pub enum Error {
    /// No route is stored under the given source identity
    #[error("route not found: {0}")]
    RouteNotFound(String),

    /// No credential is stored for the given username
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// A write was rejected before touching the store
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The atomic rename found its destination already occupied
    #[error("source already exists: {0}")]
    SourceExists(String),

    /// Stored data does not follow this system's encoding
    #[error("corrupt stored data: {0}")]
    Decode(String),

    /// The backing store rejected or failed a command
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The container orchestrator could not be queried
    #[error("service discovery failed: {0}")]
    Discovery(String),

    /// A store or orchestrator call exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Password hashing or verification failed
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an exact lookup; absence is a normal answer, not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    /// Turn absence into the given error
    pub fn or_else_err(self, err: impl FnOnce() -> Error) -> Result<T> {
        match self {
            Lookup::Found(value) => Ok(value),
            Lookup::NotFound => Err(err()),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::RouteNotFound(_) | Error::UserNotFound(_) => ErrorCode::NotFound,
            Error::Validation { .. } => ErrorCode::ValidationFailed,
            Error::SourceExists(_) => ErrorCode::SourceExists,
            Error::Decode(_) => ErrorCode::CorruptData,
            Error::Store(_) => ErrorCode::StoreUnavailable,
            Error::Discovery(_) => ErrorCode::DiscoveryUnavailable,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Hashing(_) => ErrorCode::InternalError,
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        Error::Discovery(e.to_string())
    }
}

/// Error codes reported by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing or rejected credentials
    Unauthorized,
    /// Request body or query could not be parsed
    BadRequest,
    /// Route or user absent
    NotFound,
    /// Route or user rejected by validation
    ValidationFailed,
    /// Concurrent write claimed the destination identity
    SourceExists,
    /// Stored data is not in the expected encoding
    CorruptData,
    /// Redis is unreachable or failing
    StoreUnavailable,
    /// Docker is unreachable or failing
    DiscoveryUnavailable,
    /// Upstream call timed out
    Timeout,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::SourceExists => StatusCode::CONFLICT,
            ErrorCode::CorruptData => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::StoreUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::DiscoveryUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Admin-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::SourceExists => "SOURCE_EXISTS",
            ErrorCode::CorruptData => "CORRUPT_DATA",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::DiscoveryUnavailable => "DISCOVERY_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error body, wrapped in the admin API envelope
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: ErrorCode,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"code":"{}","error":"{}"}}"#,
                self.code.as_header_value(),
                self.error.replace('\"', "\\\"")
            )
        })
    }
}

/// Build a JSON error response carrying the X-Admin-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("x-admin-error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&Error> for Response<Full<Bytes>> {
    fn from(e: &Error) -> Self {
        json_error_response(e.code(), e.to_string())
    }
}
