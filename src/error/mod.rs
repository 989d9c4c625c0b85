use actix_web::{HttpResponse, error::ResponseError, http::StatusCode};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug, Clone)]
pub enum GatewayError {
    InvalidInput(String),
    PathwayNotFound(String),
    RequestNotFound(String),
    PromptTooLarge(String),
    ChunkTooLarge(String),
    Upstream(String),
    ParseRejected(String),
    Canceled(String),
    TimedOut(String),
    Storage(String),
    Bus(String),
    Callback(String),
    Unauthorized(String),
    LegacyPathway(String),
    Configuration(String),
    Serialization(String),
    Internal(String),
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    error_type: String,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            GatewayError::PathwayNotFound(e) => write!(f, "Pathway not found: {}", e),
            GatewayError::RequestNotFound(e) => write!(f, "Request not found: {}", e),
            GatewayError::PromptTooLarge(e) => write!(f, "Prompt too large: {}", e),
            GatewayError::ChunkTooLarge(e) => write!(f, "Chunk too large: {}", e),
            GatewayError::Upstream(e) => write!(f, "Upstream model error: {}", e),
            GatewayError::ParseRejected(e) => write!(f, "Response parsing rejected: {}", e),
            GatewayError::Canceled(e) => write!(f, "Request canceled: {}", e),
            GatewayError::TimedOut(e) => write!(f, "Request timed out: {}", e),
            GatewayError::Storage(e) => write!(f, "Storage error: {}", e),
            GatewayError::Bus(e) => write!(f, "Bus error: {}", e),
            GatewayError::Callback(e) => write!(f, "Callback error: {}", e),
            GatewayError::Unauthorized(e) => write!(f, "Unauthorized: {}", e),
            GatewayError::LegacyPathway(e) => write!(f, "Legacy pathway: {}", e),
            GatewayError::Configuration(e) => write!(f, "Configuration error: {}", e),
            GatewayError::Serialization(e) => write!(f, "Serialization error: {}", e),
            GatewayError::Internal(e) => write!(f, "Internal error: {}", e),
        }
    }
}

impl StdError for GatewayError {}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        let (status_code, error_type) = match self {
            GatewayError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            GatewayError::PathwayNotFound(_) => (StatusCode::NOT_FOUND, "pathway_not_found"),
            GatewayError::RequestNotFound(_) => (StatusCode::NOT_FOUND, "request_not_found"),
            GatewayError::PromptTooLarge(_) => (StatusCode::BAD_REQUEST, "prompt_too_large"),
            GatewayError::ChunkTooLarge(_) => (StatusCode::BAD_REQUEST, "chunk_too_large"),
            GatewayError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            GatewayError::ParseRejected(_) => (StatusCode::BAD_GATEWAY, "parse_rejected"),
            GatewayError::Canceled(_) => (StatusCode::CONFLICT, "request_canceled"),
            GatewayError::TimedOut(_) => (StatusCode::GATEWAY_TIMEOUT, "request_timed_out"),
            GatewayError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            GatewayError::Bus(_) => (StatusCode::INTERNAL_SERVER_ERROR, "bus_error"),
            GatewayError::Callback(_) => (StatusCode::REQUEST_TIMEOUT, "callback_error"),
            GatewayError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::LegacyPathway(_) => (StatusCode::CONFLICT, "legacy_pathway"),
            GatewayError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            GatewayError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: self.to_string(),
            error_type: error_type.to_string(),
        };

        HttpResponse::build(status_code).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::PathwayNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PromptTooLarge(_) => StatusCode::BAD_REQUEST,
            GatewayError::ChunkTooLarge(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ParseRejected(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Canceled(_) => StatusCode::CONFLICT,
            GatewayError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Bus(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Callback(_) => StatusCode::REQUEST_TIMEOUT,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::LegacyPathway(_) => StatusCode::CONFLICT,
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl GatewayError {
    /// Returns true for caller-side errors that must not be retried
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidInput(_)
                | GatewayError::PathwayNotFound(_)
                | GatewayError::PromptTooLarge(_)
                | GatewayError::ChunkTooLarge(_)
                | GatewayError::Unauthorized(_)
                | GatewayError::LegacyPathway(_)
        )
    }

    /// Returns true when the error represents cooperative cancellation,
    /// which surfaces as a terminal status rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, GatewayError::Canceled(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        GatewayError::Serialization(format!(
            "JSON deserialization/serialization error: {}",
            error
        ))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(error: std::io::Error) -> Self {
        GatewayError::Storage(format!("I/O error: {}", error))
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(error: redis::RedisError) -> Self {
        GatewayError::Storage(format!("Redis error: {}", error))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        GatewayError::Upstream(error.to_string())
    }
}

// Define GatewayResult type alias for Result<T, GatewayError>
pub type GatewayResult<T> = Result<T, GatewayError>;
