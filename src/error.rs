//! Service error taxonomy.
//!
//! Every handler returns `Result<_, ServiceError>`; the server layer
//! renders the variant as its HTTP status. Store and transport
//! failures are folded into this taxonomy at the point they occur so
//! that callers never have to inspect raw status codes.

use hyper::StatusCode;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gone")]
    Gone,

    #[error("request too large: {0}")]
    TooLarge(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Gone => StatusCode::GONE,
            ServiceError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Reconstruct the error a remote node reported, so that a
    /// service-node fan-out propagates the first failed sub-request
    /// status unchanged.
    pub fn from_status(status: StatusCode, msg: &str) -> Self {
        match status {
            StatusCode::BAD_REQUEST => ServiceError::BadRequest(msg.to_string()),
            StatusCode::UNAUTHORIZED => ServiceError::Unauthorized,
            StatusCode::FORBIDDEN => ServiceError::Forbidden,
            StatusCode::NOT_FOUND => ServiceError::NotFound,
            StatusCode::CONFLICT => ServiceError::Conflict(msg.to_string()),
            StatusCode::GONE => ServiceError::Gone,
            StatusCode::PAYLOAD_TOO_LARGE => ServiceError::TooLarge(msg.to_string()),
            StatusCode::SERVICE_UNAVAILABLE => ServiceError::Unavailable(msg.to_string()),
            _ => ServiceError::Internal(format!("status {}: {}", status, msg)),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::Malformed(msg) => ServiceError::Internal(msg),
            StoreError::Transient(msg) => ServiceError::Unavailable(msg),
            StoreError::Fatal(msg) => ServiceError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::BadRequest(format!("malformed JSON: {}", err))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
