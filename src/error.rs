use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Outcomes of storage and token operations that callers are expected to
/// recover from, plus the backend failures they are not.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("missing")]
    Missing,

    #[error("already exists")]
    Exists,

    #[error("conflict")]
    Conflict,

    #[error("token expired")]
    TokenExpired,

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Faults raised while decoding the framed wire protocol. Any of these ends
/// the connection without a protocol-level reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short")]
    MessageTooShort,

    #[error("unexpected continuation frame")]
    UnexpectedContinuation,

    #[error("unexpected message type {0:#04x}")]
    UnexpectedMessageType(u8),

    #[error("unsupported protocol version {0}")]
    BadProtocolVersion(u16),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            AppError::Store(StoreError::Missing) => {
                (StatusCode::NOT_FOUND, "not found".to_string())
            }
            AppError::Store(StoreError::Exists | StoreError::Conflict) => {
                (StatusCode::CONFLICT, "conflict".to_string())
            }
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Wire(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            AppError::Env(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Env error: {}", e),
            ),
            AppError::Io(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("IO error: {}", e),
            ),
            AppError::AddrParse(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Address parse error: {}", e),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::InvalidInput(e) => (StatusCode::BAD_REQUEST, e),
        };
        (status, msg).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::Store(StoreError::Backend(value.to_string()))
    }
}
