use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Everything that can end or interrupt a block transfer.
///
/// `ExpiredBlock` and `Network` are recovered inside the controller and only
/// reach the caller when the retry budget is spent or no network handler is
/// installed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("block expired: {0}")]
    ExpiredBlock(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected data: {0}")]
    UnexpectedData(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transfer already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, TransferError::ExpiredBlock(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, TransferError::Network(_))
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let code = match &self {
            TransferError::NotFound(_) | TransferError::ExpiredBlock(_) => StatusCode::NOT_FOUND,
            TransferError::Network(_) | TransferError::Transport(_) => StatusCode::BAD_GATEWAY,
            TransferError::Integrity(_) | TransferError::UnexpectedData(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TransferError::Cancelled
            | TransferError::AlreadyStarted
            | TransferError::InvalidConfig(_)
            | TransferError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, self.to_string()).into_response()
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
