//! Transport-level outcome of a single request.

/// Errors produced while exchanging one request/response pair.
///
/// Communication faults (`Timeout`, `ConnectionLost`) say nothing about
/// whether the remote applied the request; application rejections
/// (`Rejected`) are definite answers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("rejected by remote ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl RpcError {
    /// Returns `true` for faults after which the outcome of the request is
    /// unknown and the recovery protocol should take over.
    pub fn is_retriable(&self) -> bool {
        matches!(self, RpcError::Timeout | RpcError::ConnectionLost(_))
    }

    /// Error code of an application rejection.
    pub fn code(&self) -> Option<i32> {
        match self {
            RpcError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}
