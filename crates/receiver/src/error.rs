use arbor_protocol::constants::{
    CODE_CANCELLED, CODE_CONFLICT, CODE_INTERNAL, CODE_UNKNOWN_TRANSFER, CODE_VALIDATION,
};
use arbor_transfer::TransferError;

/// Errors returned by receiver protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("transfer refused: {0}")]
    Refused(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("transfer worker stopped")]
    WorkerGone,

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl ReceiverError {
    /// Envelope error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            ReceiverError::UnknownTransfer(_) => CODE_UNKNOWN_TRANSFER,
            ReceiverError::Refused(_) => CODE_CONFLICT,
            ReceiverError::BadRequest(_) => CODE_VALIDATION,
            ReceiverError::WorkerGone => CODE_INTERNAL,
            ReceiverError::Transfer(e) => match e {
                TransferError::Validation(_) | TransferError::Config(_) => CODE_VALIDATION,
                TransferError::Cancelled => CODE_CANCELLED,
                TransferError::AlreadyFinished(_) | TransferError::InvalidTransition { .. } => {
                    CODE_CONFLICT
                }
                _ => CODE_INTERNAL,
            },
        }
    }
}

impl From<serde_json::Error> for ReceiverError {
    fn from(e: serde_json::Error) -> Self {
        ReceiverError::BadRequest(e.to_string())
    }
}
