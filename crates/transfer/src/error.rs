//! Transfer error types.

use std::fmt;
use std::path::PathBuf;

use arbor_protocol::TransferState;
use serde::{Deserialize, Serialize};

/// Category of a protocol invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    /// Blocks or frames arrived in an order the reconstruction cannot accept.
    SequenceViolation,
    /// A file's written length disagrees with its declared size.
    SizeMismatch,
    /// A `FileData` block does not continue where the file left off.
    OffsetMismatch,
    /// A recomputed digest disagrees with the expected one.
    ChecksumMismatch,
    /// The manifest lists the same file twice.
    DuplicateFile,
    /// The manifest lists a file that was never transferred.
    UnknownFile,
    /// The manifest does not cover every transferred file.
    ManifestSize,
    /// A directory or file name is unusable or escapes the root.
    InvalidName,
    /// The source tree contains no items.
    EmptyTransfer,
    /// A frame exceeds its size or block bounds.
    FrameBounds,
    /// A modification time cannot be represented on this host.
    InvalidTimestamp,
}

impl ValidationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationKind::SequenceViolation => "sequence violation",
            ValidationKind::SizeMismatch => "size mismatch",
            ValidationKind::OffsetMismatch => "offset mismatch",
            ValidationKind::ChecksumMismatch => "checksum mismatch",
            ValidationKind::DuplicateFile => "duplicate file",
            ValidationKind::UnknownFile => "unknown file",
            ValidationKind::ManifestSize => "manifest size mismatch",
            ValidationKind::InvalidName => "invalid name",
            ValidationKind::EmptyTransfer => "empty transfer",
            ValidationKind::FrameBounds => "frame out of bounds",
            ValidationKind::InvalidTimestamp => "invalid timestamp",
        }
    }
}

/// A fatal protocol invariant violation with named diagnostic parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            params: Vec::new(),
        }
    }

    /// Attaches a named parameter.
    pub fn with(mut self, name: &str, value: impl ToString) -> Self {
        self.params.push((name.to_string(), value.to_string()));
        self
    }

    /// Returns the value of a named parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn sequence(message: impl Into<String>) -> Self {
        Self::new(ValidationKind::SequenceViolation, message)
    }

    pub fn checksum_mismatch(file: &str, expected: &str, received: &str) -> Self {
        Self::new(ValidationKind::ChecksumMismatch, "file content digest differs")
            .with("file", file)
            .with("expected", expected)
            .with("received", received)
    }

    pub fn invalid_name(name: &str, reason: &str) -> Self {
        Self::new(ValidationKind::InvalidName, reason).with("name", name)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if !self.params.is_empty() {
            f.write_str(" [")?;
            for (i, (k, v)) in self.params.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{k}={v}")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("transfer already finished: {0}")]
    AlreadyFinished(String),

    #[error("illegal state transition {from} -> {to}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("{operation} rejected by remote ({code}): {message}")]
    Rejected {
        operation: &'static str,
        code: i32,
        message: String,
    },

    #[error("{operation} desynchronized from remote: {detail}")]
    Desynchronized {
        operation: &'static str,
        detail: String,
    },

    #[error("{operation} failed after {attempts} recovery attempts")]
    Communication {
        operation: &'static str,
        attempts: u32,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transfer worker stopped: {0}")]
    Worker(String),
}

impl TransferError {
    /// Wraps an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for the cooperative cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Returns the validation cause, if any.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            TransferError::Validation(v) => Some(v),
            _ => None,
        }
    }
}
