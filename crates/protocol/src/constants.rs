use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default upper bound on a frame's payload bytes (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 4 * 1024 * 1024;

/// Default upper bound on the number of blocks in one frame.
pub const DEFAULT_MAX_FRAME_BLOCKS: usize = 1024;

/// Timeout for a single request/response round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between two recovery status queries.
pub const RECOVERY_DELAY: Duration = Duration::from_secs(1);

/// Number of status queries attempted before a fault becomes fatal.
pub const RECOVERY_ATTEMPTS: u32 = 5;

/// Error code: the request violated a protocol invariant.
pub const CODE_VALIDATION: i32 = 400;

/// Error code: the referenced transfer is unknown to the receiver.
pub const CODE_UNKNOWN_TRANSFER: i32 = 404;

/// Error code: the transfer already reached a terminal state, or the
/// request is illegal in its current state.
pub const CODE_CONFLICT: i32 = 409;

/// Error code: the transfer was cancelled.
pub const CODE_CANCELLED: i32 = 499;

/// Error code: the receiver hit a filesystem or internal error.
pub const CODE_INTERNAL: i32 = 500;

/// Message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from sender to receiver
    #[serde(rename = "send_frame")]
    SendFrame,
    #[serde(rename = "prepare")]
    Prepare,
    #[serde(rename = "commit")]
    Commit,
    #[serde(rename = "get_status")]
    GetStatus,
    #[serde(rename = "cancel_transfer")]
    CancelTransfer,

    // Replies from receiver to sender
    #[serde(rename = "frame_ack")]
    FrameAck,
    #[serde(rename = "prepare_ack")]
    PrepareAck,
    #[serde(rename = "commit_ack")]
    CommitAck,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "cancel_ack")]
    CancelAck,

    #[serde(rename = "error")]
    Error,
}

impl MessageType {
    /// Returns the reply type expected for a request type, if any.
    pub fn reply_type(self) -> Option<MessageType> {
        match self {
            MessageType::SendFrame => Some(MessageType::FrameAck),
            MessageType::Prepare => Some(MessageType::PrepareAck),
            MessageType::Commit => Some(MessageType::CommitAck),
            MessageType::GetStatus => Some(MessageType::Status),
            MessageType::CancelTransfer => Some(MessageType::CancelAck),
            _ => None,
        }
    }
}
