//! Wire protocol types shared by the sending and receiving sides of an
//! arbor tree transfer.
//!
//! A transfer moves a directory tree as an ordered sequence of [`Frame`]s.
//! Each frame carries [`Block`]s describing tree-reconstruction steps and a
//! raw payload stream the `FileData` blocks slice into. Requests travel in a
//! [`Message`] envelope over any [`RequestChannel`].

pub mod channel;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use channel::{ChannelFuture, RequestChannel};
pub use constants::MessageType;
pub use envelope::{Message, WireError};
pub use error::RpcError;
pub use frame::{Block, Frame, FrameId};
pub use messages::{
    CancelTransferRequest, CommitRequest, ManifestEntry, PrepareRequest, RemoteStatus,
    SendFrameRequest, StatusRequest,
};
pub use types::TransferState;
