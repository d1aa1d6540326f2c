//! Receiving side of arbor tree transfers.
//!
//! [`ReceiverService`] answers the protocol operations, either directly or
//! through [`ReceiverService::handle`] for JSON envelopes. Every accepted
//! transfer runs in its own [`TransferContext`] worker, reconstructing the
//! tree under the directory chosen by the [`TransferHandler`].

mod channel;
mod context;
mod error;
mod handler;
mod registry;
mod service;

pub use channel::LocalChannel;
pub use context::TransferContext;
pub use error::ReceiverError;
pub use handler::{DirectoryHandler, TransferHandler};
pub use registry::TransferRegistry;
pub use service::ReceiverService;
