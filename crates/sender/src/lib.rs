//! Sending side of arbor tree transfers.
//!
//! A [`TransferService`] turns source trees into transfers. Each transfer
//! is driven by a [`TransferCoordinator`] through the data, prepare and
//! commit phases against a [`RemoteReceiver`], recovering from lost
//! requests or replies with [`RetryableOperation`].

mod coordinator;
mod listener;
mod remote;
mod retry;
mod service;

pub use coordinator::TransferCoordinator;
pub use listener::{NoopListener, TransferListener};
pub use remote::{EnvelopeRemote, RemoteFuture, RemoteReceiver};
pub use retry::{
    Recovery, RetryPolicy, RetryableOperation, classify_commit, classify_prepare, classify_send,
};
pub use service::{TransferHandle, TransferService};
