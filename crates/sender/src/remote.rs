//! The receiving party as seen by the sender.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use arbor_protocol::{
    CancelTransferRequest, CommitRequest, Frame, ManifestEntry, Message, MessageType,
    PrepareRequest, RemoteStatus, RequestChannel, RpcError, SendFrameRequest, StatusRequest,
};
use arbor_transfer::{IdGenerator, UuidIdGenerator};
use serde::Serialize;
use tracing::trace;

/// A boxed future returned by [`RemoteReceiver`] methods.
pub type RemoteFuture<'a> = Pin<Box<dyn Future<Output = Result<RemoteStatus, RpcError>> + Send + 'a>>;

/// Protocol operations offered by the receiver.
///
/// Every operation answers with the receiver's status after handling it.
/// Application rejections surface as [`RpcError::Rejected`].
pub trait RemoteReceiver: Send + Sync {
    fn send_frame<'a>(
        &'a self,
        transfer_id: &'a str,
        request_id: Option<&'a str>,
        frame: &'a Frame,
    ) -> RemoteFuture<'a>;

    fn prepare<'a>(&'a self, transfer_id: &'a str, manifest: &'a [ManifestEntry]) -> RemoteFuture<'a>;

    fn commit<'a>(&'a self, transfer_id: &'a str) -> RemoteFuture<'a>;

    /// Used only by the recovery protocol.
    fn get_status<'a>(&'a self, transfer_id: &'a str) -> RemoteFuture<'a>;

    fn cancel_transfer<'a>(&'a self, transfer_id: &'a str) -> RemoteFuture<'a>;
}

/// [`RemoteReceiver`] speaking JSON envelopes over a [`RequestChannel`].
pub struct EnvelopeRemote<C> {
    channel: C,
    ids: Arc<dyn IdGenerator>,
}

impl<C: RequestChannel> EnvelopeRemote<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            ids: Arc::new(UuidIdGenerator),
        }
    }

    /// Uses `ids` for envelope ids instead of random UUIDs.
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    async fn call<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<RemoteStatus, RpcError> {
        let msg = Message::new(self.ids.next_id(), msg_type, Some(payload))?;
        let id = msg.id.clone();
        trace!(id = %id, msg_type = ?msg_type, "request");

        self.channel.request(msg).await?.into_status(&id, msg_type)
    }
}

impl<C: RequestChannel> RemoteReceiver for EnvelopeRemote<C> {
    fn send_frame<'a>(
        &'a self,
        transfer_id: &'a str,
        request_id: Option<&'a str>,
        frame: &'a Frame,
    ) -> RemoteFuture<'a> {
        Box::pin(async move {
            let req = SendFrameRequest {
                transfer_id: transfer_id.to_string(),
                request_id: request_id.map(str::to_string),
                frame: frame.clone(),
            };
            self.call(MessageType::SendFrame, &req).await
        })
    }

    fn prepare<'a>(&'a self, transfer_id: &'a str, manifest: &'a [ManifestEntry]) -> RemoteFuture<'a> {
        Box::pin(async move {
            let req = PrepareRequest {
                transfer_id: transfer_id.to_string(),
                manifest: manifest.to_vec(),
            };
            self.call(MessageType::Prepare, &req).await
        })
    }

    fn commit<'a>(&'a self, transfer_id: &'a str) -> RemoteFuture<'a> {
        Box::pin(async move {
            let req = CommitRequest {
                transfer_id: transfer_id.to_string(),
            };
            self.call(MessageType::Commit, &req).await
        })
    }

    fn get_status<'a>(&'a self, transfer_id: &'a str) -> RemoteFuture<'a> {
        Box::pin(async move {
            let req = StatusRequest {
                transfer_id: transfer_id.to_string(),
            };
            self.call(MessageType::GetStatus, &req).await
        })
    }

    fn cancel_transfer<'a>(&'a self, transfer_id: &'a str) -> RemoteFuture<'a> {
        Box::pin(async move {
            let req = CancelTransferRequest {
                transfer_id: transfer_id.to_string(),
            };
            self.call(MessageType::CancelTransfer, &req).await
        })
    }
}
