//! Receiver protocol operations and envelope dispatch.

use std::sync::Arc;

use arbor_protocol::{
    CancelTransferRequest, CommitRequest, FrameId, Message, MessageType, PrepareRequest,
    RemoteStatus, SendFrameRequest, StatusRequest,
};
use arbor_transfer::{TransferConfig, TransferError, ValidationError};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::context::TransferContext;
use crate::error::ReceiverError;
use crate::handler::TransferHandler;
use crate::registry::TransferRegistry;

/// Receiving endpoint for any number of concurrent transfers.
pub struct ReceiverService {
    config: TransferConfig,
    handler: Arc<dyn TransferHandler>,
    registry: Arc<TransferRegistry>,
    /// Serializes context creation so a resent first frame cannot start
    /// the same transfer twice.
    creating: tokio::sync::Mutex<()>,
}

impl ReceiverService {
    pub fn new(
        config: TransferConfig,
        handler: Arc<dyn TransferHandler>,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(TransferRegistry::new(config.max_workers)),
            config,
            handler,
            creating: tokio::sync::Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Delivers one frame. The first frame of an unknown transfer starts it.
    pub async fn send(&self, req: SendFrameRequest) -> Result<RemoteStatus, ReceiverError> {
        let ctx = match self.registry.get(&req.transfer_id) {
            Some(ctx) => ctx,
            None => {
                self.start_transfer(&req.transfer_id, req.request_id.as_deref(), req.frame.id)
                    .await?
            }
        };
        ctx.send_frame(req.frame).await
    }

    pub async fn prepare(&self, req: PrepareRequest) -> Result<RemoteStatus, ReceiverError> {
        self.context(&req.transfer_id)?.prepare(req.manifest).await
    }

    pub async fn commit(&self, req: CommitRequest) -> Result<RemoteStatus, ReceiverError> {
        self.context(&req.transfer_id)?.commit().await
    }

    /// Reports the transfer's state and last applied frame; unknown
    /// transfers report no state.
    pub fn get_status(&self, req: StatusRequest) -> RemoteStatus {
        match self.registry.get(&req.transfer_id) {
            Some(ctx) => ctx.status(),
            None => RemoteStatus::unknown(req.transfer_id),
        }
    }

    /// Cancels a running transfer and waits until its worker stops.
    pub async fn cancel_transfer(
        &self,
        req: CancelTransferRequest,
    ) -> Result<RemoteStatus, ReceiverError> {
        let ctx = self.context(&req.transfer_id)?;
        info!(transfer = %req.transfer_id, "cancel requested");
        ctx.cancel().await
    }

    /// Answers one request envelope.
    pub async fn handle(&self, msg: Message) -> Message {
        match self.dispatch(&msg).await {
            Ok(status) => msg.reply_status(&status),
            Err(e) => {
                debug!(id = %msg.id, msg_type = ?msg.msg_type, error = %e, "request failed");
                msg.reply_error(e.code(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, msg: &Message) -> Result<RemoteStatus, ReceiverError> {
        match msg.msg_type {
            MessageType::SendFrame => self.send(payload(msg)?).await,
            MessageType::Prepare => self.prepare(payload(msg)?).await,
            MessageType::Commit => self.commit(payload(msg)?).await,
            MessageType::GetStatus => Ok(self.get_status(payload(msg)?)),
            MessageType::CancelTransfer => self.cancel_transfer(payload(msg)?).await,
            other => Err(ReceiverError::BadRequest(format!(
                "unsupported message type {other:?}"
            ))),
        }
    }

    fn context(&self, transfer_id: &str) -> Result<Arc<TransferContext>, ReceiverError> {
        self.registry
            .get(transfer_id)
            .ok_or_else(|| ReceiverError::UnknownTransfer(transfer_id.to_string()))
    }

    async fn start_transfer(
        &self,
        transfer_id: &str,
        request_id: Option<&str>,
        first: FrameId,
    ) -> Result<Arc<TransferContext>, ReceiverError> {
        let _guard = self.creating.lock().await;
        if let Some(ctx) = self.registry.get(transfer_id) {
            return Ok(ctx);
        }
        if first != FrameId::FIRST {
            return Err(ReceiverError::Transfer(
                ValidationError::sequence("transfer must start with the first frame")
                    .with("expected", FrameId::FIRST)
                    .with("received", first)
                    .into(),
            ));
        }

        let root = self
            .handler
            .on_begin(transfer_id, request_id)
            .map_err(ReceiverError::Refused)?;
        let permit = self.registry.acquire().await.ok_or(ReceiverError::WorkerGone)?;
        let ctx = TransferContext::start(
            transfer_id.to_string(),
            request_id.map(str::to_string),
            root,
            Arc::clone(&self.handler),
            &self.config,
            permit,
        )
        .await?;
        let ctx = Arc::new(ctx);
        self.registry.insert(Arc::clone(&ctx));
        self.forget_when_finished(&ctx);
        Ok(ctx)
    }

    /// Drops `ctx` from the registry once it has been terminal for the
    /// configured retention window.
    fn forget_when_finished(&self, ctx: &TransferContext) {
        let registry = Arc::downgrade(&self.registry);
        let transfer_id = ctx.transfer_id().to_string();
        let retention = self.config.finished_retention();
        let mut state = ctx.subscribe();
        tokio::spawn(async move {
            // A closed channel means the worker is gone, which is terminal too.
            let _ = state.wait_for(|s| s.is_terminal()).await;
            tokio::time::sleep(retention).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if registry.remove_finished(&transfer_id) {
                debug!(transfer = %transfer_id, "finished transfer forgotten");
            }
        });
    }
}

fn payload<T: DeserializeOwned>(msg: &Message) -> Result<T, ReceiverError> {
    msg.parse_payload()?
        .ok_or_else(|| ReceiverError::BadRequest("missing payload".into()))
}
