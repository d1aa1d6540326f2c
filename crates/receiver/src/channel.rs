use std::sync::Arc;

use arbor_protocol::{ChannelFuture, Message, RequestChannel};

use crate::service::ReceiverService;

/// In-process transport to a [`ReceiverService`].
///
/// Requests and replies are round-tripped through their JSON encoding so
/// the exchange is byte-for-byte what a network transport would carry.
#[derive(Clone)]
pub struct LocalChannel {
    service: Arc<ReceiverService>,
}

impl LocalChannel {
    pub fn new(service: Arc<ReceiverService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<ReceiverService> {
        &self.service
    }
}

impl RequestChannel for LocalChannel {
    fn request(&self, msg: Message) -> ChannelFuture<'_> {
        Box::pin(async move {
            let wire = serde_json::to_string(&msg)?;
            let request: Message = serde_json::from_str(&wire)?;
            let reply = self.service.handle(request).await;
            let wire = serde_json::to_string(&reply)?;
            Ok(serde_json::from_str(&wire)?)
        })
    }
}
