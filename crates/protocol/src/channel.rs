//! Transport abstraction.
//!
//! The request/response transport is provided by the embedding
//! application. Keeping it behind a trait decouples the protocol engine
//! from the wire and lets tests inject faults.

use std::future::Future;
use std::pin::Pin;

use crate::envelope::Message;
use crate::error::RpcError;

/// A boxed future returned by channel methods.
pub type ChannelFuture<'a> = Pin<Box<dyn Future<Output = Result<Message, RpcError>> + Send + 'a>>;

/// Delivers one request envelope and waits for its reply.
///
/// Implementations map transport failures to [`RpcError::Timeout`] or
/// [`RpcError::ConnectionLost`]; an error reply from the remote should be
/// returned as `Ok` so callers can read its code.
pub trait RequestChannel: Send + Sync {
    fn request(&self, msg: Message) -> ChannelFuture<'_>;
}
