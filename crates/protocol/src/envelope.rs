//! Request/reply envelope.
//!
//! Every protocol operation is one request envelope answered by exactly one
//! reply envelope with the same `id`. A successful reply has the request's
//! ack type (see [`MessageType::reply_type`]) and carries the receiver's
//! [`RemoteStatus`]; a rejection has type `error` and a [`WireError`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::{CODE_INTERNAL, CODE_VALIDATION, MessageType};
use crate::error::RpcError;
use crate::messages::RemoteStatus;

/// Code and reason of a rejected request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

/// One request or reply on the wire.
///
/// The payload stays raw JSON until the side handling it knows which
/// request or status type to read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Message {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            msg_type,
            payload: payload.map(serde_json::value::to_raw_value).transpose()?,
            error: None,
        })
    }

    /// Reads the payload as `T`; `None` when the envelope has none.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    /// Answers this request with `status` under the request's ack type.
    ///
    /// A request type without an ack is answered with a validation error.
    pub fn reply_status(&self, status: &RemoteStatus) -> Message {
        let Some(ack) = self.msg_type.reply_type() else {
            return self.reply_error(
                CODE_VALIDATION,
                format!("{:?} is not a request", self.msg_type),
            );
        };
        match serde_json::value::to_raw_value(status) {
            Ok(raw) => Message {
                id: self.id.clone(),
                msg_type: ack,
                payload: Some(raw),
                error: None,
            },
            Err(e) => self.reply_error(CODE_INTERNAL, e.to_string()),
        }
    }

    /// Rejects this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Message {
        Message {
            id: self.id.clone(),
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Error || self.error.is_some()
    }

    /// Reads this reply as the answer to request `id` of type `request`.
    ///
    /// Rejections become [`RpcError::Rejected`]. A reply for another id, of
    /// the wrong ack type, or without a status is
    /// [`RpcError::UnexpectedReply`].
    pub fn into_status(self, id: &str, request: MessageType) -> Result<RemoteStatus, RpcError> {
        if let Some(err) = &self.error {
            return Err(RpcError::Rejected {
                code: err.code,
                message: err.message.clone(),
            });
        }
        if self.msg_type == MessageType::Error {
            return Err(RpcError::Rejected {
                code: CODE_INTERNAL,
                message: "error reply without details".into(),
            });
        }
        if self.id != id || Some(self.msg_type) != request.reply_type() {
            return Err(RpcError::UnexpectedReply(format!(
                "{:?} {} answering {:?} {id}",
                self.msg_type, self.id, request
            )));
        }
        self.parse_payload()?.ok_or_else(|| {
            RpcError::UnexpectedReply(format!("{:?} without status", self.msg_type))
        })
    }
}
