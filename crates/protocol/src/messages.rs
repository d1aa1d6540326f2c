use serde::{Deserialize, Serialize};

use crate::frame::{Frame, FrameId};
use crate::types::TransferState;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Delivers one frame of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFrameRequest {
    pub transfer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub frame: Frame,
}

/// Expected digest of one transferred file.
///
/// `file` is the `/`-separated path of the file relative to the transfer
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub checksum: String,
}

/// Delivers the checksum manifest and asks the receiver to verify it.
///
/// The manifest is a list rather than a map so duplicate file ids survive
/// serialization and can be rejected by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    pub transfer_id: String,
    pub manifest: Vec<ManifestEntry>,
}

/// Finalizes a prepared transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub transfer_id: String,
}

/// Queries the receiver's view of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub transfer_id: String,
}

/// Administratively cancels a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTransferRequest {
    pub transfer_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// The receiver's view of a transfer, used by the recovery protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub transfer_id: String,
    /// `None` when the receiver has never seen the transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TransferState>,
    /// Id of the last frame the receiver durably applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_received_frame_id: Option<FrameId>,
}

impl RemoteStatus {
    /// Status for a transfer the receiver does not know.
    pub fn unknown(transfer_id: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            state: None,
            last_received_frame_id: None,
        }
    }
}

/// Custom base64 serde module for raw payload bytes.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
