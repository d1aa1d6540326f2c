use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer, as reported by either party.
///
/// The sender walks `Initialized → Started → Transferred → Prepared →
/// Committed`; the receiver skips `Transferred`. `Failed` and `Canceled`
/// are reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Initialized,
    Started,
    Transferred,
    Prepared,
    Committed,
    Failed,
    Canceled,
}

impl TransferState {
    /// Returns `true` once no further transitions are permitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Committed | TransferState::Failed | TransferState::Canceled
        )
    }

    /// Returns `true` if the data phase is over (prepared or committed).
    pub fn is_past_data_phase(self) -> bool {
        matches!(self, TransferState::Prepared | TransferState::Committed)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Initialized => "initialized",
            TransferState::Started => "started",
            TransferState::Transferred => "transferred",
            TransferState::Prepared => "prepared",
            TransferState::Committed => "committed",
            TransferState::Failed => "failed",
            TransferState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
