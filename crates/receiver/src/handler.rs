//! Callbacks the embedding application implements for incoming transfers.

use std::path::{Path, PathBuf};

use arbor_transfer::{TransferError, TransferProgress};

/// Receives lifecycle notifications for incoming transfers.
///
/// Only [`on_begin`](TransferHandler::on_begin) is required; it accepts a
/// transfer by returning the directory the tree is reconstructed under, or
/// refuses it. Each terminal callback fires exactly once per transfer.
pub trait TransferHandler: Send + Sync + 'static {
    fn on_begin(&self, transfer_id: &str, request_id: Option<&str>) -> Result<PathBuf, String>;

    /// Periodic snapshot, throttled by the progress interval.
    fn on_progress(&self, _progress: &TransferProgress) {}

    fn on_success(&self, _transfer_id: &str, _root: &Path) {}

    fn on_canceled(&self, _transfer_id: &str) {}

    fn on_failed(&self, _transfer_id: &str, _cause: &TransferError) {}
}

/// Accepts every transfer into a fixed directory.
///
/// With [`per_transfer`](DirectoryHandler::per_transfer) each transfer gets
/// its own subdirectory named after the transfer id.
#[derive(Debug, Clone)]
pub struct DirectoryHandler {
    base: PathBuf,
    per_transfer: bool,
}

impl DirectoryHandler {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            per_transfer: false,
        }
    }

    pub fn per_transfer(mut self) -> Self {
        self.per_transfer = true;
        self
    }
}

impl TransferHandler for DirectoryHandler {
    fn on_begin(&self, transfer_id: &str, _request_id: Option<&str>) -> Result<PathBuf, String> {
        if !self.per_transfer {
            return Ok(self.base.clone());
        }
        arbor_transfer::validate_entry_name(transfer_id).map_err(|e| e.to_string())?;
        Ok(self.base.join(transfer_id))
    }

    fn on_success(&self, transfer_id: &str, root: &Path) {
        tracing::info!(transfer = %transfer_id, root = %root.display(), "transfer committed");
    }

    fn on_failed(&self, transfer_id: &str, cause: &TransferError) {
        tracing::error!(transfer = %transfer_id, error = %cause, "transfer failed");
    }
}
