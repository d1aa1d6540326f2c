use arbor_transfer::{TransferError, TransferProgress};

/// Observes an outgoing transfer.
///
/// All methods default to doing nothing. Exactly one of `on_success`,
/// `on_canceled` and `on_failed` is invoked per transfer.
pub trait TransferListener: Send + Sync + 'static {
    fn on_begin(&self, _transfer_id: &str, _request_id: Option<&str>) {}

    /// Periodic snapshot, throttled by the progress interval.
    fn on_progress(&self, _progress: &TransferProgress) {}

    fn on_success(&self, _progress: &TransferProgress) {}

    fn on_canceled(&self, _progress: &TransferProgress) {}

    fn on_failed(&self, _progress: &TransferProgress, _cause: &TransferError) {}
}

/// Listener that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl TransferListener for NoopListener {}
