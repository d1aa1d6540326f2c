//! Runs outgoing transfers on a bounded worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arbor_protocol::TransferState;
use arbor_transfer::{
    IdGenerator, SourceNode, TransferConfig, TransferError, TransferProgress, UuidIdGenerator,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::TransferCoordinator;
use crate::listener::TransferListener;
use crate::remote::RemoteReceiver;

struct Entry {
    cancel: CancellationToken,
    state: watch::Receiver<TransferState>,
    progress: Arc<Mutex<TransferProgress>>,
}

type Transfers = Arc<Mutex<HashMap<String, Entry>>>;

/// Starts, tracks and cancels outgoing transfers.
///
/// At most `max_workers` transfers run at once; further transfers wait for
/// a free slot. A transfer leaves the registry once it is terminal.
pub struct TransferService {
    config: TransferConfig,
    remote: Arc<dyn RemoteReceiver>,
    ids: Arc<dyn IdGenerator>,
    permits: Arc<Semaphore>,
    transfers: Transfers,
}

impl TransferService {
    pub fn new(config: TransferConfig, remote: Arc<dyn RemoteReceiver>) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_workers)),
            config,
            remote,
            ids: Arc::new(UuidIdGenerator),
            transfers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Uses `ids` for transfer ids instead of random UUIDs.
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Queues a transfer of `roots` and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        roots: Vec<SourceNode>,
        request_id: Option<String>,
        listener: Arc<dyn TransferListener>,
    ) -> TransferHandle {
        let transfer_id = self.ids.next_id();
        let cancel = CancellationToken::new();
        let coordinator = TransferCoordinator::new(
            transfer_id.clone(),
            request_id,
            Arc::clone(&self.remote),
            listener,
            &self.config,
        )
        .with_cancellation(cancel.clone());

        lock(&self.transfers).insert(
            transfer_id.clone(),
            Entry {
                cancel: cancel.clone(),
                state: coordinator.subscribe(),
                progress: coordinator.shared_progress(),
            },
        );
        debug!(transfer = %transfer_id, "transfer queued");

        let permits = Arc::clone(&self.permits);
        let transfers = Arc::clone(&self.transfers);
        let worker_cancel = cancel.clone();
        let id = transfer_id.clone();
        let task = tokio::spawn(async move {
            // A transfer cancelled while queued still runs, so its listener
            // sees the cancellation.
            let _permit = tokio::select! {
                biased;
                _ = worker_cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let result = coordinator.run(roots).await;
            lock(&transfers).remove(&id);
            result
        });

        TransferHandle {
            transfer_id,
            cancel,
            task,
        }
    }

    /// Cancels a running transfer and waits until it is terminal.
    ///
    /// Fails with [`TransferError::AlreadyFinished`] when the transfer is
    /// unknown, already terminal, or reaches another terminal state first.
    pub async fn cancel(&self, transfer_id: &str) -> Result<(), TransferError> {
        let (cancel, mut state) = {
            let transfers = lock(&self.transfers);
            match transfers.get(transfer_id) {
                Some(entry) => (entry.cancel.clone(), entry.state.clone()),
                None => return Err(TransferError::AlreadyFinished(transfer_id.to_string())),
            }
        };
        if state.borrow().is_terminal() {
            return Err(TransferError::AlreadyFinished(transfer_id.to_string()));
        }

        info!(transfer = %transfer_id, "cancel requested");
        cancel.cancel();
        let outcome = *state
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| TransferError::Worker(format!("transfer {transfer_id} vanished")))?;
        match outcome {
            TransferState::Canceled => Ok(()),
            _ => Err(TransferError::AlreadyFinished(transfer_id.to_string())),
        }
    }

    /// Progress of a transfer that has not yet left the registry.
    pub fn status(&self, transfer_id: &str) -> Option<TransferProgress> {
        lock(&self.transfers).get(transfer_id).map(|entry| {
            entry
                .progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Ids of transfers that are queued or running.
    pub fn active_transfers(&self) -> Vec<String> {
        lock(&self.transfers)
            .iter()
            .filter(|(_, entry)| !entry.state.borrow().is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Handle to a started transfer.
pub struct TransferHandle {
    transfer_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<TransferProgress, TransferError>>,
}

impl TransferHandle {
    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    /// Requests cancellation without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the transfer's outcome.
    pub async fn wait(self) -> Result<TransferProgress, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))?
    }
}

fn lock(transfers: &Mutex<HashMap<String, Entry>>) -> MutexGuard<'_, HashMap<String, Entry>> {
    transfers.lock().unwrap_or_else(PoisonError::into_inner)
}
