use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::context::TransferContext;

/// Transfers known to the receiver, keyed by transfer id.
///
/// Finished transfers stay registered for a retention window so late status
/// queries can still be answered, then [`remove_finished`] drops them.
/// Running workers are bounded by a semaphore.
///
/// [`remove_finished`]: TransferRegistry::remove_finished
pub struct TransferRegistry {
    contexts: Mutex<HashMap<String, Arc<TransferContext>>>,
    permits: Arc<Semaphore>,
}

impl TransferRegistry {
    pub fn new(max_workers: usize) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn get(&self, transfer_id: &str) -> Option<Arc<TransferContext>> {
        self.lock().get(transfer_id).cloned()
    }

    pub(crate) fn insert(&self, context: Arc<TransferContext>) {
        self.lock()
            .insert(context.transfer_id().to_string(), context);
    }

    /// Waits for a free worker slot.
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Removes `transfer_id` if it has finished. Returns whether it was
    /// removed.
    pub fn remove_finished(&self, transfer_id: &str) -> bool {
        let mut contexts = self.lock();
        match contexts.get(transfer_id) {
            Some(ctx) if ctx.is_finished() => {
                contexts.remove(transfer_id);
                true
            }
            _ => false,
        }
    }

    /// Removes every finished transfer and returns how many were dropped.
    pub fn purge_finished(&self) -> usize {
        let mut contexts = self.lock();
        let before = contexts.len();
        contexts.retain(|_, ctx| !ctx.is_finished());
        before - contexts.len()
    }

    /// Ids of transfers that have not reached a terminal state.
    pub fn active_transfers(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|ctx| !ctx.is_finished())
            .map(|ctx| ctx.transfer_id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TransferContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
