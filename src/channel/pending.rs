//! Pending request table: request identity to the waiting caller.

use super::wire::{Reply, RequestId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocates a fresh identity and registers the caller. The entry lives as
    /// long as the returned guard.
    pub fn register(self: &Arc<Self>) -> (PendingGuard, oneshot::Receiver<Reply>) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(id, tx);
        (
            PendingGuard {
                table: Arc::clone(self),
                id,
            },
            rx,
        )
    }

    /// Delivers a reply. Returns false for unknown or already released ids.
    pub fn complete(&self, id: RequestId, reply: Reply) -> bool {
        let sender = self.entries.lock().remove(&id);
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops every waiter; their receivers observe cancellation.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the table entry when the waiting future completes or is dropped.
pub struct PendingGuard {
    table: Arc<PendingTable>,
    id: RequestId,
}

impl PendingGuard {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.entries.lock().remove(&self.id);
    }
}
