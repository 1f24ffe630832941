//! Offline Mailbox: durable FIFO of frames for users who were not
//! reachable when something was sent to them.

use std::sync::Arc;

use tracing::{debug, warn};

use courier_shared::protocol::{MailboxEntry, ServerFrame};
use courier_shared::types::Username;
use courier_shared::RelayError;
use courier_store::Persistence;

use crate::offload::with_store;

#[derive(Clone)]
pub struct OfflineMailbox {
    store: Arc<dyn Persistence>,
}

impl OfflineMailbox {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    pub async fn enqueue(
        &self,
        owner: &Username,
        payload: ServerFrame,
    ) -> Result<MailboxEntry, RelayError> {
        let entry = MailboxEntry::new(owner.clone(), payload);
        let stored = entry.clone();
        with_store(&self.store, move |s| s.enqueue_offline(&stored)).await?;
        debug!(owner = %owner, entry = %entry.id, "Mailboxed frame");
        Ok(entry)
    }

    /// Snapshot the owner's queue. Nothing is removed until the returned
    /// [`Drain`] is committed, so an interrupted hand-off is redelivered on
    /// the next drain.
    pub async fn drain(&self, owner: &Username) -> Result<Drain, RelayError> {
        let key = owner.clone();
        let entries = with_store(&self.store, move |s| s.load_offline_queue(&key)).await?;
        Ok(Drain {
            owner: owner.clone(),
            entries,
            store: self.store.clone(),
        })
    }
}

/// A snapshot of one user's mailbox awaiting hand-off.
pub struct Drain {
    owner: Username,
    entries: Vec<MailboxEntry>,
    store: Arc<dyn Persistence>,
}

impl Drain {
    pub fn entries(&self) -> &[MailboxEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Split the snapshot into runs whose JSON stays under `max_bytes`, so
    /// each run fits in one `OFFLINE_MESSAGES` frame. An entry larger than
    /// the budget travels alone.
    pub fn batches(&self, max_bytes: usize) -> Vec<&[MailboxEntry]> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut size = 0;

        for (i, entry) in self.entries.iter().enumerate() {
            // +1 for the separating comma.
            let entry_size = serde_json::to_vec(entry).map(|v| v.len()).unwrap_or(0) + 1;
            if i > start && size + entry_size > max_bytes {
                batches.push(&self.entries[start..i]);
                start = i;
                size = 0;
            }
            size += entry_size;
        }
        if start < self.entries.len() {
            batches.push(&self.entries[start..]);
        }
        batches
    }

    /// Mark `delivered` as received; they will not be drained again.
    pub async fn commit(&self, delivered: &[MailboxEntry]) -> Result<(), RelayError> {
        let ids: Vec<_> = delivered.iter().map(|e| e.id).collect();
        let owner = self.owner.clone();
        with_store(&self.store, move |s| s.remove_offline(&owner, &ids))
            .await
            .inspect_err(|e| {
                warn!(owner = %self.owner, error = %e, "Failed to clear delivered mailbox entries")
            })
    }
}
