//! Bookkeeping for requests awaiting browser-side completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Event;

/// Events delivered to the request task that owns a pending entry.
#[derive(Debug)]
pub enum InboundEvent {
    /// A decoded frame from the browser plane.
    Frame(Event),
    /// The control channel dropped; no further frames will arrive.
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("request id {0} is already pending")]
    DuplicateId(String),
}

/// Per-request bookkeeping held while the browser side is in flight.
#[derive(Debug)]
pub struct PendingEntry {
    tx: mpsc::Sender<InboundEvent>,
    generation: u64,
    created_at: Instant,
}

impl PendingEntry {
    /// `generation` records which control-channel connection the request
    /// was issued to.
    pub fn new(tx: mpsc::Sender<InboundEvent>, generation: u64) -> Self {
        Self {
            tx,
            generation,
            created_at: Instant::now(),
        }
    }

    /// Deliver an event to the owning request task, waiting for queue
    /// space. Returns `false` if the owner is gone.
    pub async fn deliver(&self, event: InboundEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Best-effort delivery that never blocks. Used during disconnect
    /// fan-out, where dropping the sender also wakes the owner.
    pub fn deliver_now(&self, event: InboundEvent) {
        let _ = self.tx.try_send(event);
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Concurrency-safe map of in-flight request ids.
///
/// The control-channel receive task and the HTTP handler tasks mutate the
/// table concurrently; each entry's receiving end is only ever driven by
/// the handler task that owns it.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<String, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new in-flight request.
    pub fn insert(&self, id: &str, entry: PendingEntry) -> Result<(), PendingError> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(PendingError::DuplicateId(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Clone the event sender for an id without removing the entry.
    pub fn sender(&self, id: &str) -> Option<mpsc::Sender<InboundEvent>> {
        self.entries.get(id).map(|entry| entry.tx.clone())
    }

    /// Atomically remove and return an entry. Terminal frames, idle
    /// expiry and disconnects all funnel through here; a second caller
    /// gets `None` and treats the removal as already done.
    pub fn take(&self, id: &str) -> Option<PendingEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    /// Remove every entry issued to `generation` or an earlier
    /// connection. Entries created under a newer binding stay put.
    pub fn drain_up_to(&self, generation: u64) -> Vec<(String, PendingEntry)> {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().generation <= generation)
            .map(|entry| entry.key().clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removal guard handed to the request task; dropping it retires the
    /// entry however the task ends, so the table drains even when the
    /// local client vanishes mid-request.
    pub fn removal_guard(self: &Arc<Self>, id: String) -> PendingGuard {
        PendingGuard {
            table: Arc::clone(self),
            id,
        }
    }
}

#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<PendingTable>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.take(&self.id);
    }
}
