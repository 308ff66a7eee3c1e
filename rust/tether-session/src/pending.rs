//! The pending-query table: request id allocation and response correlation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use tether_wire::Value;

use crate::error::CallError;

type Slot = oneshot::Sender<Result<Value, CallError>>;

/// Monotonic id allocator plus a map of one-shot response slots.
///
/// Ids are 64-bit and never reused. The table outlives any single transport:
/// a client keeps it across reconnects, and a dying transport rejects every
/// entry with [`CallError::ConnectionClosed`].
#[derive(Default)]
pub struct PendingQueries {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl PendingQueries {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next id and its response slot.
    pub fn allocate(&self) -> (u64, oneshot::Receiver<Result<Value, CallError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        (id, rx)
    }

    /// Complete a query with its result. Unknown ids are logged and dropped;
    /// a stray response is not fatal.
    pub fn resolve(&self, id: u64, value: Value) {
        match self.slots.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.send(Ok(value));
            }
            None => warn!("Unknown response ID: {id}"),
        }
    }

    /// Complete a query with an error.
    pub fn reject(&self, id: u64, error: CallError) {
        match self.slots.lock().remove(&id) {
            Some(slot) => {
                let _ = slot.send(Err(error));
            }
            None => warn!("Unknown response ID: {id}"),
        }
    }

    /// Drop a slot without completing it (local cancellation).
    pub fn forget(&self, id: u64) {
        self.slots.lock().remove(&id);
    }

    /// Complete a query with an error if the slot still exists; unlike
    /// [`reject`](Self::reject) an already-completed slot is not noteworthy.
    pub fn abandon(&self, id: u64, error: CallError) {
        if let Some(slot) = self.slots.lock().remove(&id) {
            let _ = slot.send(Err(error));
        }
    }

    /// Drain the table, rejecting every entry. Called on transport close.
    pub fn reject_all(&self, error: CallError) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            let _ = slot.send(Err(error.clone()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonic_and_unique() {
        let pending = PendingQueries::new();
        let (a, _ra) = pending.allocate();
        let (b, _rb) = pending.allocate();
        let (c, _rc) = pending.allocate();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn resolve_completes_exactly_one_slot() {
        let pending = PendingQueries::new();
        let (id, rx) = pending.allocate();
        pending.resolve(id, Value::Int(5));
        assert_eq!(rx.await.unwrap(), Ok(Value::Int(5)));
        // second resolve hits the unknown-id path and is harmless
        pending.resolve(id, Value::Int(6));
    }

    #[tokio::test]
    async fn reject_all_drains_everything() {
        let pending = PendingQueries::new();
        let (_a, ra) = pending.allocate();
        let (_b, rb) = pending.allocate();
        pending.reject_all(CallError::ConnectionClosed);
        assert_eq!(ra.await.unwrap(), Err(CallError::ConnectionClosed));
        assert_eq!(rb.await.unwrap(), Err(CallError::ConnectionClosed));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn forgotten_slots_surface_as_cancellation() {
        let pending = PendingQueries::new();
        let (id, rx) = pending.allocate();
        pending.forget(id);
        assert!(rx.await.is_err());
    }
}
