//! Per-transport stream tables.
//!
//! Two tables, one per direction: inbound streams own the sink feeding the
//! local consumer; outbound streams own the cancel token that stops the
//! producer task. The registry lives inside the driver task, so it needs no
//! lock of its own.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use tether_wire::{StreamSender, ValueStream};

/// An inbound stream: remote producer, local consumer.
pub struct InboundEntry {
    pub sink: StreamSender,
    /// Set when the local consumer cancels. The entry stays registered until
    /// the remote's `done`/`error` arrives; frames in between are discarded.
    pub canceled: bool,
}

/// A producer not yet started: the announcing frame must reach the wire
/// first, so the remote can bind its sink before any chunk arrives.
pub struct PendingProducer {
    pub id: u64,
    pub stream: ValueStream,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct StreamRegistry {
    next_id: u64,
    inbound: HashMap<u64, InboundEntry>,
    outbound: HashMap<u64, CancellationToken>,
    pending_producers: Vec<PendingProducer>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Reserve an id for an outgoing sequence. The producer task starts
    /// later, via [`take_pending_producers`](Self::take_pending_producers).
    pub fn alloc_outbound(&mut self, stream: ValueStream) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let cancel = CancellationToken::new();
        self.outbound.insert(id, cancel.clone());
        self.pending_producers.push(PendingProducer { id, stream, cancel });
        id
    }

    /// Producers whose announcing frame has been written and may now start.
    pub fn take_pending_producers(&mut self) -> Vec<PendingProducer> {
        std::mem::take(&mut self.pending_producers)
    }

    /// Drop producers bound during an encode that never reached the wire.
    pub fn discard_pending_producers(&mut self) {
        for pending in self.pending_producers.drain(..) {
            self.outbound.remove(&pending.id);
        }
    }

    /// Register the sink for a remote-allocated inbound id. False if the id
    /// is already bound (the remote reused an id).
    pub fn register_inbound(&mut self, id: u64, sink: StreamSender) -> bool {
        if self.inbound.contains_key(&id) {
            return false;
        }
        self.inbound.insert(
            id,
            InboundEntry {
                sink,
                canceled: false,
            },
        );
        true
    }

    pub fn has_inbound(&self, id: u64) -> bool {
        self.inbound.contains_key(&id)
    }

    /// The sink for a live inbound stream; `None` if unknown or canceled.
    pub fn inbound_sink(&self, id: u64) -> Option<StreamSender> {
        self.inbound
            .get(&id)
            .filter(|entry| !entry.canceled)
            .map(|entry| entry.sink.clone())
    }

    /// Flag a local cancel. True if the entry existed and was not already
    /// canceled (i.e. a cancel frame should go out).
    pub fn mark_canceled(&mut self, id: u64) -> bool {
        match self.inbound.get_mut(&id) {
            Some(entry) if !entry.canceled => {
                entry.canceled = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove_inbound(&mut self, id: u64) -> Option<InboundEntry> {
        self.inbound.remove(&id)
    }

    pub fn has_outbound(&self, id: u64) -> bool {
        self.outbound.contains_key(&id)
    }

    pub fn remove_outbound(&mut self, id: u64) -> Option<CancellationToken> {
        self.outbound.remove(&id)
    }

    /// Tear everything down: fire every outbound cancel token and hand back
    /// the inbound entries so the driver can error their sinks.
    pub fn drain(&mut self) -> Vec<InboundEntry> {
        self.pending_producers.clear();
        for (_, token) in self.outbound.drain() {
            token.cancel();
        }
        self.inbound.drain().map(|(_, entry)| entry).collect()
    }
}
