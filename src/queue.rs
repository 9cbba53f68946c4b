//! Offline Message Queues
//!
//! Per-room buffers of chat messages that arrived while the target identity
//! had no live connection. Memory-resident and best-effort: nothing here
//! survives a restart.

use crate::protocol::{ChatMessage, DeliveryStatus, Identity};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A chat message awaiting the target identity's next connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub status: DeliveryStatus,
}

/// Ordered buffers of undelivered chat messages, one per identity.
///
/// Capacity is bounded per identity; beyond it the oldest message is evicted
/// so the most recent ones (the ones a push notification points at) survive.
#[derive(Debug)]
pub struct OfflineQueue {
    slots: [VecDeque<PendingMessage>; 2],
    cap: usize,
}

impl OfflineQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            slots: [VecDeque::new(), VecDeque::new()],
            cap,
        }
    }

    const fn index(identity: Identity) -> usize {
        match identity {
            Identity::Admin => 0,
            Identity::Friend => 1,
        }
    }

    /// Append a message for `target` in arrival order, evicting the oldest
    /// entry once the buffer is full.
    pub fn enqueue(&mut self, target: Identity, message: ChatMessage) {
        let slot = &mut self.slots[Self::index(target)];
        if slot.len() >= self.cap {
            if let Some(dropped) = slot.pop_front() {
                warn!(
                    "offline queue for {} full; evicting oldest message {}",
                    target, dropped.message.id
                );
            }
        }
        slot.push_back(PendingMessage {
            message,
            status: DeliveryStatus::Sent,
        });
    }

    /// Remove and return the whole buffer for `identity` in arrival order,
    /// advancing every message to `delivered`. All or nothing: the buffer is
    /// empty afterwards.
    pub fn drain(&mut self, identity: Identity) -> Vec<PendingMessage> {
        let mut drained: Vec<PendingMessage> =
            self.slots[Self::index(identity)].drain(..).collect();
        for pending in &mut drained {
            pending.status = DeliveryStatus::Delivered;
        }
        drained
    }

    pub fn len(&self, identity: Identity) -> usize {
        self.slots[Self::index(identity)].len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(VecDeque::is_empty)
    }

    /// Clear both identities' buffers.
    pub fn wipe(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
    }
}
