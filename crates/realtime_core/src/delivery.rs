//! Dedup bookkeeping for the delivery pipeline. A message may reach the
//! client on a per-conversation channel, on the viewer's notification
//! channel, through the poll synchronizer, or as the sender's own echo; all
//! paths converge on one `ingest` entry point and the second and later
//! sightings of an id are dropped here.

use std::collections::{HashSet, VecDeque};

use shared::domain::{ConversationId, MessageId};

/// Bounded recently-seen id set with FIFO eviction. Guarantees no false
/// negative for at least the most recent `capacity` ids; an id evicted after
/// that may be re-observed once, which is safe because store insertion is
/// itself idempotent on message id.
pub struct DedupSet {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a sighting. Returns `true` the first time an id is observed,
    /// `false` for an already-seen id.
    pub fn observe(&mut self, message_id: MessageId) -> bool {
        if !self.seen.insert(message_id) {
            return false;
        }
        self.order.push_back(message_id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct DeliveryPipeline {
    seen: DedupSet,
    /// Conversation ids we already tried (and failed) to fetch a summary
    /// for. One attempt per id per client session; repeat failures are not
    /// retried.
    fetch_attempted: HashSet<ConversationId>,
}

impl DeliveryPipeline {
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            seen: DedupSet::new(dedup_capacity),
            fetch_attempted: HashSet::new(),
        }
    }

    /// First sighting check for an inbound message id.
    pub fn observe(&mut self, message_id: MessageId) -> bool {
        self.seen.observe(message_id)
    }

    /// Marks that a summary fetch for an unknown conversation is about to be
    /// attempted. Returns `false` if an attempt was already made this
    /// session, in which case the message is dropped.
    pub fn note_fetch_attempt(&mut self, conversation_id: ConversationId) -> bool {
        self.fetch_attempted.insert(conversation_id)
    }

    /// A successful fetch allows future unknown-conversation handling for
    /// the same id (e.g. after the conversation was locally removed).
    pub fn clear_fetch_attempt(&mut self, conversation_id: ConversationId) {
        self.fetch_attempted.remove(&conversation_id);
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
