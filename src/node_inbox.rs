/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Admission of the messages received from one replica.
//!
//! ## Epoch- and watermark-aware buffering
//!
//! A [`NodeInbox`] inspects each incoming message against the local replica's current
//! [`InboxContext`] to decide whether to:
//! 1. Deliver it to the state machine immediately.
//! 2. Place it in its queue, to be delivered once the context has caught up with it.
//! 3. Drop it.
//!
//! The policies are as follows:
//! - [`Forward`](Msg::Forward) messages are not tied to an epoch, and are deliverable.
//! - [`Checkpoint`](Msg::Checkpoint) messages are delivered immediately, even past queued messages,
//!   since they are what moves the watermarks that queued messages wait for.
//! - Slot-scoped messages (`Preprepare`, `Prepare`, `Commit`) are:
//!     - dropped, if they are for an older epoch, or for a sequence number at or below the low
//!       watermark,
//!     - dropped and recorded as a protocol violation, if they are for an epoch more than one ahead
//!       of the active epoch, or for a sequence number past the end of the active epoch,
//!     - queued, if they are for the next epoch, if no epoch is active, or if their sequence number
//!       is above the high watermark,
//!     - deliverable otherwise.
//!
//! ## Ordering
//!
//! Messages from one replica are delivered in the order they were received. Once a message is
//! queued, every later message from the same replica, deliverable or not, queues behind it.
//!
//! ## Buffer management
//!
//! The queue holds at most `capacity` bytes of (borsh-encoded) messages. A message that does not fit
//! is dropped.
//!
//! Protocol violations are counted per kind, and only the last [`RECENT_VIOLATIONS`] of them are
//! kept, so a faulty replica cannot grow its inbox by misbehaving.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    messages::Msg,
    state_machine::ProtocolViolation,
    types::data_types::{BufferSize, EpochNumber, NodeID, SeqNo},
};

/// Number of protocol violations that a [`NodeInbox`] keeps, most recent last.
pub const RECENT_VIOLATIONS: usize = 16;

/// What a [`NodeInbox`] needs to know about the local replica to classify messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InboxContext {
    /// The number of the active epoch, if any.
    pub active_epoch: Option<EpochNumber>,
    /// Messages for sequence numbers at or below this are stale.
    pub low_watermark: SeqNo,
    /// Messages for sequence numbers above this must wait.
    pub high_watermark: SeqNo,
    /// The last sequence number of the active epoch.
    pub epoch_limit: SeqNo,
}

impl InboxContext {
    /// The context of a replica with no active epoch. Every slot-scoped message is queued.
    pub fn inactive() -> InboxContext {
        InboxContext {
            active_epoch: None,
            low_watermark: SeqNo::init(),
            high_watermark: SeqNo::init(),
            epoch_limit: SeqNo::init(),
        }
    }

    /// Decide what to do with `msg` in this context, ignoring queueing order.
    pub fn classify(&self, msg: &Msg) -> Classification {
        let (epoch, seq_no) = match msg.slot() {
            Some(slot) => slot,
            None => return Classification::Deliver,
        };

        let active_epoch = match self.active_epoch {
            Some(active_epoch) => active_epoch,
            None => return Classification::Buffer,
        };

        if epoch < active_epoch {
            Classification::Drop(DropReason::Stale)
        } else if epoch == active_epoch + 1 {
            Classification::Buffer
        } else if epoch > active_epoch {
            Classification::Drop(DropReason::Violation(
                ProtocolViolation::FarFutureEpoch { epoch },
            ))
        } else if seq_no <= self.low_watermark {
            Classification::Drop(DropReason::Stale)
        } else if seq_no > self.epoch_limit {
            Classification::Drop(DropReason::Violation(
                ProtocolViolation::SeqNoOutOfRange { epoch, seq_no },
            ))
        } else if seq_no > self.high_watermark {
            Classification::Buffer
        } else {
            Classification::Deliver
        }
    }
}

/// Result of [`InboxContext::classify`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Deliver,
    Buffer,
    Drop(DropReason),
}

/// Why a message was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The message is about an epoch or a sequence number that the local replica is done with.
    Stale,
    /// The message should never have been sent.
    Violation(ProtocolViolation),
    /// The inbox's queue has no space left for the message.
    InboxFull,
    /// The message comes from a replica that is not part of the network.
    UnknownSource,
}

/// What happened to a message offered to a [`NodeInbox`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Receipt {
    /// The message must be applied to the state machine now.
    Deliver(Msg),
    /// The message was queued.
    Buffered,
    /// The message was discarded.
    Dropped(Msg, DropReason),
}

/// The inbox of the messages received from one replica.
pub struct NodeInbox {
    node: NodeID,
    capacity: BufferSize,
    size: BufferSize,
    queue: VecDeque<Msg>,
    violation_counts: BTreeMap<&'static str, u64>,
    recent_violations: VecDeque<ProtocolViolation>,
}

impl NodeInbox {
    pub fn new(node: NodeID, capacity: BufferSize) -> NodeInbox {
        NodeInbox {
            node,
            capacity,
            size: BufferSize::new(0),
            queue: VecDeque::new(),
            violation_counts: BTreeMap::new(),
            recent_violations: VecDeque::with_capacity(RECENT_VIOLATIONS),
        }
    }

    pub fn node(&self) -> NodeID {
        self.node
    }

    /// Offer a message received from this inbox's replica.
    pub fn receive(&mut self, msg: Msg, context: &InboxContext) -> Receipt {
        if let Msg::Checkpoint(_) = msg {
            return Receipt::Deliver(msg);
        }

        match context.classify(&msg) {
            Classification::Deliver if self.queue.is_empty() => Receipt::Deliver(msg),
            Classification::Deliver | Classification::Buffer => self.enqueue(msg),
            Classification::Drop(reason) => self.drop_msg(msg, reason),
        }
    }

    /// Take every message at the front of the queue that can be delivered in `context`, stopping at
    /// the first one that still has to wait. Messages that became droppable while queued are dropped.
    ///
    /// Returns the [`Deliver`](Receipt::Deliver) and [`Dropped`](Receipt::Dropped) receipts of the
    /// messages that left the queue, in queue order.
    pub fn drain(&mut self, context: &InboxContext) -> Vec<Receipt> {
        let mut receipts = Vec::new();
        while let Some(msg) = self.queue.front() {
            let classification = context.classify(msg);
            if classification == Classification::Buffer {
                break;
            }

            if let Some(msg) = self.queue.pop_front() {
                self.size -= msg.size();
                match classification {
                    Classification::Drop(reason) => receipts.push(self.drop_msg(msg, reason)),
                    _ => receipts.push(Receipt::Deliver(msg)),
                }
            }
        }
        receipts
    }

    /// Record a protocol violation committed by this inbox's replica.
    pub fn record_violation(&mut self, violation: ProtocolViolation) {
        *self.violation_counts.entry(violation.kind()).or_insert(0) += 1;
        if self.recent_violations.len() == RECENT_VIOLATIONS {
            self.recent_violations.pop_front();
        }
        self.recent_violations.push_back(violation);
    }

    /// The most recent protocol violations recorded against this inbox's replica, oldest first.
    pub fn recent_violations(&self) -> &VecDeque<ProtocolViolation> {
        &self.recent_violations
    }

    /// Number of protocol violations recorded against this inbox's replica, by kind.
    pub fn violation_counts(&self) -> &BTreeMap<&'static str, u64> {
        &self.violation_counts
    }

    /// Number of protocol violations recorded against this inbox's replica.
    pub fn violation_count(&self) -> u64 {
        self.violation_counts.values().sum()
    }

    /// Number of queued messages.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Number of bytes occupied by the queued messages.
    pub fn buffer_size(&self) -> BufferSize {
        self.size
    }

    fn enqueue(&mut self, msg: Msg) -> Receipt {
        let bytes_requested = msg.size();
        let fits = self
            .size
            .int()
            .checked_add(bytes_requested)
            .is_some_and(|new_size| new_size <= self.capacity.int());
        if !fits {
            return Receipt::Dropped(msg, DropReason::InboxFull);
        }

        self.size += bytes_requested;
        self.queue.push_back(msg);
        Receipt::Buffered
    }

    fn drop_msg(&mut self, msg: Msg, reason: DropReason) -> Receipt {
        if let DropReason::Violation(violation) = &reason {
            self.record_violation(violation.clone());
        }
        Receipt::Dropped(msg, reason)
    }
}
