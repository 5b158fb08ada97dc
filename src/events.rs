/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that the ordering core emits, for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.
//!
//! Events are published by the serializer thread into a channel that is drained by the
//! [event bus](crate::event_bus), which runs the user's handlers. Handlers therefore never block
//! the ordering core.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    client_window::Admission,
    node_inbox::DropReason,
    state_machine::ProtocolViolation,
    types::{
        data_types::{BucketID, ClientID, Digest, EpochNumber, NodeID, ReqNo, SeqNo},
        network_config::Checkpoint,
    },
};

pub enum Event {
    // Events that change the sequencing context.
    ActivateEpoch(ActivateEpochEvent),
    StableCheckpoint(StableCheckpointEvent),
    // Events about client requests and batches.
    AdmitRequest(AdmitRequestEvent),
    CutBatch(CutBatchEvent),
    // Events about slots.
    Preprepare(PreprepareEvent),
    ReceivePreprepare(ReceivePreprepareEvent),
    Prepared(PreparedEvent),
    CommitSlot(CommitSlotEvent),
    RequestCheckpoint(RequestCheckpointEvent),
    // Events about misbehaving or unreachable peers.
    ProtocolViolation(ProtocolViolationEvent),
    DropMessage(DropMessageEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus stops before the serializer does, so its receiving end may be gone.
            let _ = event_publisher.send(event);
        }
    }
}

/// The local replica started sequencing in `epoch`.
pub struct ActivateEpochEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochNumber,
    pub leaders: Vec<NodeID>,
    pub starting_checkpoint: Checkpoint,
}

/// `checkpoint` became the stable checkpoint.
pub struct StableCheckpointEvent {
    pub timestamp: SystemTime,
    pub checkpoint: Checkpoint,
}

/// A request was offered to a client window, either by the local client-facing layer (`origin` is
/// the local replica) or in a `Forward` from `origin`.
pub struct AdmitRequestEvent {
    pub timestamp: SystemTime,
    pub origin: NodeID,
    pub client_id: ClientID,
    pub req_no: ReqNo,
    pub admission: Admission,
}

/// The local replica, as leader of `bucket`, cut a batch into `seq_no`.
pub struct CutBatchEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub bucket: BucketID,
    pub requests: usize,
}

/// The local replica, as leader, broadcast a preprepare.
pub struct PreprepareEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// The local replica accepted a preprepare from the leader `origin`.
pub struct ReceivePreprepareEvent {
    pub timestamp: SystemTime,
    pub origin: NodeID,
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub requests: usize,
}

/// The local replica collected a prepare certificate, and broadcast its commit.
pub struct PreparedEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// The local replica collected a commit certificate. The slot is delivered once every slot before
/// it is.
pub struct CommitSlotEvent {
    pub timestamp: SystemTime,
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// The local replica asked the application for its state digest after `seq_no`.
pub struct RequestCheckpointEvent {
    pub timestamp: SystemTime,
    pub seq_no: SeqNo,
}

/// `origin` committed a protocol violation.
pub struct ProtocolViolationEvent {
    pub timestamp: SystemTime,
    pub origin: NodeID,
    pub violation: ProtocolViolation,
}

/// A message received from `origin` was discarded.
pub struct DropMessageEvent {
    pub timestamp: SystemTime,
    pub origin: NodeID,
    pub kind: &'static str,
    pub reason: DropReason,
}
