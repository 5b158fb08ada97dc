/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that replicas exchange.
//!
//! Every message carries an implicit source replica, which is established (and authenticated) by
//! the transport layer, and is passed to [`StateMachine::step`](crate::state_machine::StateMachine::step)
//! alongside the message.
//!
//! [`Msg`] is a closed sum type: every component that consumes messages matches on it exhaustively,
//! so adding a variant is a compile error until each of them decides what to do with it.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::{encoded_size, Digest, EpochNumber, SeqNo},
    requests::{RequestData, RequestRef},
};

/// All messages exchanged between replicas.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Msg {
    Forward(Forward),
    Preprepare(Preprepare),
    Prepare(Prepare),
    Commit(Commit),
    Checkpoint(CheckpointMsg),
}

impl Msg {
    /// The `(epoch, seq_no)` slot the message is about, if the message is slot-scoped.
    pub fn slot(&self) -> Option<(EpochNumber, SeqNo)> {
        match self {
            Msg::Forward(_) | Msg::Checkpoint(_) => None,
            Msg::Preprepare(Preprepare { epoch, seq_no, .. })
            | Msg::Prepare(Prepare { epoch, seq_no, .. })
            | Msg::Commit(Commit { epoch, seq_no, .. }) => Some((*epoch, *seq_no)),
        }
    }

    /// Number of bytes the message occupies in its borsh encoding.
    pub fn size(&self) -> u64 {
        encoded_size(self)
    }

    /// PascalCase name of the message variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Forward(_) => "Forward",
            Msg::Preprepare(_) => "Preprepare",
            Msg::Prepare(_) => "Prepare",
            Msg::Commit(_) => "Commit",
            Msg::Checkpoint(_) => "Checkpoint",
        }
    }
}

/// Broadcast by a leader for every request of a batch it preprepares, so that replicas which have not
/// seen the request from its client can preprocess it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Forward {
    pub request_data: RequestData,
}

/// A leader's proposal for the content of one slot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Preprepare {
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub batch: Vec<RequestRef>,
}

/// A replica's vote that it has checked a slot's preprepare and computed `digest` for its batch.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// A replica's vote that it has collected a prepare certificate for `digest` in a slot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// A replica's attestation of its application state digest after committing `seq_no`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CheckpointMsg {
    pub seq_no: SeqNo,
    pub value: Digest,
}

impl From<Forward> for Msg {
    fn from(value: Forward) -> Self {
        Msg::Forward(value)
    }
}

impl From<Preprepare> for Msg {
    fn from(value: Preprepare) -> Self {
        Msg::Preprepare(value)
    }
}

impl From<Prepare> for Msg {
    fn from(value: Prepare) -> Self {
        Msg::Prepare(value)
    }
}

impl From<Commit> for Msg {
    fn from(value: Commit) -> Self {
        Msg::Commit(value)
    }
}

impl From<CheckpointMsg> for Msg {
    fn from(value: CheckpointMsg) -> Self {
        Msg::Checkpoint(value)
    }
}
