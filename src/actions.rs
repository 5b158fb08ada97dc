/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The contract between the ordering core and its external collaborator.
//!
//! After every input it applies, the core hands the caller an [`Actions`] value describing the work
//! the caller must now do. Work that produces a value (digesting requests and batches, snapshotting
//! application state) is returned to the core later as an [`ActionResults`] value. Results are keyed
//! by stable identifiers (the request, `(epoch, seq_no)`, or checkpoint `seq_no`), so they may be
//! returned in any order, in any grouping, and more than once.
//!
//! The fields of `Actions` are independent batches that may be executed in any order, but the
//! recommended order is:
//! 1. Persist [`q_entries`](Actions::q_entries) and [`p_entries`](Actions::p_entries).
//! 2. Send [`broadcast`](Actions::broadcast) to every replica, the local one included.
//! 3. Compute [`preprocess`](Actions::preprocess) and [`process`](Actions::process) digests.
//! 4. Deliver [`commits`](Actions::commits) to the application, in order.
//! 5. Snapshot the application state for [`checkpoints`](Actions::checkpoints).
//!
//! [`Processor`](crate::processor::Processor) executes `Actions` in this order.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    messages::Msg,
    types::{
        data_types::{Digest, EpochNumber, NodeID, SeqNo},
        requests::{PreprocessResult, Request, RequestRef},
    },
};

/// Everything the caller must do as a consequence of one (or more) applied inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Actions {
    /// Messages to send to every replica, including the local one (as a `step`).
    pub broadcast: Vec<Msg>,
    /// Requests that need a digest. Answer with [`ActionResults::preprocessed`].
    pub preprocess: Vec<Request>,
    /// Batches that need a digest. Answer with [`ActionResults::processed`].
    pub process: Vec<Batch>,
    /// Agreed batch bodies to persist before further progress.
    pub q_entries: Vec<QEntry>,
    /// Records of prepared digests to persist before further progress.
    pub p_entries: Vec<PEntry>,
    /// Finalized batches to deliver to the application, in the given order.
    pub commits: Vec<Commit>,
    /// Sequence numbers at which the application state digest is needed. Answer with
    /// [`ActionResults::checkpoints`].
    pub checkpoints: Vec<SeqNo>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty()
            && self.preprocess.is_empty()
            && self.process.is_empty()
            && self.q_entries.is_empty()
            && self.p_entries.is_empty()
            && self.commits.is_empty()
            && self.checkpoints.is_empty()
    }
}

/// The results of the work requested by earlier [`Actions`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionResults {
    pub preprocessed: Vec<PreprocessResult>,
    pub processed: Vec<ProcessResult>,
    pub checkpoints: Vec<CheckpointResult>,
}

impl ActionResults {
    pub fn is_empty(&self) -> bool {
        self.preprocessed.is_empty() && self.processed.is_empty() && self.checkpoints.is_empty()
    }
}

/// A proposed content for one `(epoch, seq_no)` slot, waiting for its digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// The slot's leader.
    pub source: NodeID,
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub requests: Vec<PreprocessResult>,
}

/// The digest of a [`Batch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// The application state digest at a checkpoint sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointResult {
    pub seq_no: SeqNo,
    pub value: Digest,
}

/// The agreed-upon batch body for a slot, persisted once the local replica has echoed the preprepare.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QEntry {
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub requests: Vec<RequestRef>,
}

/// Durable record that the local replica prepared `digest` in a slot.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PEntry {
    pub epoch: EpochNumber,
    pub seq_no: SeqNo,
    pub digest: Digest,
}

/// A finalized batch, to be delivered to the replicated application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub q_entry: QEntry,
}
