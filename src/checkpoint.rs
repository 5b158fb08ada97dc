/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Collection of checkpoint attestations, and the admission watermarks that stable checkpoints define.
//!
//! Every `checkpoint_interval` delivered sequence numbers, each replica asks its application for the
//! digest of its state, and broadcasts the answer as a [`CheckpointMsg`]. A checkpoint becomes
//! *stable* when [`intersection_quorum`](NetworkConfig::intersection_quorum) replicas attested the
//! same `(seq_no, value)`. Stability is monotonic: the stable checkpoint only ever moves forward.
//!
//! ## Watermarks
//!
//! The stable checkpoint bounds how far ahead agreement may run:
//! - [`low_watermark`](CheckpointTracker::low_watermark) is the sequence number of the stable
//!   checkpoint.
//! - [`high_watermark`](CheckpointTracker::high_watermark) is `CHECKPOINT_WINDOW` checkpoint
//!   intervals above it, capped by the last sequence number of the active epoch.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{
    actions::CheckpointResult,
    messages::CheckpointMsg,
    state_machine::StateMachineError,
    types::{
        data_types::{Digest, NodeID, SeqNo},
        network_config::{Checkpoint, NetworkConfig},
    },
};

/// Number of checkpoint intervals that agreement may run ahead of the stable checkpoint.
pub const CHECKPOINT_WINDOW: u64 = 2;

/// Outcome of [`CheckpointTracker::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// The attestation was counted, but its checkpoint is not stable yet.
    Pending,
    /// The attestation made its checkpoint stable.
    Stable,
    /// The attestation is about a checkpoint at or below the stable one, and agrees with it, or is
    /// a repeat of an attestation already counted.
    Stale,
    /// The attestation contradicts the stable checkpoint, or an earlier attestation of the same
    /// replica.
    Divergent,
    /// The attestation is not about a checkpoint sequence number.
    Invalid,
}

/// Tracks the stable checkpoint, the attestations for newer checkpoints, and the checkpoint digests
/// requested from the local application.
pub struct CheckpointTracker {
    interval: u64,
    quorum: usize,
    stable: Checkpoint,
    attestations: BTreeMap<SeqNo, Attestations>,
    local: BTreeMap<SeqNo, Option<Digest>>,
}

#[derive(Default)]
struct Attestations {
    by_node: HashMap<NodeID, Digest>,
    by_value: HashMap<Digest, HashSet<NodeID>>,
}

impl CheckpointTracker {
    /// Create a tracker whose stable checkpoint is the genesis checkpoint.
    pub fn new(network_config: &NetworkConfig) -> CheckpointTracker {
        CheckpointTracker {
            interval: network_config.checkpoint_interval,
            quorum: network_config.intersection_quorum(),
            stable: Checkpoint::genesis(),
            attestations: BTreeMap::new(),
            local: BTreeMap::new(),
        }
    }

    pub fn stable_checkpoint(&self) -> &Checkpoint {
        &self.stable
    }

    pub fn low_watermark(&self) -> SeqNo {
        self.stable.seq_no
    }

    /// The highest sequence number that may currently be agreed on, given that the active epoch ends
    /// at `epoch_limit`.
    pub fn high_watermark(&self, epoch_limit: SeqNo) -> SeqNo {
        let window_end = self.stable.seq_no + CHECKPOINT_WINDOW.saturating_mul(self.interval);
        window_end.min(epoch_limit)
    }

    /// Whether `seq_no` is one at which checkpoints are taken.
    pub fn is_checkpoint(&self, seq_no: SeqNo) -> bool {
        seq_no.int() != 0 && seq_no.int() % self.interval == 0
    }

    /// Count `source`'s attestation that the application state after `seq_no` has digest `value`.
    pub fn apply(&mut self, source: NodeID, seq_no: SeqNo, value: Digest) -> CheckpointOutcome {
        if !self.is_checkpoint(seq_no) {
            return CheckpointOutcome::Invalid;
        }
        if seq_no < self.stable.seq_no {
            return CheckpointOutcome::Stale;
        }
        if seq_no == self.stable.seq_no {
            return if value == self.stable.value {
                CheckpointOutcome::Stale
            } else {
                CheckpointOutcome::Divergent
            };
        }

        let attestations = self.attestations.entry(seq_no).or_default();
        if let Some(attested) = attestations.by_node.get(&source) {
            return if *attested == value {
                CheckpointOutcome::Stale
            } else {
                CheckpointOutcome::Divergent
            };
        }
        attestations.by_node.insert(source, value.clone());
        let supporters = attestations.by_value.entry(value.clone()).or_default();
        supporters.insert(source);

        if supporters.len() >= self.quorum {
            self.stabilize(Checkpoint { seq_no, value });
            CheckpointOutcome::Stable
        } else {
            CheckpointOutcome::Pending
        }
    }

    /// Adopt `checkpoint` as stable if it is newer than the current stable checkpoint. Used when an
    /// epoch starts from a checkpoint certified elsewhere.
    ///
    /// Returns whether the stable checkpoint moved.
    pub fn adopt(&mut self, checkpoint: Checkpoint) -> bool {
        if checkpoint.seq_no > self.stable.seq_no {
            self.stabilize(checkpoint);
            true
        } else {
            false
        }
    }

    /// Record that the application was asked for its state digest at `seq_no`.
    pub fn request(&mut self, seq_no: SeqNo) {
        self.local.entry(seq_no).or_insert(None);
    }

    /// Accept the application's answer to an earlier [`request`](Self::request), returning the
    /// attestation to broadcast. Replays yield `None`.
    ///
    /// # Errors
    /// [`StateMachineError::UnknownCheckpoint`] if the digest at `seq_no` was never requested.
    pub fn on_result(
        &mut self,
        result: CheckpointResult,
    ) -> Result<Option<CheckpointMsg>, StateMachineError> {
        match self.local.get_mut(&result.seq_no) {
            Some(Some(_)) => Ok(None),
            Some(entry) => {
                *entry = Some(result.value.clone());
                Ok(Some(CheckpointMsg {
                    seq_no: result.seq_no,
                    value: result.value,
                }))
            }
            None if result.seq_no <= self.stable.seq_no => Ok(None),
            None => Err(StateMachineError::UnknownCheckpoint {
                seq_no: result.seq_no,
            }),
        }
    }

    /// Number of checkpoints with attestations that are not stable yet.
    pub fn pending(&self) -> usize {
        self.attestations.len()
    }

    fn stabilize(&mut self, checkpoint: Checkpoint) {
        let newer = self.attestations.split_off(&(checkpoint.seq_no + 1));
        self.attestations = newer;
        let newer = self.local.split_off(&checkpoint.seq_no);
        self.local = newer;
        self.stable = checkpoint;
    }
}
