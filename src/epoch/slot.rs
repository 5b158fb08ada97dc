/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The agreement state of a single `(epoch, seq_no)` slot.
//!
//! ```text
//! Unassigned ---> Preprepared ---> Prepared ---> Committed
//! ```
//!
//! A slot only ever moves forward through these phases. A slot that saw evidence of equivocation is
//! marked as conflicted, and stays in the phase it was in.

use crate::{
    actions::{PEntry, QEntry},
    types::{
        data_types::{BucketID, Digest, EpochNumber, NodeID, SeqNo},
        network_config::NetworkConfig,
        requests::{PreprocessResult, RequestRef},
    },
};

use super::certificates::{Collected, VoteCollector};

/// The phase of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// No preprepare has been sent or accepted for the slot.
    Unassigned,
    /// The slot's leader proposed a batch, which is being (or has been) digested locally.
    Preprepared,
    /// A prepare certificate for the local digest was collected.
    Prepared,
    /// A commit certificate for the local digest was collected.
    Committed,
}

/// Where the content of a slot stands, locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Content {
    /// Nothing is known about the content yet (only votes arrived).
    Unknown,
    /// A preprepare arrived, but some of the requests it references are not yet ready locally.
    Waiting(Vec<RequestRef>),
    /// The batch was handed out for digesting.
    Processing(Vec<RequestRef>),
    /// The batch was digested.
    Digested(Vec<RequestRef>, Digest),
}

impl Content {
    pub(crate) fn batch(&self) -> Option<&[RequestRef]> {
        match self {
            Content::Unknown => None,
            Content::Waiting(batch) | Content::Processing(batch) | Content::Digested(batch, _) => {
                Some(batch)
            }
        }
    }

    pub(crate) fn digest(&self) -> Option<&Digest> {
        match self {
            Content::Digested(_, digest) => Some(digest),
            _ => None,
        }
    }
}

pub(crate) struct Slot {
    pub(crate) epoch: EpochNumber,
    pub(crate) seq_no: SeqNo,
    pub(crate) bucket: BucketID,
    pub(crate) leader: NodeID,
    pub(crate) phase: Phase,
    pub(crate) content: Content,
    /// The requests of a batch cut by the local replica, kept to forward them with the preprepare.
    pub(crate) requests: Vec<PreprocessResult>,
    /// Whether the leader's preprepare, the first unit of prepare evidence, was received.
    pub(crate) preprepare_received: bool,
    pub(crate) prepares: VoteCollector,
    pub(crate) commits: VoteCollector,
    pub(crate) conflicted: bool,
}

impl Slot {
    pub(crate) fn new(epoch: EpochNumber, seq_no: SeqNo, bucket: BucketID, leader: NodeID) -> Slot {
        Slot {
            epoch,
            seq_no,
            bucket,
            leader,
            phase: Phase::Unassigned,
            content: Content::Unknown,
            requests: Vec::new(),
            preprepare_received: false,
            prepares: VoteCollector::new(),
            commits: VoteCollector::new(),
            conflicted: false,
        }
    }

    pub(crate) fn digest(&self) -> Option<&Digest> {
        self.content.digest()
    }

    /// The slot's batch, as persisted and delivered. `None` until the batch is digested.
    pub(crate) fn q_entry(&self) -> Option<QEntry> {
        match &self.content {
            Content::Digested(batch, digest) => Some(QEntry {
                epoch: self.epoch,
                seq_no: self.seq_no,
                digest: digest.clone(),
                requests: batch.clone(),
            }),
            _ => None,
        }
    }

    pub(crate) fn p_entry(&self) -> Option<PEntry> {
        self.digest().map(|digest| PEntry {
            epoch: self.epoch,
            seq_no: self.seq_no,
            digest: digest.clone(),
        })
    }

    pub(crate) fn collect_prepare(&mut self, voter: NodeID, digest: Digest) -> Collected {
        self.prepares.collect(voter, digest)
    }

    pub(crate) fn collect_commit(&mut self, voter: NodeID, digest: Digest) -> Collected {
        self.commits.collect(voter, digest)
    }

    /// Whether the slot may move from `Preprepared` to `Prepared`.
    ///
    /// Requires the local digest, the leader's preprepare, and `2F` matching prepares. The leader's
    /// preprepare completes these to `2F + 1` units of evidence.
    pub(crate) fn can_prepare(&self, network_config: &NetworkConfig) -> bool {
        if self.conflicted || self.phase != Phase::Preprepared || !self.preprepare_received {
            return false;
        }
        match self.digest() {
            Some(digest) => self.prepares.count(digest) >= network_config.prepare_quorum(),
            None => false,
        }
    }

    /// Whether the slot may move from `Prepared` to `Committed`.
    ///
    /// Requires `2F + 1` matching commits, the local replica's own included.
    pub(crate) fn can_commit(&self, network_config: &NetworkConfig) -> bool {
        if self.conflicted || self.phase != Phase::Prepared {
            return false;
        }
        match self.digest() {
            Some(digest) => self.commits.count(digest) >= network_config.intersection_quorum(),
            None => false,
        }
    }

    /// A digest other than the local one that is backed by `F + 1` distinct replicas across
    /// prepares and commits, if any. Such a digest proves that the leader equivocated.
    pub(crate) fn competing_digest(&self, network_config: &NetworkConfig) -> Option<Digest> {
        let local = self.digest()?;
        let mut candidates: Vec<&Digest> = self
            .prepares
            .dissenters(local)
            .chain(self.commits.dissenters(local))
            .map(|(_, digest)| digest)
            .collect();
        candidates.sort();
        candidates.dedup();

        candidates.into_iter().find_map(|candidate| {
            let mut supporters = self.prepares.supporters(candidate);
            supporters.extend(self.commits.supporters(candidate));
            if supporters.len() >= network_config.weak_quorum() {
                Some(candidate.clone())
            } else {
                None
            }
        })
    }
}
