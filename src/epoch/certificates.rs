/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Vote collectors used to form prepare and commit certificates for a slot.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::data_types::{Digest, NodeID};

/// Result of [`VoteCollector::collect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Collected {
    /// The vote was counted.
    New,
    /// The voter already voted for the same digest.
    Duplicate,
    /// The voter already voted for a different digest, which remains the one counted.
    Conflicting { counted: Digest },
}

/// Serves to incrementally form a certificate by combining votes for the same digest from distinct
/// replicas. Only the first vote of each replica is counted.
///
/// Votes are iterated in voter order.
#[derive(Clone, Debug, Default)]
pub(crate) struct VoteCollector {
    votes: BTreeMap<NodeID, Digest>,
    tallies: HashMap<Digest, usize>,
}

impl VoteCollector {
    pub(crate) fn new() -> VoteCollector {
        Self::default()
    }

    pub(crate) fn collect(&mut self, voter: NodeID, digest: Digest) -> Collected {
        match self.votes.get(&voter) {
            Some(counted) if *counted == digest => Collected::Duplicate,
            Some(counted) => Collected::Conflicting {
                counted: counted.clone(),
            },
            None => {
                *self.tallies.entry(digest.clone()).or_insert(0) += 1;
                self.votes.insert(voter, digest);
                Collected::New
            }
        }
    }

    /// Number of distinct replicas that voted for `digest`.
    pub(crate) fn count(&self, digest: &Digest) -> usize {
        self.tallies.get(digest).copied().unwrap_or(0)
    }

    /// The replicas whose counted vote is for a digest other than `digest`.
    pub(crate) fn dissenters<'a>(
        &'a self,
        digest: &'a Digest,
    ) -> impl Iterator<Item = (NodeID, &'a Digest)> + 'a {
        self.votes
            .iter()
            .filter(move |(_, voted)| *voted != digest)
            .map(|(voter, voted)| (*voter, voted))
    }

    /// The replicas that voted for `digest`.
    pub(crate) fn supporters(&self, digest: &Digest) -> HashSet<NodeID> {
        self.votes
            .iter()
            .filter(|(_, voted)| *voted == digest)
            .map(|(voter, _)| *voter)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.votes.len()
    }
}
