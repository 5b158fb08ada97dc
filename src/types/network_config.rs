/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cluster-wide parameters ([`NetworkConfig`]) and per-epoch parameters ([`EpochConfig`]).
//!
//! ## Quorums
//!
//! All quorum thresholds used anywhere in the crate are computed by the methods of [`NetworkConfig`]
//! in this module, and nowhere else. With `N >= 3F + 1` replicas of which at most `F` are faulty:
//!
//! | Threshold | Value | Used for |
//! |---|---|---|
//! | [`intersection_quorum`](NetworkConfig::intersection_quorum) | `2F + 1` | commit certificates, checkpoint stability |
//! | [`prepare_quorum`](NetworkConfig::prepare_quorum) | `2F` | prepare certificates |
//! | [`weak_quorum`](NetworkConfig::weak_quorum) | `F + 1` | proof that a conflicting digest is backed by a correct replica |
//!
//! The prepare quorum is `2F` rather than `2F + 1` because the leader's preprepare is the first unit of
//! prepare evidence, and the leader never sends a `Prepare` of its own. `2F` matching prepares from
//! distinct non-leader replicas plus the preprepare make up `2F + 1` replicas in total.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest as _, Sha256};

use super::data_types::{BucketID, ClientID, Digest, EpochNumber, NodeID, SeqNo};

/// Cluster-wide parameters, fixed for the life of an epoch.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NetworkConfig {
    /// Every replica in the cluster, in a canonical order.
    pub nodes: Vec<NodeID>,
    /// Maximum number of faulty replicas tolerated.
    pub f: u64,
    /// Number of partitions of the sequence number space.
    pub number_of_buckets: u64,
    /// Number of sequence numbers between two checkpoints.
    pub checkpoint_interval: u64,
    /// Number of sequence numbers an epoch may assign.
    pub max_epoch_length: u64,
}

impl NetworkConfig {
    /// Check that the parameters describe a cluster this crate can run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        let required = self.f.saturating_mul(3).saturating_add(1);
        if (self.nodes.len() as u64) < required {
            return Err(ConfigError::TooFewNodes {
                nodes: self.nodes.len() as u64,
                f: self.f,
            });
        }
        if self.number_of_buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::ZeroCheckpointInterval);
        }
        if self.max_epoch_length == 0 {
            return Err(ConfigError::ZeroEpochLength);
        }
        Ok(())
    }

    /// `2F + 1`: any two sets of this size intersect in at least one correct replica.
    pub fn intersection_quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// `2F`: matching prepares from distinct non-leader replicas needed on top of the leader's
    /// preprepare.
    pub fn prepare_quorum(&self) -> usize {
        (2 * self.f) as usize
    }

    /// `F + 1`: any set of this size contains at least one correct replica.
    pub fn weak_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    pub fn contains(&self, node: NodeID) -> bool {
        self.nodes.contains(&node)
    }

    /// The bucket that every request of `client_id` is ordered in.
    ///
    /// The first eight bytes of the SHA256 hash of the client id, read as a big-endian integer, modulo
    /// the number of buckets.
    pub fn client_bucket(&self, client_id: &ClientID) -> BucketID {
        let hash = Sha256::digest(client_id.bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash[..8]);
        BucketID::new(u64::from_be_bytes(prefix) % self.number_of_buckets)
    }
}

/// A checkpoint: the sequence number it was taken at, and the application state digest at that point.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub seq_no: SeqNo,
    pub value: Digest,
}

impl Checkpoint {
    /// The checkpoint every cluster starts from: sequence number 0 with an empty digest.
    pub fn genesis() -> Checkpoint {
        Checkpoint {
            seq_no: SeqNo::init(),
            value: Digest::default(),
        }
    }
}

/// Identifies one epoch: its number, its ordered leader set, and the checkpoint it resumes from.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct EpochConfig {
    pub number: EpochNumber,
    pub leaders: Vec<NodeID>,
    pub starting_checkpoint: Checkpoint,
}

impl EpochConfig {
    /// Check that the epoch can run on the cluster described by `network_config`.
    pub fn validate(&self, network_config: &NetworkConfig) -> Result<(), ConfigError> {
        if self.leaders.is_empty() {
            return Err(ConfigError::NoLeaders);
        }
        if let Some(leader) = self
            .leaders
            .iter()
            .find(|leader| !network_config.contains(**leader))
        {
            return Err(ConfigError::UnknownLeader(*leader));
        }
        Ok(())
    }
}

/// Reasons why a configuration was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    NoNodes,
    TooFewNodes { nodes: u64, f: u64 },
    ZeroBuckets,
    ZeroCheckpointInterval,
    ZeroEpochLength,
    /// `Configuration::tick_interval` is zero, so the serializer would do nothing but tick.
    ZeroTickInterval,
    NoLeaders,
    UnknownLeader(NodeID),
    /// The local replica's id is not one of `NetworkConfig::nodes`.
    UnknownSelf(NodeID),
    /// Epochs may only be activated in increasing order of their numbers.
    StaleEpoch {
        active: EpochNumber,
        proposed: EpochNumber,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoNodes => write!(f, "network config lists no nodes"),
            ConfigError::TooFewNodes { nodes, f: faults } => write!(
                f,
                "{} nodes cannot tolerate {} faults, at least {} are required",
                nodes,
                faults,
                3 * faults + 1
            ),
            ConfigError::ZeroBuckets => write!(f, "number of buckets must be positive"),
            ConfigError::ZeroCheckpointInterval => {
                write!(f, "checkpoint interval must be positive")
            }
            ConfigError::ZeroEpochLength => write!(f, "max epoch length must be positive"),
            ConfigError::ZeroTickInterval => write!(f, "tick interval must be positive"),
            ConfigError::NoLeaders => write!(f, "epoch config lists no leaders"),
            ConfigError::UnknownLeader(leader) => {
                write!(f, "leader {} is not a node of the network", leader)
            }
            ConfigError::UnknownSelf(id) => {
                write!(f, "local id {} is not a node of the network", id)
            }
            ConfigError::StaleEpoch { active, proposed } => write!(
                f,
                "cannot activate epoch {} while epoch {} is active",
                proposed, active
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
