/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store numbers or bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use borsh::{BorshDeserialize, BorshSerialize};

/// Identity of a replica, as established by the transport layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeID(u64);

impl NodeID {
    /// Create a new `NodeID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `NodeID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", self.0)
    }
}

/// Number of an epoch, i.e., of one era of sequencing under a fixed leader set.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct EpochNumber(u64);

impl EpochNumber {
    /// Create a new `EpochNumber` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `EpochNumber`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for EpochNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for EpochNumber {
    type Output = EpochNumber;
    fn add(self, rhs: u64) -> Self::Output {
        EpochNumber::new(self.0 + rhs)
    }
}

/// Position of a batch in the agreed total order.
///
/// Sequence numbers are global across buckets: bucket `b` of an epoch owns every
/// `number_of_buckets`-th sequence number, starting from the epoch's first one.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshDeserialize,
    BorshSerialize,
)]
pub struct SeqNo(u64);

impl SeqNo {
    /// Create a new `SeqNo` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `SeqNo`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Sequence number zero. Denotes "nothing committed yet".
    pub const fn init() -> Self {
        Self(0)
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SeqNo {
    type Output = SeqNo;
    fn add(self, rhs: u64) -> Self::Output {
        SeqNo::new(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for SeqNo {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

impl Sub<SeqNo> for SeqNo {
    type Output = u64;
    fn sub(self, rhs: SeqNo) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Request number of a client request. Numbering starts at 1 for every client.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ReqNo(u64);

impl ReqNo {
    /// Create a new `ReqNo` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `ReqNo`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// The first request number a client may use.
    pub const fn first() -> Self {
        Self(1)
    }
}

impl Display for ReqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for ReqNo {
    type Output = ReqNo;
    fn add(self, rhs: u64) -> Self::Output {
        ReqNo::new(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for ReqNo {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

/// Index of a bucket, i.e., of a partition of the sequence number space driven by one leader.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BucketID(u64);

impl BucketID {
    /// Create a new `BucketID` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `BucketID`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for BucketID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Opaque identifier of a client.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ClientID(Vec<u8>);

impl ClientID {
    /// Create a new `ClientID` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the bytes of this `ClientID`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for ClientID {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for ClientID {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Debug for ClientID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ClientID({})", String::from_utf8_lossy(&self.0))
    }
}

impl Display for ClientID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Deterministic content fingerprint of a request, a batch, or application state.
///
/// Digests are computed outside of the state machine. The state machine only ever compares them for
/// equality, so any byte string, of any length, is a valid `Digest`.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Create a new `Digest` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the bytes of this `Digest`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Digest {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({:?})", self.0)
    }
}

/// Size of a message buffer, in bytes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BufferSize(u64);

impl BufferSize {
    /// Create a new `BufferSize` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `BufferSize`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl AddAssign<u64> for BufferSize {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs)
    }
}

impl SubAssign<u64> for BufferSize {
    fn sub_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_sub(rhs)
    }
}

/// Number of borsh-encoded bytes of `value`.
///
/// Encoding into a `Vec` cannot fail for the types in this crate. Should it ever, the value is
/// treated as infinitely large so that size-bounded buffers refuse it.
pub(crate) fn encoded_size<T: BorshSerialize>(value: &T) -> u64 {
    value
        .try_to_vec()
        .map(|bytes| bytes.len() as u64)
        .unwrap_or(u64::MAX)
}
