/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The data types that consensus decides over: proposals, sealed proposals, views, and the
//! identifiers of the validators that decide them.

use std::fmt::{self, Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Opaque, stable identifier of a validator.
///
/// The engine never interprets the contents of a `NodeID`; it only compares them. Ordering is the
/// lexicographic order of the underlying bytes, so a set of `NodeID`s has the same deterministic
/// order on every node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeID(String);

impl NodeID {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this is the empty identifier, which appears in wire form only inside
    /// timeout markers of recorded traces.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeID {
    fn from(s: &str) -> Self {
        NodeID(s.to_string())
    }
}

impl From<String> for NodeID {
    fn from(s: String) -> Self {
        NodeID(s)
    }
}

impl Display for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// A point in the protocol's progression: the `sequence` (height) being decided, and the `round`
/// of attempts within that sequence. Rounds start at 0 and only ever increase within a sequence.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

impl View {
    pub fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "(sequence {}, round {})", self.sequence, self.round)
    }
}

/// An application-level proposal: opaque bytes, their SHA-256 digest, and the earliest wall-clock
/// time (Unix milliseconds) at which the proposer should broadcast it.
///
/// Two proposals are equal iff their `data` are equal. The digest and the timestamp are derived
/// and advisory respectively, so they deliberately do not participate in equality.
#[derive(Clone, Eq, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub data: Vec<u8>,
    pub hash: Vec<u8>,
    pub timestamp: u64,
}

impl Proposal {
    /// Create a proposal over `data`, computing its digest.
    pub fn new(data: Vec<u8>, timestamp: u64) -> Self {
        let hash = digest(&data);
        Self {
            data,
            hash,
            timestamp,
        }
    }
}

impl PartialEq for Proposal {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

/// Compute the digest of proposal data.
pub fn digest(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// Current wall-clock time in Unix milliseconds, the unit of [`Proposal::timestamp`].
pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A commit signature contributed by one validator: the final evidence bound into a
/// [`SealedProposal`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CommittedSeal {
    pub from: NodeID,
    pub seal: Vec<u8>,
}

/// The output of a decided sequence: the proposal together with the proposer that issued it, the
/// sequence number it was decided at, and the commit seals of a quorum (at least `2f + 1` distinct
/// validators) that decided it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SealedProposal {
    pub proposal: Proposal,
    pub proposer: NodeID,
    pub number: u64,
    pub committed_seals: Vec<CommittedSeal>,
}

/// Information handed to [`Backend::init`](crate::backend::Backend::init) when the engine begins
/// a sequence.
#[derive(Clone, Copy, Debug)]
pub struct RoundInfo {
    pub sequence: u64,
    pub round: u64,
}
