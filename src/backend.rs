//! The application-facing capability set the engine is parameterized over.
//!
//! The engine decides *that* a proposal is agreed on; the [`Backend`] decides *what* is proposed,
//! whether a received proposal is acceptable, and what happens to the sealed result. A fresh
//! backend is installed with [`Pbft::set_backend`](crate::engine::Pbft::set_backend) before every
//! sequence, so a backend instance only ever answers for a single height.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::types::{NodeID, Proposal, RoundInfo, SealedProposal};
use crate::validator_set::ValidatorSet;

/// An error reported by a [`Backend`] or [`ValidatorKey`] implementation.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BackendError(String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for BackendError {}

impl From<&str> for BackendError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// The application hooks consumed by the engine while deciding one sequence.
pub trait Backend: Send {
    /// The sequence this backend answers for: the next height to decide.
    fn height(&self) -> u64;

    /// Produce a proposal for this sequence. Called only when this node is the round's proposer
    /// and holds no locked proposal.
    fn build_proposal(&self) -> Result<Proposal, BackendError>;

    /// Check a proposal received in a pre-prepare. An error sends the engine into round change.
    fn validate(&self, proposal: &Proposal) -> Result<(), BackendError>;

    /// Accept the decided output of this sequence. An error here is fatal to the sequence and
    /// surfaces out of [`Pbft::run`](crate::engine::Pbft::run).
    fn insert(&self, sealed: &SealedProposal) -> Result<(), BackendError>;

    /// The validator set deciding this sequence.
    fn validator_set(&self) -> Box<dyn ValidatorSet>;

    /// Report whether this node has fallen behind the rest of the network. `num` is the sequence
    /// the engine is currently trying to decide; the returned height is meaningful only when the
    /// flag is true. The reference implementation reports stuck only when the observed network
    /// height is strictly greater than `num`.
    fn is_stuck(&self, num: u64) -> (u64, bool);

    /// Pre-sequence hook, invoked once when the backend is installed.
    fn init(&self, _info: &RoundInfo) {}

    /// Check a commit seal received from `from`. Seals failing this check do not count towards
    /// the commit quorum.
    fn validate_commit(&self, _from: &NodeID, _seal: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }
}

/// This node's identity and its ability to produce commit seals.
///
/// Signature schemes are outside the engine's concern: the harness signs by identity, real
/// deployments use [`Ed25519Key`](crate::keypair::Ed25519Key) or their own implementation.
pub trait ValidatorKey: Send + Sync {
    fn node_id(&self) -> NodeID;

    /// Produce this node's commit seal over a proposal digest.
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, BackendError>;
}
