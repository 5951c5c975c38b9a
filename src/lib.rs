//! A Byzantine fault-tolerant state machine replication engine in the PBFT family.
//!
//! PBFT-rs replicates an ordered log of proposals over a fixed set of validators. Each height (a
//! 'sequence') is decided by a three-phase exchange — pre-prepare, prepare, commit — driven by a
//! per-node state machine, with a round-change sub-protocol that recovers liveness when a round's
//! proposer is faulty or the network misbehaves. Safety holds for up to `f = ⌊(n - 1) / 3⌋`
//! Byzantine validators; liveness holds under partial synchrony.
//!
//! ## Using the engine
//!
//! The engine ([`Pbft`](engine::Pbft)) is deliberately unaware of how proposals are produced, how
//! messages travel, or how committed proposals are persisted. These are injected capabilities:
//!
//! 1. A [`Backend`](backend::Backend) supplies proposals, validates them, and accepts the sealed
//!    result of each sequence.
//! 2. A [`Transport`](transport::Transport) broadcasts outbound messages; inbound messages are
//!    pushed through the engine's [`MessageHandle`](engine::MessageHandle).
//! 3. A [`ValidatorKey`](backend::ValidatorKey) identifies this node and signs committed seals.
//! 4. A [`StateNotifier`](notifier::StateNotifier) observes timeouts and mediates message reads,
//!    which is what makes deterministic trace replay possible.
//!
//! One call to [`Pbft::run`](engine::Pbft::run) decides one sequence: the caller is expected to
//! loop, installing a fresh [`Backend`](backend::Backend) for every height, and to consult
//! [`Pbft::state`](engine::Pbft::state) to distinguish a sealed sequence
//! ([`Done`](engine::PbftState::Done)) from a node that has fallen behind its peers
//! ([`Sync`](engine::PbftState::Sync)).

pub mod backend;

pub mod engine;

pub mod keypair;

pub(crate) mod logging;

pub mod message_log;

pub mod messages;

pub mod notifier;

pub mod timers;

pub mod transport;

pub mod types;

pub mod validator_set;

// Re-exports of the types that make up the engine's API surface.
pub use backend::{Backend, BackendError, ValidatorKey};
pub use engine::{CancelToken, MessageHandle, Pbft, PbftConfig, PbftError, PbftState};
pub use messages::{MessageReq, MsgType, PreparedCertificate};
pub use notifier::{DefaultStateNotifier, MessageReader, StateNotifier};
pub use transport::{Transport, TransportHandler};
pub use types::{CommittedSeal, NodeID, Proposal, RoundInfo, SealedProposal, View};
pub use validator_set::{ValidatorList, ValidatorSet};
