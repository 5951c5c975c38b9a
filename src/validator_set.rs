/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The set of validators deciding a sequence, and the deterministic proposer rotation over it.

use crate::types::NodeID;

/// An ordered set of validators with a deterministic proposer-selection function.
///
/// The engine obtains one instance per sequence from the
/// [`Backend`](crate::backend::Backend), so membership is fixed for the duration of a sequence.
/// All nodes must observe the same ordering for proposer selection to agree.
pub trait ValidatorSet: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of `id` in the set's ordering, if it is a member.
    fn index(&self, id: &NodeID) -> Option<usize>;

    fn includes(&self, id: &NodeID) -> bool {
        self.index(id).is_some()
    }

    /// The validator that proposes at `(sequence, round)`.
    ///
    /// `last_proposer` is the validator that sealed `sequence - 1`, or `None` at the start of the
    /// log. Implementations that capture this context at construction time are free to ignore the
    /// parameter.
    fn calc_proposer(&self, round: u64, sequence: u64, last_proposer: Option<&NodeID>) -> NodeID;

    /// Maximum number of faulty validators the set tolerates: `⌊(n - 1) / 3⌋`.
    fn max_faulty(&self) -> usize {
        self.len().saturating_sub(1) / 3
    }

    /// Number of distinct senders that constitutes a quorum: `2f + 1`.
    fn quorum_size(&self) -> usize {
        2 * self.max_faulty() + 1
    }
}

/// The standard [`ValidatorSet`]: a list of node identifiers in a fixed order, rotating the
/// proposer round-robin from the previous sequence's proposer.
///
/// Selection picks `nodes[(offset + round + 1) mod n]` where `offset` is the index of the last
/// proposer. When there is no last proposer (the start of the log), the seed degenerates to
/// `round` — offset zero and no `+1`. This exact degenerate form is load-bearing: recorded traces
/// were produced with it.
#[derive(Clone, Debug)]
pub struct ValidatorList {
    nodes: Vec<NodeID>,
    last_proposer: Option<NodeID>,
}

impl ValidatorList {
    /// Create a validator list with the given membership order and no last proposer.
    pub fn new(nodes: Vec<NodeID>) -> Self {
        Self {
            nodes,
            last_proposer: None,
        }
    }

    /// Record the proposer that sealed the previous sequence, shifting the rotation.
    pub fn with_last_proposer(mut self, last_proposer: Option<NodeID>) -> Self {
        self.last_proposer = last_proposer;
        self
    }

    pub fn nodes(&self) -> &[NodeID] {
        &self.nodes
    }
}

impl ValidatorSet for ValidatorList {
    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn index(&self, id: &NodeID) -> Option<usize> {
        self.nodes.iter().position(|n| n == id)
    }

    fn calc_proposer(&self, round: u64, _sequence: u64, last_proposer: Option<&NodeID>) -> NodeID {
        let last = last_proposer.or(self.last_proposer.as_ref());
        let seed = match last {
            None => round,
            Some(lp) => {
                let offset = self.index(lp).unwrap_or(0) as u64;
                offset + round + 1
            }
        };
        let pick = (seed % self.nodes.len() as u64) as usize;
        self.nodes[pick].clone()
    }
}
