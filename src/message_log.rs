/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-node store of received consensus messages.
//!
//! All inbound messages pass through [`MessageLog::insert`], which applies the checks that do not
//! need the application: sequence gating (past sequences are dropped, future sequences are
//! buffered), validator-set membership, structural shape, expected-proposer checks for
//! pre-prepares, and deduplication on the `(type, round, sender)` key. Accepted messages stay in
//! the log so quorum queries ([`prepare_count`](MessageLog::prepare_count),
//! [`commit_count`](MessageLog::commit_count),
//! [`round_change_count`](MessageLog::round_change_count)) count distinct senders without the
//! state machine tracking votes itself.
//!
//! The log also owns the two pieces of round-change bookkeeping that would otherwise bloat the
//! state machine: finding the highest round backed by enough distinct senders
//! ([`max_round`](MessageLog::max_round)), and picking the highest-round prepared certificate
//! among the round changes of a round ([`best_certificate`](MessageLog::best_certificate)).
//!
//! ## Read policy
//!
//! [`read_next`](MessageLog::read_next) serves messages for the current `(sequence, round)` in
//! phase order (pre-prepare before prepare before commit before round change), then round-change
//! messages from future rounds of the sequence, which is what feeds the round-change
//! accelerators. Messages from strictly past rounds are discarded on the way, with two
//! exemptions: round changes survive (they justify certificate selection at any round), and
//! commits for the locked digest survive (a lock outlives the round it was taken in).

use std::collections::BTreeMap;

use crate::messages::{MessageReq, MsgType, PreparedCertificate};
use crate::types::{CommittedSeal, NodeID, View};
use crate::validator_set::ValidatorSet;

/// The result of offering a message to the log.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored (or buffered for a future sequence).
    Accepted,
    /// An identical message from this sender was already stored.
    Duplicate,
    /// This sender already sent a different message at the same `(type, round)`. The original is
    /// retained; the new message is dropped and the conflict reported as a fault signal.
    Conflict,
    Rejected(RejectReason),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The message belongs to an already-decided sequence.
    StaleSequence,
    /// The sender is not in the validator set of this sequence.
    UnknownSender,
    /// A pre-prepare from a validator that is not the proposer of its round.
    NotProposer,
    /// Structurally malformed (see [`MessageReq::check_shape`]).
    BadShape(&'static str),
    /// No validator set installed yet; the engine has no backend for this sequence.
    NotReady,
    /// The future-sequence buffer is full and this message lost the eviction contest.
    BufferFull,
}

struct Entry {
    msg: MessageReq,
    read: bool,
}

pub struct MessageLog {
    sequence: u64,
    round: u64,
    locked_digest: Option<Vec<u8>>,
    validators: Option<Box<dyn ValidatorSet>>,
    /// Accepted messages of the current sequence, keyed by (round, type, sender).
    entries: BTreeMap<(u64, MsgType, NodeID), Entry>,
    /// Messages for sequences we have not reached yet, drained on reset.
    future: BTreeMap<u64, Vec<MessageReq>>,
    future_len: usize,
    max_future: usize,
}

impl MessageLog {
    pub fn new(max_future: usize) -> Self {
        Self {
            sequence: 0,
            round: 0,
            locked_digest: None,
            validators: None,
            entries: BTreeMap::new(),
            future: BTreeMap::new(),
            future_len: 0,
            max_future,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Begin a new sequence: drop the previous sequence's messages, install the validator set,
    /// and replay any messages that were buffered for this sequence through the ingress checks.
    pub fn reset(&mut self, sequence: u64, validators: Box<dyn ValidatorSet>) {
        self.sequence = sequence;
        self.round = 0;
        self.locked_digest = None;
        self.validators = Some(validators);
        self.entries.clear();

        let stale: Vec<u64> = self
            .future
            .range(..=sequence)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in stale {
            if let Some(buffered) = self.future.remove(&seq) {
                self.future_len -= buffered.len();
                if seq == sequence {
                    for msg in buffered {
                        let _ = self.insert(msg);
                    }
                }
            }
        }
    }

    /// Record the engine's movement to a new round. Stale rounds are pruned on the next read.
    pub fn set_round(&mut self, round: u64) {
        self.round = round;
    }

    /// Record the digest the engine has locked on, exempting its commits from round pruning.
    pub fn set_locked_digest(&mut self, digest: Option<Vec<u8>>) {
        self.locked_digest = digest;
    }

    pub fn insert(&mut self, msg: MessageReq) -> InsertOutcome {
        if msg.view.sequence < self.sequence {
            return InsertOutcome::Rejected(RejectReason::StaleSequence);
        }
        if msg.view.sequence > self.sequence {
            return self.buffer_future(msg);
        }

        if let Err(reason) = msg.check_shape() {
            return InsertOutcome::Rejected(RejectReason::BadShape(reason));
        }
        let validators = match &self.validators {
            Some(validators) => validators,
            None => return InsertOutcome::Rejected(RejectReason::NotReady),
        };
        if !validators.includes(&msg.from) {
            return InsertOutcome::Rejected(RejectReason::UnknownSender);
        }
        if msg.msg_type == MsgType::PrePrepare {
            let proposer = validators.calc_proposer(msg.view.round, msg.view.sequence, None);
            if proposer != msg.from {
                return InsertOutcome::Rejected(RejectReason::NotProposer);
            }
        }

        let key = (msg.view.round, msg.msg_type, msg.from.clone());
        match self.entries.get(&key) {
            None => {
                self.entries.insert(key, Entry { msg, read: false });
                InsertOutcome::Accepted
            }
            Some(existing) if existing.msg == msg => InsertOutcome::Duplicate,
            Some(_) => InsertOutcome::Conflict,
        }
    }

    fn buffer_future(&mut self, msg: MessageReq) -> InsertOutcome {
        if self.future_len >= self.max_future {
            // Make room by evicting from the most distant sequence; if the newcomer is itself
            // the most distant, it loses.
            match self.future.iter().next_back().map(|(seq, _)| *seq) {
                Some(highest) if msg.view.sequence < highest => {
                    if let Some(queue) = self.future.get_mut(&highest) {
                        queue.pop();
                        self.future_len -= 1;
                        if queue.is_empty() {
                            self.future.remove(&highest);
                        }
                    }
                }
                _ => return InsertOutcome::Rejected(RejectReason::BufferFull),
            }
        }
        self.future.entry(msg.view.sequence).or_default().push(msg);
        self.future_len += 1;
        InsertOutcome::Accepted
    }

    /// Pop the next message to process, per the module-level read policy, together with the
    /// stale messages this read discarded.
    pub fn read_next(&mut self) -> (Option<MessageReq>, Vec<MessageReq>) {
        let discards = self.discard_stale_rounds();

        // Current round, in phase order. Key iteration order is (round, type, sender), so the
        // first unread hit is the priority pick.
        let current = self
            .entries
            .iter_mut()
            .filter(|((round, _, _), _)| *round == self.round)
            .find(|(_, entry)| !entry.read);
        if let Some((_, entry)) = current {
            entry.read = true;
            return (Some(entry.msg.clone()), discards);
        }

        // Future rounds: only round changes are actionable ahead of time (they drive the weak
        // and full quorum accelerators); everything else waits for its round.
        let future = self
            .entries
            .iter_mut()
            .filter(|((round, msg_type, _), _)| {
                *round > self.round && *msg_type == MsgType::RoundChange
            })
            .find(|(_, entry)| !entry.read);
        if let Some((_, entry)) = future {
            entry.read = true;
            return (Some(entry.msg.clone()), discards);
        }

        (None, discards)
    }

    /// Whether any unconsumed message remains: an unread entry at or above the current round, or
    /// anything buffered for a future sequence.
    pub fn has_messages(&self) -> bool {
        self.future_len > 0
            || self
                .entries
                .iter()
                .any(|((round, _, _), entry)| *round >= self.round && !entry.read)
    }

    fn discard_stale_rounds(&mut self) -> Vec<MessageReq> {
        let round = self.round;
        let locked = self.locked_digest.clone();
        let mut discards = Vec::new();
        self.entries.retain(|(entry_round, msg_type, _), entry| {
            if *entry_round >= round {
                return true;
            }
            match msg_type {
                MsgType::RoundChange => true,
                MsgType::Commit if Some(&entry.msg.digest) == locked.as_ref() => true,
                _ => {
                    if !entry.read {
                        discards.push(entry.msg.clone());
                    }
                    false
                }
            }
        });
        discards
    }

    /// Distinct senders that prepared `digest` at `round`.
    pub fn prepare_count(&self, round: u64, digest: &[u8]) -> usize {
        self.entries
            .iter()
            .filter(|((entry_round, msg_type, _), entry)| {
                *entry_round == round
                    && *msg_type == MsgType::Prepare
                    && entry.msg.digest == digest
            })
            .count()
    }

    /// Distinct senders that committed to `digest` at any round of this sequence.
    pub fn commit_count(&self, digest: &[u8]) -> usize {
        self.committed_seals(digest).len()
    }

    /// The seals of all distinct senders that committed to `digest`, at any round of this
    /// sequence. A sender that committed in several rounds contributes one seal.
    pub fn committed_seals(&self, digest: &[u8]) -> Vec<CommittedSeal> {
        let mut seals: Vec<CommittedSeal> = Vec::new();
        for ((_, msg_type, from), entry) in &self.entries {
            if *msg_type != MsgType::Commit || entry.msg.digest != digest {
                continue;
            }
            if seals.iter().any(|s| &s.from == from) {
                continue;
            }
            if let Some(seal) = &entry.msg.seal {
                seals.push(CommittedSeal {
                    from: from.clone(),
                    seal: seal.clone(),
                });
            }
        }
        seals
    }

    /// Drop every commit from `from`, for when the application rejects its seal.
    pub fn remove_commits_from(&mut self, from: &NodeID) {
        self.entries
            .retain(|(_, msg_type, sender), _| !(*msg_type == MsgType::Commit && sender == from));
    }

    /// Distinct senders that requested a change to exactly `round`.
    pub fn round_change_count(&self, round: u64) -> usize {
        self.entries
            .iter()
            .filter(|((entry_round, msg_type, _), _)| {
                *entry_round == round && *msg_type == MsgType::RoundChange
            })
            .count()
    }

    /// The highest round for which at least `min_senders` distinct senders sent a round change,
    /// if any.
    pub fn max_round(&self, min_senders: usize) -> Option<u64> {
        let mut per_round: BTreeMap<u64, usize> = BTreeMap::new();
        for ((round, msg_type, _), _) in &self.entries {
            if *msg_type == MsgType::RoundChange {
                *per_round.entry(*round).or_default() += 1;
            }
        }
        per_round
            .into_iter()
            .filter(|(_, senders)| *senders >= min_senders)
            .map(|(round, _)| round)
            .next_back()
    }

    /// The lowest round at or above `from_round` whose round changes reach `min_senders`
    /// distinct senders.
    pub fn quorum_round(&self, from_round: u64, min_senders: usize) -> Option<u64> {
        let mut per_round: BTreeMap<u64, usize> = BTreeMap::new();
        for ((round, msg_type, _), _) in &self.entries {
            if *msg_type == MsgType::RoundChange && *round >= from_round {
                *per_round.entry(*round).or_default() += 1;
            }
        }
        per_round
            .into_iter()
            .find(|(_, senders)| *senders >= min_senders)
            .map(|(round, _)| round)
    }

    /// Among the round changes targeting `round`, the attached prepared certificate with the
    /// highest prepared round, if any carries one.
    pub fn best_certificate(&self, round: u64) -> Option<PreparedCertificate> {
        self.entries
            .iter()
            .filter(|((entry_round, msg_type, _), _)| {
                *entry_round == round && *msg_type == MsgType::RoundChange
            })
            .filter_map(|(_, entry)| entry.msg.certificate.clone())
            .max_by_key(|cert| cert.round)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
