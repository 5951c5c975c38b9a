//! The PBFT state machine.
//!
//! A [`Pbft`] instance decides one sequence per [`run`](Pbft::run) call, moving through the
//! states of [`PbftState`]: it accepts (or, as proposer, issues) a pre-prepare, collects a
//! prepare quorum, locks, collects a commit quorum, and hands the sealed proposal to the
//! [`Backend`]. Timeouts and rejected proposals divert into the round-change state, which
//! negotiates the round the sequence continues at — carrying locked proposals forward through
//! prepared certificates so that a quorum can converge even after a partitioned round split the
//! validators across locks.
//!
//! ## Threading
//!
//! The state machine itself is strictly sequential. Inbound messages arrive from transport
//! threads through a [`MessageHandle`] and land in the engine's [message log](crate::message_log)
//! under its mutex; the engine blocks on a condition variable bound to the same mutex while it
//! waits for the next message, the round deadline, or cancellation, and re-checks all three on
//! every wake.

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendError, ValidatorKey};
use crate::logging::short_digest;
use crate::message_log::{InsertOutcome, MessageLog};
use crate::messages::{MessageReq, MsgType, PreparedCertificate};
use crate::notifier::{DefaultStateNotifier, MessageReader, StateNotifier};
use crate::timers::{
    exponential_timeout, Clock, RoundTimeout, SystemClock, DEFAULT_BASE_TIMEOUT,
    DEFAULT_MAX_TIMEOUT,
};
use crate::transport::Transport;
use crate::types::{unix_millis_now, NodeID, Proposal, RoundInfo, SealedProposal, View};
use crate::validator_set::ValidatorSet;

/// The engine's position within a sequence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PbftState {
    /// Waiting for (or issuing) the round's pre-prepare.
    Accept,
    /// Collecting the prepare quorum.
    Validate,
    /// Collecting the commit quorum.
    Commit,
    /// Negotiating the round to continue the sequence at.
    RoundChange,
    /// This node has fallen behind the network; the driver should resynchronize it.
    Sync,
    /// The sequence is sealed.
    Done,
    /// The run was cancelled.
    Stopped,
}

impl Display for PbftState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            PbftState::Accept => "AcceptState",
            PbftState::Validate => "ValidateState",
            PbftState::Commit => "CommitState",
            PbftState::RoundChange => "RoundChangeState",
            PbftState::Sync => "SyncState",
            PbftState::Done => "DoneState",
            PbftState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum PbftError {
    /// `run` was called before `set_backend`.
    NoBackend,
    /// The backend produced an empty validator set.
    EmptyValidatorSet,
    /// The backend rejected the sealed proposal; the sequence cannot complete.
    InsertFailed(BackendError),
}

impl Display for PbftError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PbftError::NoBackend => f.write_str("no backend installed"),
            PbftError::EmptyValidatorSet => f.write_str("backend returned an empty validator set"),
            PbftError::InsertFailed(e) => write!(f, "failed to insert sealed proposal: {}", e),
        }
    }
}

impl std::error::Error for PbftError {}

/// Engine configuration. The defaults suit a real network; tests typically shorten the round
/// timeouts and substitute a recording notifier.
pub struct PbftConfig {
    /// Time budget for round 0.
    pub base_timeout: Duration,
    /// Ceiling of the exponential round-timeout backoff.
    pub max_timeout: Duration,
    /// Full override of the round-timeout schedule. When set, `base_timeout` and `max_timeout`
    /// are ignored.
    pub round_timeout: Option<RoundTimeout>,
    /// Bound on messages buffered for future sequences.
    pub max_future_messages: usize,
    pub notifier: Arc<dyn StateNotifier>,
    pub clock: Arc<dyn Clock>,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            base_timeout: DEFAULT_BASE_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            round_timeout: None,
            max_future_messages: 4096,
            notifier: Arc::new(DefaultStateNotifier),
            clock: Arc::new(SystemClock),
        }
    }
}

struct Inner {
    log: MessageLog,
    /// Synthetic timeouts injected during trace replay, waiting for the engine to reach their
    /// view.
    pending_timeouts: Vec<(MsgType, View)>,
}

struct Shared {
    inner: Mutex<Inner>,
    wakeup: Condvar,
    log_target: String,
}

/// The ingress side of an engine: clonable, thread-safe, and valid for the engine's lifetime.
/// Transports push inbound messages here; the replay driver additionally injects recorded
/// timeouts.
#[derive(Clone)]
pub struct MessageHandle {
    shared: Arc<Shared>,
}

impl MessageHandle {
    /// Offer an inbound message to the engine. Validation and deduplication happen here, on the
    /// caller's thread; the engine is woken only when something was stored.
    pub fn push_message(&self, msg: MessageReq) {
        let target = self.shared.log_target.as_str();
        let outcome = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.log.insert(msg)
        };
        match outcome {
            InsertOutcome::Accepted => {
                self.shared.wakeup.notify_all();
            }
            InsertOutcome::Duplicate => {}
            InsertOutcome::Conflict => {
                // A sender re-keyed the same (type, round) with different content. Kept out of
                // the log; surfaced as a fault signal.
                log::warn!(target: target, "MessageConflict, sender equivocated at an occupied slot");
            }
            InsertOutcome::Rejected(reason) => {
                log::debug!(target: target, "MessageRejected, {:?}", reason);
            }
        }
    }

    /// Inject a recorded round timeout. The engine consumes it as if its round timer expired,
    /// once it is at `view`.
    pub fn push_timeout(&self, msg_type: MsgType, view: View) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.pending_timeouts.push((msg_type, view));
        drop(inner);
        self.shared.wakeup.notify_all();
    }

    /// Create a cancellation token for the next `run`.
    pub fn new_cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            shared: self.shared.clone(),
        }
    }
}

/// Cancels a running engine. Cloneable; cancelling any clone stops the run the token was passed
/// to, promptly waking the engine if it is blocked.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct LogReader<'a> {
    log: &'a mut MessageLog,
}

impl MessageReader for LogReader<'_> {
    fn read_message_with_discards(&mut self) -> (Option<MessageReq>, Vec<MessageReq>) {
        self.log.read_next()
    }

    fn has_messages(&self) -> bool {
        self.log.has_messages()
    }
}

enum Wake {
    Msg(MessageReq),
    Timeout,
    Cancelled,
}

/// The PBFT consensus engine for one node.
pub struct Pbft<B: Backend> {
    key: Arc<dyn ValidatorKey>,
    transport: Arc<dyn Transport>,
    config: PbftConfig,
    shared: Arc<Shared>,
    me: NodeID,

    backend: Option<B>,
    validators: Option<Box<dyn ValidatorSet>>,

    state: PbftState,
    view: View,
    proposal: Option<Proposal>,
    locked_round: Option<u64>,
    proposer: Option<NodeID>,
    /// Set when a protocol fault (rejected proposal, failed build) forces the round change, as
    /// opposed to a plain timeout.
    fault: bool,
    valid_seals: HashSet<NodeID>,
    invalid_seals: HashSet<NodeID>,
}

impl<B: Backend> Pbft<B> {
    pub fn new(
        key: Arc<dyn ValidatorKey>,
        transport: Arc<dyn Transport>,
        config: PbftConfig,
    ) -> Self {
        let me = key.node_id();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                log: MessageLog::new(config.max_future_messages),
                pending_timeouts: Vec::new(),
            }),
            wakeup: Condvar::new(),
            log_target: me.to_string(),
        });
        Self {
            key,
            transport,
            config,
            shared,
            me,
            backend: None,
            validators: None,
            state: PbftState::Accept,
            view: View::new(0, 0),
            proposal: None,
            locked_round: None,
            proposer: None,
            fault: false,
            valid_seals: HashSet::new(),
            invalid_seals: HashSet::new(),
        }
    }

    /// The ingress handle for this engine. Clones stay valid across `set_backend` and `run`
    /// calls.
    pub fn message_handle(&self) -> MessageHandle {
        MessageHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> PbftState {
        self.state
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// The proposal currently under consideration, if any.
    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal.as_ref()
    }

    /// Whether this node holds a prepare-quorum lock on its proposal.
    pub fn is_locked(&self) -> bool {
        self.locked_round.is_some()
    }

    /// Install the backend for the next sequence, resetting all per-sequence state. Must be
    /// called before every `run`.
    pub fn set_backend(&mut self, backend: B) -> Result<(), PbftError> {
        let sequence = backend.height();
        let validators = backend.validator_set();
        if validators.is_empty() {
            return Err(PbftError::EmptyValidatorSet);
        }

        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.log.reset(sequence, backend.validator_set());
            inner
                .pending_timeouts
                .retain(|(_, view)| view.sequence >= sequence);
        }

        backend.init(&RoundInfo { sequence, round: 0 });

        self.view = View::new(sequence, 0);
        self.proposal = None;
        self.locked_round = None;
        self.proposer = None;
        self.fault = false;
        self.valid_seals.clear();
        self.invalid_seals.clear();
        self.validators = Some(validators);
        self.backend = Some(backend);
        self.state = PbftState::Accept;
        Ok(())
    }

    /// Drive the state machine until the sequence is sealed (`Done`), the node discovers it is
    /// behind (`Sync`), or `cancel` fires (`Stopped`). Returns an error only when the backend
    /// rejects the sealed proposal, which is fatal to the sequence.
    pub fn run(&mut self, cancel: &CancelToken) -> Result<(), PbftError> {
        if self.backend.is_none() {
            return Err(PbftError::NoBackend);
        }
        self.set_state(PbftState::Accept);
        loop {
            if cancel.is_cancelled() {
                self.set_state(PbftState::Stopped);
                return Ok(());
            }
            match self.state {
                PbftState::Accept => self.run_accept(cancel),
                PbftState::Validate => self.run_validate(cancel),
                PbftState::Commit => self.run_commit(cancel)?,
                PbftState::RoundChange => self.run_round_change(cancel),
                PbftState::Sync | PbftState::Done | PbftState::Stopped => return Ok(()),
            }
        }
    }

    // ---- state handlers ----

    fn run_accept(&mut self, cancel: &CancelToken) {
        if !self.validators().includes(&self.me) {
            // Not a validator at this height: ride along until the driver resynchronizes us.
            self.set_state(PbftState::Sync);
            return;
        }
        self.apply_view(self.view);
        let proposer = self.proposer.clone().expect("proposer set by apply_view");
        log::info!(
            target: self.target(),
            "AcceptState, {}, proposer {}",
            self.view,
            proposer
        );

        if proposer == self.me {
            if self.locked_round.is_none() {
                match self.backend().build_proposal() {
                    Ok(proposal) => {
                        if !self.wait_for_proposal_time(proposal.timestamp, cancel) {
                            self.set_state(PbftState::Stopped);
                            return;
                        }
                        self.proposal = Some(proposal);
                    }
                    Err(e) => {
                        log::warn!(target: self.target(), "BuildProposalFailed, {}", e);
                        self.fault = true;
                        self.set_state(PbftState::RoundChange);
                        return;
                    }
                }
            }
            self.gossip(MsgType::PrePrepare);
            self.gossip(MsgType::Prepare);
            self.set_state(PbftState::Validate);
            return;
        }

        let deadline = self.next_deadline();
        while self.state == PbftState::Accept {
            match self.get_next_message(deadline, cancel) {
                Wake::Cancelled => self.set_state(PbftState::Stopped),
                Wake::Timeout => self.set_state(PbftState::RoundChange),
                Wake::Msg(msg) => {
                    if msg.msg_type != MsgType::PrePrepare
                        || msg.view != self.view
                        || msg.from != proposer
                    {
                        continue;
                    }
                    let proposal = match msg.proposal {
                        Some(proposal) => proposal,
                        None => continue,
                    };
                    if let Err(e) = self.backend().validate(&proposal) {
                        log::warn!(
                            target: self.target(),
                            "ProposalRejected, {}, {}",
                            short_digest(&proposal.hash),
                            e
                        );
                        self.fault = true;
                        self.set_state(PbftState::RoundChange);
                        continue;
                    }
                    if self.locked_round.is_some() {
                        if self.proposal.as_ref() != Some(&proposal) {
                            log::warn!(
                                target: self.target(),
                                "ProposalRejected, {}, conflicts with locked proposal",
                                short_digest(&proposal.hash)
                            );
                            self.fault = true;
                            self.set_state(PbftState::RoundChange);
                            continue;
                        }
                    } else {
                        self.proposal = Some(proposal);
                    }
                    self.gossip(MsgType::Prepare);
                    self.set_state(PbftState::Validate);
                }
            }
        }
    }

    fn run_validate(&mut self, cancel: &CancelToken) {
        let deadline = self.next_deadline();
        let digest = self.proposal_digest();
        let quorum = self.validators().quorum_size();

        while self.state == PbftState::Validate {
            let prepared = {
                let inner = self.shared.inner.lock().unwrap();
                inner.log.prepare_count(self.view.round, &digest)
            };
            if prepared >= quorum {
                self.lock_proposal();
                self.gossip(MsgType::Commit);
                self.set_state(PbftState::Commit);
                return;
            }
            match self.get_next_message(deadline, cancel) {
                Wake::Cancelled => self.set_state(PbftState::Stopped),
                Wake::Timeout => self.set_state(PbftState::RoundChange),
                // Prepares and commits only move the counts; re-evaluated at the loop top.
                Wake::Msg(_) => {}
            }
        }
    }

    fn run_commit(&mut self, cancel: &CancelToken) -> Result<(), PbftError> {
        let deadline = self.next_deadline();
        let digest = self.proposal_digest();
        let quorum = self.validators().quorum_size();

        while self.state == PbftState::Commit {
            let candidates = {
                let inner = self.shared.inner.lock().unwrap();
                inner.log.committed_seals(&digest)
            };
            for candidate in &candidates {
                if self.valid_seals.contains(&candidate.from)
                    || self.invalid_seals.contains(&candidate.from)
                {
                    continue;
                }
                match self.backend().validate_commit(&candidate.from, &candidate.seal) {
                    Ok(()) => {
                        self.valid_seals.insert(candidate.from.clone());
                    }
                    Err(e) => {
                        log::warn!(
                            target: self.target(),
                            "CommitSealRejected, {}, {}",
                            candidate.from,
                            e
                        );
                        self.invalid_seals.insert(candidate.from.clone());
                        let mut inner = self.shared.inner.lock().unwrap();
                        inner.log.remove_commits_from(&candidate.from);
                    }
                }
            }
            let seals: Vec<_> = candidates
                .into_iter()
                .filter(|c| self.valid_seals.contains(&c.from))
                .collect();
            if seals.len() >= quorum {
                let sealed = SealedProposal {
                    proposal: self.proposal.clone().expect("commit state implies proposal"),
                    proposer: self.proposer.clone().expect("commit state implies proposer"),
                    number: self.view.sequence,
                    committed_seals: seals,
                };
                return match self.backend().insert(&sealed) {
                    Ok(()) => {
                        log::info!(
                            target: self.target(),
                            "SequenceSealed, {}, {}, {} seals",
                            self.view,
                            short_digest(&digest),
                            sealed.committed_seals.len()
                        );
                        self.set_state(PbftState::Done);
                        Ok(())
                    }
                    Err(e) => {
                        log::error!(target: self.target(), "InsertFailed, {}, {}", self.view, e);
                        Err(PbftError::InsertFailed(e))
                    }
                };
            }
            match self.get_next_message(deadline, cancel) {
                Wake::Cancelled => self.set_state(PbftState::Stopped),
                Wake::Timeout => self.set_state(PbftState::RoundChange),
                Wake::Msg(_) => {}
            }
        }
        Ok(())
    }

    fn run_round_change(&mut self, cancel: &CancelToken) {
        let weak = self.validators().max_faulty() + 1;
        let quorum = self.validators().quorum_size();

        // Entry: pick the round to campaign for. A fault always advances the round; a timeout
        // first tries to join rounds the network is already gathering on, and checks whether the
        // network has moved on entirely.
        let max_weak = self.log_max_round(weak).filter(|r| *r > self.view.round);
        if self.fault {
            self.fault = false;
            let next = (self.view.round + 1).max(max_weak.unwrap_or(0));
            self.move_to_round(next);
        } else if let Some(round) = max_weak {
            self.move_to_round(round);
        } else {
            if self.check_stuck() {
                return;
            }
            self.move_to_round(self.view.round + 1);
        }

        let mut deadline = self.next_deadline();
        while self.state == PbftState::RoundChange {
            // 2f + 1 distinct senders on one round conclude the round change. Whoever among them
            // proved the highest-round lock dictates the proposal carried into the new round.
            let quorum_round = {
                let inner = self.shared.inner.lock().unwrap();
                inner.log.quorum_round(self.view.round, quorum)
            };
            if let Some(round) = quorum_round {
                let cert = {
                    let inner = self.shared.inner.lock().unwrap();
                    inner.log.best_certificate(round)
                };
                if let Some(cert) = cert {
                    self.adopt_certificate(cert);
                }
                self.apply_view(View::new(self.view.sequence, round));
                self.set_state(PbftState::Accept);
                return;
            }
            // f + 1 distinct senders above us cannot all be faulty: jump to them.
            if let Some(round) = self.log_max_round(weak).filter(|r| *r > self.view.round) {
                self.move_to_round(round);
                deadline = self.next_deadline();
                continue;
            }
            match self.get_next_message(deadline, cancel) {
                Wake::Cancelled => self.set_state(PbftState::Stopped),
                Wake::Timeout => {
                    if self.check_stuck() {
                        return;
                    }
                    self.move_to_round(self.view.round + 1);
                    deadline = self.next_deadline();
                }
                Wake::Msg(_) => {}
            }
        }
    }

    // ---- transitions and helpers ----

    fn set_state(&mut self, state: PbftState) {
        if self.state != state {
            log::debug!(target: self.target(), "StateChange, {}, {}", self.state, state);
            self.state = state;
        }
    }

    /// Move to `view`: recompute the round's proposer and tell the log, whose ingress checks and
    /// pruning key off the current round.
    fn apply_view(&mut self, view: View) {
        let proposer = self
            .validators()
            .calc_proposer(view.round, view.sequence, None);
        self.view = view;
        self.proposer = Some(proposer);
        let mut inner = self.shared.inner.lock().unwrap();
        inner.log.set_round(view.round);
    }

    fn move_to_round(&mut self, round: u64) {
        log::info!(target: self.target(), "RoundChange, sequence {}, round {}", self.view.sequence, round);
        self.apply_view(View::new(self.view.sequence, round));
        self.gossip(MsgType::RoundChange);
    }

    fn lock_proposal(&mut self) {
        let digest = self.proposal_digest();
        self.locked_round = Some(self.view.round);
        let mut inner = self.shared.inner.lock().unwrap();
        inner.log.set_locked_digest(Some(digest.clone()));
        drop(inner);
        log::info!(
            target: self.target(),
            "ProposalLocked, {}, {}",
            self.view,
            short_digest(&digest)
        );
    }

    fn adopt_certificate(&mut self, cert: PreparedCertificate) {
        // Lock stability: only a certificate from a round at or above our own lock may replace
        // it. Our own round change is part of any quorum we observe, so a certificate below our
        // lock round cannot be the best one unless senders equivocated.
        if self.locked_round.map_or(false, |lr| cert.round < lr) {
            return;
        }
        log::info!(
            target: self.target(),
            "CertificateAdopted, {}, prepared at round {}",
            short_digest(&cert.proposal.hash),
            cert.round
        );
        self.locked_round = Some(cert.round);
        self.proposal = Some(cert.proposal);
        let digest = self.proposal_digest();
        let mut inner = self.shared.inner.lock().unwrap();
        inner.log.set_locked_digest(Some(digest));
    }

    fn check_stuck(&mut self) -> bool {
        let (height, stuck) = self.backend().is_stuck(self.view.sequence);
        if stuck {
            log::info!(
                target: self.target(),
                "NodeBehind, at sequence {}, network at height {}",
                self.view.sequence,
                height
            );
            self.set_state(PbftState::Sync);
        }
        stuck
    }

    fn gossip(&mut self, msg_type: MsgType) {
        let msg = match msg_type {
            MsgType::PrePrepare => {
                let proposal = self.proposal.clone().expect("proposer built a proposal");
                MessageReq::preprepare(self.me.clone(), self.view, proposal)
            }
            MsgType::Prepare => {
                MessageReq::prepare(self.me.clone(), self.view, self.proposal_digest())
            }
            MsgType::Commit => {
                let digest = self.proposal_digest();
                match self.key.sign(&digest) {
                    Ok(seal) => MessageReq::commit(self.me.clone(), self.view, digest, seal),
                    Err(e) => {
                        log::error!(target: self.target(), "SealSignFailed, {}", e);
                        return;
                    }
                }
            }
            MsgType::RoundChange => {
                let cert = self.locked_round.map(|round| PreparedCertificate {
                    proposal: self
                        .proposal
                        .clone()
                        .expect("locked round implies proposal"),
                    round,
                });
                MessageReq::round_change(self.me.clone(), self.view, cert)
            }
        };
        log::debug!(
            target: self.target(),
            "Send{}, {}, {}",
            msg.msg_type,
            msg.view,
            short_digest(&msg.digest)
        );
        // Count our own vote before telling anyone else.
        {
            let mut inner = self.shared.inner.lock().unwrap();
            let _ = inner.log.insert(msg.clone());
        }
        self.transport.gossip(&msg);
    }

    /// Wait for the next protocol-relevant message, the deadline, or cancellation. On a real
    /// deadline expiry the notifier's `handle_timeout` fires; synthetic (replayed) timeouts are
    /// consumed silently since they were recorded when they originally fired.
    fn get_next_message(&self, deadline: Instant, cancel: &CancelToken) -> Wake {
        let notifier = self.config.notifier.clone();
        loop {
            if cancel.is_cancelled() {
                return Wake::Cancelled;
            }
            let mut inner = self.shared.inner.lock().unwrap();

            let sequence = self.view.sequence;
            inner
                .pending_timeouts
                .retain(|(_, view)| view.sequence >= sequence);
            if let Some(pos) = inner
                .pending_timeouts
                .iter()
                .position(|(_, view)| *view == self.view)
            {
                inner.pending_timeouts.remove(pos);
                return Wake::Timeout;
            }

            let (msg, discards) = {
                let mut reader = LogReader {
                    log: &mut inner.log,
                };
                notifier.read_next_message(&mut reader)
            };
            for discarded in &discards {
                log::debug!(
                    target: self.target(),
                    "MessageDiscarded, {}, {}, from {}",
                    discarded.msg_type,
                    discarded.view,
                    discarded.from
                );
            }
            if let Some(msg) = msg {
                return Wake::Msg(msg);
            }

            let now = self.config.clock.now();
            if now >= deadline {
                drop(inner);
                log::info!(target: self.target(), "Timeout, {}, {}", self.state, self.view);
                notifier.handle_timeout(&self.me, self.state_msg_type(), self.view);
                return Wake::Timeout;
            }
            let (guard, _) = self
                .shared
                .wakeup
                .wait_timeout(inner, deadline - now)
                .unwrap();
            drop(guard);
        }
    }

    /// Block until the proposal's announced timestamp. Returns false if cancelled first.
    fn wait_for_proposal_time(&self, timestamp: u64, cancel: &CancelToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = unix_millis_now();
            if now >= timestamp {
                return true;
            }
            thread::sleep(Duration::from_millis((timestamp - now).min(50)));
        }
    }

    fn next_deadline(&self) -> Instant {
        let timeout = match &self.config.round_timeout {
            Some(schedule) => schedule(self.view.round),
            None => exponential_timeout(
                self.config.base_timeout,
                self.config.max_timeout,
                self.view.round,
            ),
        };
        self.config.clock.now() + timeout
    }

    fn state_msg_type(&self) -> MsgType {
        match self.state {
            PbftState::Accept => MsgType::PrePrepare,
            PbftState::Validate => MsgType::Prepare,
            PbftState::Commit => MsgType::Commit,
            _ => MsgType::RoundChange,
        }
    }

    fn proposal_digest(&self) -> Vec<u8> {
        self.proposal
            .as_ref()
            .map(|p| p.hash.clone())
            .unwrap_or_default()
    }

    fn log_max_round(&self, min_senders: usize) -> Option<u64> {
        let inner = self.shared.inner.lock().unwrap();
        inner.log.max_round(min_senders)
    }

    fn validators(&self) -> &dyn ValidatorSet {
        self.validators
            .as_deref()
            .expect("validators installed with backend")
    }

    fn backend(&self) -> &B {
        self.backend.as_ref().expect("backend installed")
    }

    fn target(&self) -> &str {
        self.shared.log_target.as_str()
    }
}
