//! An in-process cluster of PBFT engines, one OS thread per node, connected by a
//! [`HookedTransport`] and sharing a single sealed-proposal list.
//!
//! The shared list doubles as the safety-violation detector: if two nodes ever seal different
//! proposals at the same sequence, [`ClusterCore::insert_final_proposal`] panics and takes the
//! test down with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pbft_rs::{
    Backend, BackendError, CancelToken, MessageHandle, MessageReader, MessageReq, MsgType, NodeID,
    Pbft, PbftConfig, PbftState, Proposal, RoundInfo, SealedProposal, StateNotifier, Transport,
    TransportHandler, ValidatorKey, ValidatorList, ValidatorSet, View,
};

use super::logging::setup_logger;
use super::replay::{DefaultReplayNotifier, ReplayNotifier};
use super::transport::{HookedTransport, TransportHook};

pub(crate) struct ClusterConfig {
    pub(crate) count: usize,
    /// Test name; keys the log directory when logging to files.
    pub(crate) name: String,
    /// Node names are `{prefix}_{index}`.
    pub(crate) prefix: String,
    /// Fixed per-round timeout overriding the engine's exponential schedule.
    pub(crate) round_timeout: Option<Duration>,
    pub(crate) replay_notifier: Option<Arc<dyn ReplayNotifier>>,
    /// Override for the inbound delivery wiring. The replay driver registers a handler that
    /// drops deliveries, so that replayed engines cannot re-gossip to each other.
    pub(crate) transport_handler: Option<TransportHandler>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            count: 0,
            name: String::from("cluster"),
            prefix: String::from("node"),
            round_timeout: None,
            replay_notifier: None,
            transport_handler: None,
        }
    }
}

pub(crate) struct Cluster {
    core: Arc<ClusterCore>,
}

pub(crate) struct ClusterCore {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    sealed: Mutex<Vec<SealedProposal>>,
    hook: Option<Arc<dyn TransportHook>>,
    notifier: Arc<dyn ReplayNotifier>,
}

impl Cluster {
    pub(crate) fn new(config: ClusterConfig, hook: Option<Arc<dyn TransportHook>>) -> Cluster {
        setup_logger(&config.name);

        let names: Vec<String> = (0..config.count)
            .map(|i| format!("{}_{}", config.prefix, i))
            .collect();

        let notifier: Arc<dyn ReplayNotifier> = config
            .replay_notifier
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultReplayNotifier));
        if let Err(e) = notifier.save_metadata(&names) {
            log::warn!("could not write node metadata to the replay file: {e}");
        }

        let transport = Arc::new(HookedTransport::new(hook.clone()));
        let core = Arc::new(ClusterCore {
            nodes: Mutex::new(HashMap::new()),
            sealed: Mutex::new(Vec::new()),
            hook,
            notifier: notifier.clone(),
        });

        for name in &names {
            let node = Node::new(
                name.clone(),
                names.clone(),
                &config,
                core.clone(),
                transport.clone(),
                notifier.clone(),
            );
            core.nodes.lock().unwrap().insert(name.clone(), node);
        }

        Cluster { core }
    }

    pub(crate) fn start(&self) {
        for node in self.nodes() {
            node.start();
        }
    }

    pub(crate) fn stop(&self) {
        for node in self.nodes() {
            if node.is_running() {
                node.stop();
            }
        }
    }

    pub(crate) fn node(&self, name: &str) -> Arc<Node> {
        self.core
            .nodes
            .lock()
            .unwrap()
            .get(name)
            .unwrap_or_else(|| panic!("node {name} not found"))
            .clone()
    }

    pub(crate) fn nodes(&self) -> Vec<Arc<Node>> {
        self.core.nodes.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.nodes.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn sealed_proposals(&self) -> Vec<SealedProposal> {
        self.core.sealed.lock().unwrap().clone()
    }

    fn resolve(&self, subset: Option<&[String]>) -> Vec<String> {
        match subset {
            Some(names) => {
                let nodes = self.core.nodes.lock().unwrap();
                for name in names {
                    assert!(nodes.contains_key(name), "node {name} not found in query");
                }
                names.to_vec()
            }
            None => self.node_names(),
        }
    }

    /// Poll (at 200 ms) until every queried node reaches height `num`, or time out.
    pub(crate) fn wait_for_height(
        &self,
        num: u64,
        timeout: Duration,
        subset: Option<&[String]>,
    ) -> Result<(), String> {
        let names = self.resolve(subset);
        let deadline = Instant::now() + timeout;
        loop {
            thread::sleep(Duration::from_millis(200));
            let enough = {
                let nodes = self.core.nodes.lock().unwrap();
                names.iter().all(|name| nodes[name].node_height() >= num)
            };
            if enough {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(format!("timeout waiting for height {num}"));
            }
        }
    }

    /// True iff none of the queried nodes advances its height for the whole duration.
    pub(crate) fn is_stuck(&self, duration: Duration, subset: Option<&[String]>) -> bool {
        let names = self.resolve(subset);
        let initial: HashMap<String, u64> = {
            let nodes = self.core.nodes.lock().unwrap();
            names
                .iter()
                .map(|name| (name.clone(), nodes[name].node_height()))
                .collect()
        };
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            thread::sleep(Duration::from_millis(200));
            let nodes = self.core.nodes.lock().unwrap();
            if names
                .iter()
                .any(|name| nodes[name].node_height() != initial[name])
            {
                return false;
            }
        }
        true
    }

    pub(crate) fn get_max_height(&self, subset: Option<&[String]>) -> u64 {
        let names = self.resolve(subset);
        let nodes = self.core.nodes.lock().unwrap();
        names
            .iter()
            .map(|name| nodes[name].node_height())
            .max()
            .unwrap_or(0)
    }
}

impl ClusterCore {
    /// Append a node's sealed proposal to the shared log. A proposal for the sequence sealed
    /// last must be byte-identical to what is already there; anything else at that slot is a
    /// safety violation and panics. Out-of-order sequences are rejected.
    fn insert_final_proposal(&self, node: &NodeID, sealed: &SealedProposal) {
        let mut proposals = self.sealed.lock().unwrap();
        let last_index = proposals.len() as i64 - 1;
        let insert_index = sealed.number as i64 - 1;
        if insert_index == last_index + 1 {
            proposals.push(sealed.clone());
            log::debug!(
                target: node.as_str(),
                "ProposalAdded, sequence {}, insert index {}",
                sealed.number,
                insert_index
            );
        } else if insert_index == last_index {
            if proposals[insert_index as usize].proposal != sealed.proposal {
                panic!(
                    "safety violation: conflicting proposals sealed at sequence {}",
                    sealed.number
                );
            }
            log::debug!(
                target: node.as_str(),
                "ProposalRepeated, sequence {}",
                sealed.number
            );
        } else {
            log::warn!(
                target: node.as_str(),
                "ProposalOutOfOrder, sequence {}, last index {}",
                sealed.number,
                last_index
            );
        }
    }

    /// Highest height among the peers this node can currently reach, and the corresponding sync
    /// index (−1 when no peer is ahead of an empty log).
    fn sync_with_network(&self, me: &NodeID) -> (u64, i64) {
        let nodes = self.nodes.lock().unwrap();
        let mut height = 0u64;
        let mut sync_index = -1i64;
        for node in nodes.values() {
            if node.id == *me {
                continue;
            }
            if let Some(hook) = &self.hook {
                if !hook.connects(me, &node.id) {
                    continue;
                }
            }
            let peer_height = node.node_height();
            if peer_height > height {
                height = peer_height;
                sync_index = peer_height as i64 - 1;
            }
        }
        (height, sync_index)
    }

    /// The proposer recorded in the sealed proposal at `index`, if it exists.
    fn get_proposer(&self, index: i64) -> Option<NodeID> {
        let proposals = self.sealed.lock().unwrap();
        if index >= 0 && (index as usize) < proposals.len() {
            Some(proposals[index as usize].proposer.clone())
        } else {
            None
        }
    }
}

pub(crate) struct Node {
    id: NodeID,
    all_names: Vec<String>,
    core: Arc<ClusterCore>,
    engine: Mutex<Pbft<Fsm>>,
    handle: MessageHandle,
    cancel: Mutex<Option<CancelToken>>,
    join: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    faulty: AtomicBool,
    /// Index of this node's synchronization with the cluster: −1 before the first seal.
    local_sync_index: AtomicI64,
}

impl Node {
    fn new(
        name: String,
        all_names: Vec<String>,
        config: &ClusterConfig,
        core: Arc<ClusterCore>,
        transport: Arc<HookedTransport>,
        notifier: Arc<dyn ReplayNotifier>,
    ) -> Arc<Node> {
        let id = NodeID::from(name.as_str());

        let engine_config = PbftConfig {
            round_timeout: config.round_timeout.map(|fixed| {
                let schedule: pbft_rs::timers::RoundTimeout = Box::new(move |_| fixed);
                schedule
            }),
            notifier: Arc::new(NotifierAdapter(notifier.clone())),
            ..PbftConfig::default()
        };
        let transport_capability: Arc<dyn Transport> = transport.clone();
        let engine = Pbft::new(
            Arc::new(NodeKey(id.clone())),
            transport_capability,
            engine_config,
        );
        let handle = engine.message_handle();

        let node = Arc::new(Node {
            id: id.clone(),
            all_names,
            core,
            engine: Mutex::new(engine),
            handle: handle.clone(),
            cancel: Mutex::new(None),
            join: Mutex::new(None),
            running: AtomicBool::new(false),
            faulty: AtomicBool::new(false),
            local_sync_index: AtomicI64::new(-1),
        });

        match &config.transport_handler {
            Some(handler) => transport.register(id, handler.clone()),
            None => {
                let ingress = handle;
                let recorder = notifier;
                transport.register(
                    id,
                    Arc::new(move |to: &NodeID, msg: &MessageReq| {
                        ingress.push_message(msg.clone());
                        recorder.handle_message(to, msg);
                    }),
                );
            }
        }

        node
    }

    pub(crate) fn name(&self) -> &str {
        self.id.as_str()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    pub(crate) fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::SeqCst)
    }

    pub(crate) fn sync_index(&self) -> i64 {
        self.local_sync_index.load(Ordering::SeqCst)
    }

    fn set_sync_index(&self, index: i64) {
        self.local_sync_index.store(index, Ordering::SeqCst);
    }

    /// Height and sync index differ by one: the first sealed proposal sits at index 0 and takes
    /// the node to height 1.
    pub(crate) fn node_height(&self) -> u64 {
        (self.sync_index() + 1) as u64
    }

    /// Feed a message straight into this node's engine, bypassing the transport.
    pub(crate) fn push_message(&self, msg: MessageReq) {
        self.handle.push_message(msg);
    }

    /// Inject a recorded timeout into this node's engine.
    pub(crate) fn push_timeout(&self, msg_type: MsgType, view: View) {
        self.handle.push_timeout(msg_type, view);
    }

    pub(crate) fn start(self: &Arc<Node>) {
        if self.running.swap(true, Ordering::SeqCst) {
            panic!("node '{}' is already started", self.name());
        }
        let token = self.handle.new_cancel_token();
        *self.cancel.lock().unwrap() = Some(token.clone());

        let node = Arc::clone(self);
        let join = thread::spawn(move || {
            node.run_loop(token);
            node.running.store(false, Ordering::SeqCst);
        });
        *self.join.lock().unwrap() = Some(join);
    }

    pub(crate) fn stop(&self) {
        if !self.is_running() {
            panic!("node {} is already stopped", self.name());
        }
        if let Some(token) = self.cancel.lock().unwrap().take() {
            token.cancel();
        }
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }

    pub(crate) fn restart(self: &Arc<Node>) {
        self.stop();
        self.start();
    }

    fn run_loop(self: &Arc<Node>, token: CancelToken) {
        'sync: loop {
            if token.is_cancelled() {
                return;
            }
            let (_, sync_index) = self.core.sync_with_network(&self.id);
            self.set_sync_index(sync_index);

            loop {
                let fsm = Fsm {
                    node: Arc::clone(self),
                    last_proposer: self.core.get_proposer(self.sync_index()),
                    // This iteration of the state machine decides the next height.
                    height: self.node_height() + 1,
                    validation_fails: self.is_faulty(),
                };

                let mut engine = self.engine.lock().unwrap();
                if let Err(e) = engine.set_backend(fsm) {
                    log::warn!(target: self.name(), "SetBackendFailed, {e}");
                    return;
                }
                let result = engine.run(&token);
                let state = engine.state();
                drop(engine);

                if let Err(e) = self.core.notifier.save_state() {
                    log::warn!(target: self.name(), "could not write state to the replay file: {e}");
                }
                if let Err(e) = result {
                    log::warn!(target: self.name(), "SequenceFailed, {e}");
                    return;
                }

                match state {
                    PbftState::Sync => continue 'sync,
                    PbftState::Done => self.set_sync_index(self.sync_index() + 1),
                    _ => return,
                }
            }
        }
    }
}

/// The test application: one byte of payload per height, a switchable validation failure, and
/// the cluster's shared list as the insertion target.
struct Fsm {
    node: Arc<Node>,
    last_proposer: Option<NodeID>,
    height: u64,
    validation_fails: bool,
}

impl Backend for Fsm {
    fn height(&self) -> u64 {
        self.height
    }

    fn build_proposal(&self) -> Result<Proposal, BackendError> {
        // A single-byte payload (the height, truncated) keeps traces small. It aliases at
        // sequences equal mod 256; real applications must supply richer proposals.
        Ok(Proposal::new(
            vec![self.height as u8],
            pbft_rs::types::unix_millis_now() + 1_000,
        ))
    }

    fn validate(&self, _proposal: &Proposal) -> Result<(), BackendError> {
        if self.validation_fails {
            return Err(BackendError::from("validation error"));
        }
        Ok(())
    }

    fn insert(&self, sealed: &SealedProposal) -> Result<(), BackendError> {
        self.node.core.insert_final_proposal(&self.node.id, sealed);
        Ok(())
    }

    fn validator_set(&self) -> Box<dyn ValidatorSet> {
        let nodes = self
            .node
            .all_names
            .iter()
            .map(|name| NodeID::from(name.as_str()))
            .collect();
        Box::new(ValidatorList::new(nodes).with_last_proposer(self.last_proposer.clone()))
    }

    fn is_stuck(&self, num: u64) -> (u64, bool) {
        let (height, _) = self.node.core.sync_with_network(&self.node.id);
        if height > num {
            (height, true)
        } else {
            (0, false)
        }
    }

    fn init(&self, _info: &RoundInfo) {}
}

/// Harness identity: the node's name is its id and seals are the digest itself. Signature
/// schemes are exercised separately; the cluster tests are about the protocol.
struct NodeKey(NodeID);

impl ValidatorKey for NodeKey {
    fn node_id(&self) -> NodeID {
        self.0.clone()
    }

    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, BackendError> {
        Ok(digest.to_vec())
    }
}

/// Bridges the harness's [`ReplayNotifier`] into the engine's [`StateNotifier`] slot.
struct NotifierAdapter(Arc<dyn ReplayNotifier>);

impl StateNotifier for NotifierAdapter {
    fn handle_timeout(&self, to: &NodeID, msg_type: MsgType, view: View) {
        self.0.handle_timeout(to, msg_type, view);
    }

    fn read_next_message(
        &self,
        reader: &mut dyn MessageReader,
    ) -> (Option<MessageReq>, Vec<MessageReq>) {
        self.0.read_next_message(reader)
    }
}
