//! Per-group concurrency driver.
//!
//! ```text
//!   propose ──► prop queue ──┐
//!   tick    ──► tick queue ──┤                      ┌──► Transport::send
//!   message ──► recv queue ──┼──► worker (RaftFsm) ─┼──► Storage (persist)
//!   campaign ─► campaign q ──┤        │             └──► apply queue ──► apply task
//!   status  ──► status q ────┘        └─► ready queue (flush trigger)    (StateMachine)
//! ```
//!
//! The worker is the only owner of the group's [`RaftFsm`]; everything else
//! talks to it through bounded queues. Leader and term are published through
//! a watch channel so readers never block the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::config::{NodeConfig, RaftConfig};
use super::error::{RaftError, Result};
use super::fsm::{RaftFsm, Status};
use super::state_machine::StateMachine;
use crate::proto::{
    ConfChange, Entry, EntryType, GroupId, HardState, Message, MessageType, NodeId, Peer,
    NO_LEADER,
};
use crate::shutdown::stopped;
use crate::transport::Transport;

/// Maximum number of queued proposals folded into one step.
pub const MAX_PROPOSAL_BATCH: usize = 64;

const TICK_QUEUE_SIZE: usize = 64;
const PROPOSAL_QUEUE_SIZE: usize = 256;

/// Derived, non-persisted view of leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftState {
    pub leader: NodeId,
    pub term: u64,
}

/// Membership table of one group, replaced wholesale on membership change.
#[derive(Debug, Default)]
pub(crate) struct PeerState {
    peers: RwLock<HashMap<NodeId, Peer>>,
}

impl PeerState {
    fn new(peers: Vec<Peer>) -> Self {
        let state = Self::default();
        state.replace(peers);
        state
    }

    pub(crate) fn get(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().copied().collect();
        peers.sort_unstable_by_key(|p| p.id);
        peers
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.peers.read().contains_key(&id)
    }

    fn replace(&self, peers: Vec<Peer>) {
        let table = peers.into_iter().map(|p| (p.id, p)).collect();
        *self.peers.write() = table;
    }
}

struct Proposal {
    entry_type: EntryType,
    data: Vec<u8>,
}

enum ApplyTask {
    Entries(Vec<Entry>),
    LeaderChange(NodeId),
}

struct RaftInner {
    group_id: GroupId,
    node_id: NodeId,
    max_size_per_msg: u64,
    tick_tx: mpsc::Sender<()>,
    recv_tx: mpsc::Sender<Message>,
    prop_tx: mpsc::Sender<Proposal>,
    campaign_tx: mpsc::Sender<()>,
    status_tx: mpsc::Sender<oneshot::Sender<Status>>,
    soft_state: watch::Receiver<SoftState>,
    applied: Arc<AtomicU64>,
    peer_state: Arc<PeerState>,
    stop_tx: watch::Sender<bool>,
}

/// Handle to one raft group. Cheap to clone.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<RaftInner>,
}

impl Raft {
    /// Build the group's state machine and spawn its worker and apply tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(
        node: &NodeConfig,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let prev_hs = config.storage.initial_state()?;
        let fsm = RaftFsm::new(node, &config)?;
        let RaftConfig {
            group_id,
            state_machine,
            ..
        } = config;

        let (tick_tx, tick_rx) = mpsc::channel(TICK_QUEUE_SIZE);
        let (recv_tx, recv_rx) = mpsc::channel(node.req_buffer_size);
        let (prop_tx, prop_rx) = mpsc::channel(PROPOSAL_QUEUE_SIZE);
        let (campaign_tx, campaign_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (apply_tx, apply_rx) = mpsc::channel(node.app_buffer_size);
        let (stop_tx, stop_rx) = watch::channel(false);

        let soft = SoftState {
            leader: fsm.leader,
            term: fsm.term,
        };
        let (soft_tx, soft_rx) = watch::channel(soft);
        let applied = Arc::new(AtomicU64::new(fsm.log.applied()));
        let peer_state = Arc::new(PeerState::new(fsm.peers()));

        if soft.leader != NO_LEADER {
            let _ = apply_tx.try_send(ApplyTask::LeaderChange(soft.leader));
        }

        tokio::spawn(run_apply(
            group_id,
            state_machine,
            apply_rx,
            Arc::clone(&applied),
        ));

        let worker = Worker {
            group_id,
            fsm,
            transport,
            tick_rx,
            recv_rx,
            prop_rx,
            campaign_rx,
            status_rx,
            ready_tx,
            ready_rx,
            apply_tx,
            soft_tx,
            peer_state: Arc::clone(&peer_state),
            applied: Arc::clone(&applied),
            prev_hs,
            stop_rx,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            inner: Arc::new(RaftInner {
                group_id,
                node_id: node.node_id,
                max_size_per_msg: node.max_size_per_msg,
                tick_tx,
                recv_tx,
                prop_tx,
                campaign_tx,
                status_tx,
                soft_state: soft_rx,
                applied,
                peer_state,
                stop_tx,
            }),
        })
    }

    pub fn group_id(&self) -> GroupId {
        self.inner.group_id
    }

    /// Submit a command. A silent no-op unless this replica leads the
    /// group; blocks while the proposal queue is full. Commands larger than
    /// `max_size_per_msg` are rejected with [`RaftError::ProposalTooLarge`].
    pub async fn propose(&self, data: Vec<u8>) -> Result<()> {
        self.enqueue_proposal(Proposal {
            entry_type: EntryType::Normal,
            data,
        })
        .await
    }

    /// Submit a membership change. Same admission rules as [`Raft::propose`].
    pub async fn propose_member_change(&self, change: ConfChange) -> Result<()> {
        let data = change.encode()?;
        self.enqueue_proposal(Proposal {
            entry_type: EntryType::ConfChange,
            data,
        })
        .await
    }

    async fn enqueue_proposal(&self, proposal: Proposal) -> Result<()> {
        if self.is_stopped() {
            return Err(RaftError::Stopped);
        }
        if proposal.data.len() as u64 > self.inner.max_size_per_msg {
            return Err(RaftError::ProposalTooLarge {
                size: proposal.data.len(),
                limit: self.inner.max_size_per_msg,
            });
        }
        if !self.is_leader() {
            debug!(group = self.inner.group_id, "not leader, dropping proposal");
            return Ok(());
        }

        let mut stop_rx = self.inner.stop_tx.subscribe();
        tokio::select! {
            res = self.inner.prop_tx.send(proposal) => res.map_err(|_| RaftError::Stopped),
            _ = stopped(&mut stop_rx) => Err(RaftError::Stopped),
        }
    }

    /// Advance the group's logical clock. Dropped when the tick queue is full.
    pub(crate) fn tick(&self) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.inner.tick_tx.try_send(()) {
            debug!(group = self.inner.group_id, "tick queue full, dropping tick");
        }
    }

    /// Hand an inbound message to the worker. Dropped with a warning when
    /// the receive queue is full.
    pub(crate) fn receive_message(&self, m: Message) {
        if m.msg_type == MessageType::HeartbeatResponse && !self.is_leader() {
            return;
        }
        match self.inner.recv_tx.try_send(m) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!(
                    group = self.inner.group_id,
                    from = m.from,
                    msg_type = %m.msg_type,
                    "raft receive queue full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Start an election on this replica.
    pub fn campaign(&self) -> Result<()> {
        match self.inner.campaign_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RaftError::Stopped),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.inner.soft_state.borrow().leader == self.inner.node_id
    }

    pub fn soft_state(&self) -> SoftState {
        *self.inner.soft_state.borrow()
    }

    /// Receiver notified on every leader or term change.
    pub fn watch_soft_state(&self) -> watch::Receiver<SoftState> {
        self.inner.soft_state.clone()
    }

    /// Index of the last entry applied to the state machine.
    pub fn applied(&self) -> u64 {
        self.inner.applied.load(Ordering::Acquire)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peer_state.get()
    }

    pub(crate) fn has_peer(&self, id: NodeId) -> bool {
        self.inner.peer_state.contains(id)
    }

    pub async fn status(&self) -> Result<Status> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .status_tx
            .send(tx)
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }

    pub fn stop(&self) {
        self.inner.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }
}

struct Worker {
    group_id: GroupId,
    fsm: RaftFsm,
    transport: Arc<dyn Transport>,
    tick_rx: mpsc::Receiver<()>,
    recv_rx: mpsc::Receiver<Message>,
    prop_rx: mpsc::Receiver<Proposal>,
    campaign_rx: mpsc::Receiver<()>,
    status_rx: mpsc::Receiver<oneshot::Sender<Status>>,
    ready_tx: mpsc::Sender<()>,
    ready_rx: mpsc::Receiver<()>,
    apply_tx: mpsc::Sender<ApplyTask>,
    soft_tx: watch::Sender<SoftState>,
    peer_state: Arc<PeerState>,
    applied: Arc<AtomicU64>,
    prev_hs: HardState,
    stop_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        debug!(group = self.group_id, "raft worker started");
        self.maybe_ready();

        loop {
            let res = tokio::select! {
                _ = stopped(&mut self.stop_rx) => break,
                Some(()) = self.tick_rx.recv() => {
                    self.fsm.tick();
                    Ok(())
                }
                Some(m) = self.recv_rx.recv() => self.fsm.step(m),
                Some(p) = self.prop_rx.recv() => self.step_proposals(p),
                Some(()) = self.campaign_rx.recv() => self.fsm.campaign(),
                Some(reply) = self.status_rx.recv() => {
                    let mut status = self.fsm.status();
                    status.applied = self.applied.load(Ordering::Acquire);
                    let _ = reply.send(status);
                    Ok(())
                }
                Some(()) = self.ready_rx.recv() => self.flush().await,
                else => break,
            };

            if let Err(e) = res {
                match e {
                    RaftError::Stopped => break,
                    e => {
                        error!(group = self.group_id, error = %e, "raft worker failed, stopping group");
                        break;
                    }
                }
            }
            self.maybe_ready();
        }
        info!(group = self.group_id, "raft worker stopped");
    }

    /// Fold up to [`MAX_PROPOSAL_BATCH`] queued proposals into one step.
    fn step_proposals(&mut self, first: Proposal) -> Result<()> {
        let mut entries = vec![Entry::new(0, 0, first.entry_type, first.data)];
        while entries.len() < MAX_PROPOSAL_BATCH {
            match self.prop_rx.try_recv() {
                Ok(p) => entries.push(Entry::new(0, 0, p.entry_type, p.data)),
                Err(_) => break,
            }
        }
        let mut m = Message::new(MessageType::LocalPropose);
        m.entries = entries;
        self.fsm.step(m)
    }

    fn has_ready(&self) -> bool {
        let soft = *self.soft_tx.borrow();
        !self.fsm.msgs.is_empty()
            || !self.fsm.log.unstable_entries().is_empty()
            || self.fsm.log.has_next_ents()
            || self.fsm.hard_state() != self.prev_hs
            || soft.leader != self.fsm.leader
            || soft.term != self.fsm.term
    }

    fn maybe_ready(&self) {
        if self.has_ready() {
            let _ = self.ready_tx.try_send(());
        }
    }

    /// Persist, publish, send, then hand committed entries to the apply task.
    async fn flush(&mut self) -> Result<()> {
        self.fsm.log.persist()?;
        let hs = self.fsm.hard_state();
        if hs != self.prev_hs {
            self.fsm.log.store_hard_state(hs)?;
            self.prev_hs = hs;
        }

        self.publish_soft_state().await?;

        let msgs = std::mem::take(&mut self.fsm.msgs);
        for m in msgs {
            if m.msg_type == MessageType::Snapshot {
                warn!(
                    group = self.group_id,
                    to = m.to,
                    index = m.index,
                    "snapshot transfer not implemented, dropping snapshot message"
                );
                continue;
            }
            self.transport.send(m).await;
        }

        if self.fsm.log.has_next_ents() {
            let ents = self.fsm.log.next_ents()?;
            let Some(last) = ents.last().map(|e| e.index) else {
                return Ok(());
            };
            for e in ents.iter().filter(|e| e.entry_type == EntryType::ConfChange) {
                let cc = ConfChange::decode(&e.data)?;
                self.fsm.apply_conf_change(&cc);
                self.peer_state.replace(self.fsm.peers());
            }
            self.dispatch(ApplyTask::Entries(ents)).await?;
            self.fsm.log.applied_to(last)?;
        }
        Ok(())
    }

    async fn publish_soft_state(&mut self) -> Result<()> {
        let current = SoftState {
            leader: self.fsm.leader,
            term: self.fsm.term,
        };
        let previous = *self.soft_tx.borrow();
        if current == previous {
            return Ok(());
        }

        self.soft_tx.send_replace(current);
        if current.leader != previous.leader {
            info!(
                group = self.group_id,
                leader = current.leader,
                previous = previous.leader,
                term = current.term,
                "leader changed"
            );
            self.dispatch(ApplyTask::LeaderChange(current.leader)).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, task: ApplyTask) -> Result<()> {
        tokio::select! {
            res = self.apply_tx.send(task) => {
                if res.is_err() {
                    debug!(group = self.group_id, "apply task has exited, dropping committed entries");
                }
                Ok(())
            }
            _ = stopped(&mut self.stop_rx) => Err(RaftError::Stopped),
        }
    }
}

/// Apply committed entries in index order until the queue closes or the
/// state machine fails.
async fn run_apply(
    group_id: GroupId,
    mut sm: Box<dyn StateMachine>,
    mut rx: mpsc::Receiver<ApplyTask>,
    applied: Arc<AtomicU64>,
) {
    while let Some(task) = rx.recv().await {
        let ents = match task {
            ApplyTask::LeaderChange(leader) => {
                sm.handle_leader_change(leader);
                continue;
            }
            ApplyTask::Entries(ents) => ents,
        };

        for e in ents {
            let res = match e.entry_type {
                EntryType::Normal if e.data.is_empty() => Ok(()),
                EntryType::Normal => sm.apply(&e.data, e.index),
                EntryType::ConfChange => ConfChange::decode(&e.data)
                    .map_err(RaftError::from)
                    .and_then(|cc| sm.apply_member_change(&cc, e.index)),
            };
            if let Err(err) = res {
                error!(
                    group = group_id,
                    index = e.index,
                    error = %err,
                    "failed to apply entry, halting apply loop"
                );
                return;
            }
            applied.store(e.index, Ordering::Release);
        }
    }
    debug!(group = group_id, "apply loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::raft::state_machine::tests::RecordingStateMachine;
    use crate::storage::{MemoryStorage, Storage};

    /// Captures outbound messages instead of sending them.
    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for CaptureTransport {
        async fn send(&self, m: Message) {
            self.sent.lock().push(m);
        }

        fn stop(&self) {}
    }

    /// Parks every send until released, which stalls the worker in flush.
    #[derive(Default)]
    struct StallTransport {
        parked: AtomicU64,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Transport for StallTransport {
        async fn send(&self, _m: Message) {
            self.parked.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
        }

        fn stop(&self) {}
    }

    /// A two-voter leader whose worker is stuck sending its first append.
    async fn stalled_leader(node: NodeConfig) -> (Raft, Arc<StallTransport>) {
        let transport = Arc::new(StallTransport::default());
        let raft = spawn_with(
            &node,
            &[1, 2],
            1,
            Arc::new(MemoryStorage::new()),
            RecordingStateMachine::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        wait_until(|| transport.parked.load(Ordering::SeqCst) > 0).await;
        (raft, transport)
    }

    fn node_config(node_id: NodeId) -> NodeConfig {
        NodeConfig {
            node_id,
            ..Default::default()
        }
    }

    fn spawn_group(
        node_id: NodeId,
        peers: &[NodeId],
        leader: NodeId,
        storage: Arc<MemoryStorage>,
        sm: RecordingStateMachine,
        transport: Arc<CaptureTransport>,
    ) -> Raft {
        spawn_with(&node_config(node_id), peers, leader, storage, sm, transport)
    }

    fn spawn_with(
        node: &NodeConfig,
        peers: &[NodeId],
        leader: NodeId,
        storage: Arc<MemoryStorage>,
        sm: RecordingStateMachine,
        transport: Arc<dyn Transport>,
    ) -> Raft {
        Raft::spawn(
            node,
            RaftConfig {
                group_id: 7,
                term: 1,
                leader,
                applied: 0,
                peers: peers.iter().map(|id| Peer::normal(*id)).collect(),
                storage,
                state_machine: Box::new(sm),
            },
            transport,
        )
        .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_single_voter_commits_and_applies() {
        let storage = Arc::new(MemoryStorage::new());
        let sm = RecordingStateMachine::default();
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_group(1, &[1], 1, Arc::clone(&storage), sm.clone(), transport);

        assert!(raft.is_leader());
        raft.propose(b"foo=bar".to_vec()).await.unwrap();
        raft.propose(b"baz=qux".to_vec()).await.unwrap();

        wait_until(|| raft.applied() == 3).await;
        let recorded = sm.recorded.lock();
        assert_eq!(
            recorded.commands,
            vec![(2, b"foo=bar".to_vec()), (3, b"baz=qux".to_vec())]
        );
        assert_eq!(recorded.leaders, vec![1]);
        drop(recorded);

        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.initial_state().unwrap().commit, 3);
        raft.stop();
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_group(
            2,
            &[1, 2],
            1,
            Arc::clone(&storage),
            RecordingStateMachine::default(),
            transport,
        );

        assert!(!raft.is_leader());
        raft.propose(b"ignored".to_vec()).await.unwrap();
        let status = raft.status().await.unwrap();
        assert_eq!(status.last_index, 0);
        assert_eq!(status.leader, 1);
        raft.stop();
    }

    #[tokio::test]
    async fn test_propose_after_stop_fails() {
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_group(
            1,
            &[1],
            1,
            Arc::new(MemoryStorage::new()),
            RecordingStateMachine::default(),
            transport,
        );
        raft.stop();
        assert!(matches!(
            raft.propose(b"late".to_vec()).await,
            Err(RaftError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_leader_flushes_append_to_transport() {
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_group(
            1,
            &[1, 2],
            1,
            Arc::new(MemoryStorage::new()),
            RecordingStateMachine::default(),
            Arc::clone(&transport),
        );

        wait_until(|| !transport.sent.lock().is_empty()).await;
        let sent = transport.sent.lock().clone();
        assert_eq!(sent[0].msg_type, MessageType::Append);
        assert_eq!(sent[0].group_id, 7);
        assert_eq!(sent[0].to, 2);
        assert_eq!(sent[0].term, 1);
        assert_eq!(raft.applied(), 0);
        raft.stop();
    }

    #[tokio::test]
    async fn test_member_change_updates_peers() {
        let sm = RecordingStateMachine::default();
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_group(
            1,
            &[1],
            1,
            Arc::new(MemoryStorage::new()),
            sm.clone(),
            transport,
        );

        raft.propose_member_change(ConfChange {
            change_type: crate::proto::ConfChangeType::AddNode,
            peer: Peer::learner(5),
            context: b"10.0.0.5".to_vec(),
        })
        .await
        .unwrap();

        wait_until(|| raft.applied() == 2).await;
        assert_eq!(raft.peers(), vec![Peer::normal(1), Peer::learner(5)]);
        assert!(raft.has_peer(5));
        assert_eq!(sm.recorded.lock().changes.len(), 1);
        raft.stop();
    }

    #[tokio::test]
    async fn test_campaign_single_voter() {
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_group(
            1,
            &[1],
            NO_LEADER,
            Arc::new(MemoryStorage::new()),
            RecordingStateMachine::default(),
            transport,
        );
        assert!(!raft.is_leader());

        raft.campaign().unwrap();
        let mut soft = raft.watch_soft_state();
        tokio::time::timeout(Duration::from_secs(2), soft.wait_for(|s| s.leader == 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raft.soft_state().term, 2);
        raft.stop();
    }

    #[tokio::test]
    async fn test_oversized_proposal_is_rejected() {
        let node = NodeConfig {
            node_id: 1,
            max_size_per_msg: 16,
            ..Default::default()
        };
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(CaptureTransport::default());
        let raft = spawn_with(
            &node,
            &[1],
            1,
            Arc::clone(&storage),
            RecordingStateMachine::default(),
            transport,
        );
        wait_until(|| raft.applied() == 1).await;

        let res = raft.propose(vec![0u8; 17]).await;
        assert!(matches!(
            res,
            Err(RaftError::ProposalTooLarge { size: 17, limit: 16 })
        ));
        let res = raft
            .propose_member_change(ConfChange {
                change_type: crate::proto::ConfChangeType::AddNode,
                peer: Peer::normal(2),
                context: vec![0u8; 64],
            })
            .await;
        assert!(matches!(res, Err(RaftError::ProposalTooLarge { .. })));

        raft.propose(vec![1u8; 16]).await.unwrap();
        wait_until(|| raft.applied() == 2).await;
        assert_eq!(storage.last_index().unwrap(), 2);
        raft.stop();
    }

    #[tokio::test]
    async fn test_full_proposal_queue_blocks_until_stopped() {
        let (raft, transport) = stalled_leader(node_config(1)).await;

        for i in 0..PROPOSAL_QUEUE_SIZE {
            tokio::time::timeout(Duration::from_secs(1), raft.propose(vec![i as u8]))
                .await
                .unwrap()
                .unwrap();
        }
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), raft.propose(b"over".to_vec())).await;
        assert!(blocked.is_err());

        let waiter = {
            let raft = raft.clone();
            tokio::spawn(async move { raft.propose(b"waiting".to_vec()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        raft.stop();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(RaftError::Stopped)));
        transport.release.notify_waiters();
    }

    #[tokio::test]
    async fn test_full_receive_queue_drops_without_blocking() {
        let node = NodeConfig {
            node_id: 1,
            req_buffer_size: 4,
            ..Default::default()
        };
        let (raft, transport) = stalled_leader(node).await;

        for _ in 0..10 {
            let mut m = Message::new(MessageType::HeartbeatResponse);
            m.group_id = 7;
            m.from = 2;
            m.to = 1;
            m.term = 1;
            raft.receive_message(m);
        }
        assert_eq!(raft.inner.recv_tx.capacity(), 0);

        raft.stop();
        transport.release.notify_waiters();
    }
}
