//! Multi-raft host.
//!
//! A [`Node`] owns every raft group of one process. It drives a single tick
//! clock for all of them and coalesces heartbeats: every `heartbeat_tick`
//! ticks it sends one [`MessageType::HeartbeatRequest`] per destination peer,
//! listing the groups it leads with that peer, instead of one heartbeat per
//! group.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::config::{NodeConfig, RaftConfig};
use super::error::{RaftError, Result};
use super::fsm::Status;
use super::group::Raft;
use crate::proto::{
    decode_hb_context, encode_hb_context, ConfChange, GroupId, Message, MessageType, NodeId,
};
use crate::shutdown::stopped;
use crate::transport::{MessageHandler, MultiTransport, Resolver, Transport};

/// Capacity of the queue feeding inbound heartbeats to the tick loop.
const HEARTBEAT_QUEUE_SIZE: usize = 512;

struct NodeInner {
    config: NodeConfig,
    rafts: RwLock<HashMap<GroupId, Raft>>,
    transport: Arc<dyn Transport>,
    heart_tx: mpsc::Sender<Message>,
    stop_tx: watch::Sender<bool>,
    listen_addrs: Option<(SocketAddr, SocketAddr)>,
}

/// Handle to the multi-raft host. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Validate `config`, bind both TCP fabrics and start serving.
    pub async fn new(mut config: NodeConfig, resolver: Arc<dyn Resolver>) -> Result<Self> {
        config.validate()?;
        let transport =
            Arc::new(MultiTransport::bind(&config.transport, config.node_id, resolver).await?);
        let addrs = (transport.heartbeat_addr(), transport.replicate_addr());

        let node = Self::build(config, transport.clone(), Some(addrs))?;
        transport.serve(Arc::new(node.clone()));
        Ok(node)
    }

    /// Host groups over a caller-provided transport. The caller is
    /// responsible for delivering inbound messages to this node's
    /// [`MessageHandler`] implementation.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::build(config, transport, None)
    }

    fn build(
        mut config: NodeConfig,
        transport: Arc<dyn Transport>,
        listen_addrs: Option<(SocketAddr, SocketAddr)>,
    ) -> Result<Self> {
        config.validate()?;

        let (heart_tx, heart_rx) = mpsc::channel(HEARTBEAT_QUEUE_SIZE);
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::new(NodeInner {
            config,
            rafts: RwLock::new(HashMap::new()),
            transport,
            heart_tx,
            stop_tx,
            listen_addrs,
        });

        info!(
            node = inner.config.node_id,
            tick_interval = ?inner.config.tick_interval,
            heartbeat_tick = inner.config.heartbeat_tick,
            "multiraft node started"
        );
        tokio::spawn(run_ticker(Arc::clone(&inner), heart_rx, stop_rx));
        Ok(Self { inner })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Bound heartbeat listener, when serving over TCP.
    pub fn heartbeat_addr(&self) -> Option<SocketAddr> {
        self.inner.listen_addrs.map(|(hb, _)| hb)
    }

    /// Bound replicate listener, when serving over TCP.
    pub fn replicate_addr(&self) -> Option<SocketAddr> {
        self.inner.listen_addrs.map(|(_, repl)| repl)
    }

    /// Create and register a raft group.
    pub fn create_raft(&self, config: RaftConfig) -> Result<Raft> {
        if *self.inner.stop_tx.borrow() {
            return Err(RaftError::Stopped);
        }
        config.validate()?;

        let group_id = config.group_id;
        let mut rafts = self.inner.rafts.write();
        if rafts.contains_key(&group_id) {
            return Err(RaftError::GroupExists(group_id));
        }
        let raft = Raft::spawn(&self.inner.config, config, Arc::clone(&self.inner.transport))?;
        rafts.insert(group_id, raft.clone());
        info!(node = self.node_id(), group = group_id, "raft group registered");
        Ok(raft)
    }

    pub fn raft(&self, group_id: GroupId) -> Option<Raft> {
        self.inner.rafts.read().get(&group_id).cloned()
    }

    fn get_raft(&self, group_id: GroupId) -> Result<Raft> {
        if *self.inner.stop_tx.borrow() {
            return Err(RaftError::Stopped);
        }
        self.raft(group_id).ok_or(RaftError::GroupNotFound(group_id))
    }

    pub async fn propose(&self, group_id: GroupId, data: Vec<u8>) -> Result<()> {
        self.get_raft(group_id)?.propose(data).await
    }

    pub async fn propose_member_change(&self, group_id: GroupId, change: ConfChange) -> Result<()> {
        self.get_raft(group_id)?.propose_member_change(change).await
    }

    pub fn is_leader(&self, group_id: GroupId) -> bool {
        self.raft(group_id).map(|r| r.is_leader()).unwrap_or(false)
    }

    /// Leader and term of a group, `None` for unknown groups.
    pub fn leader_term(&self, group_id: GroupId) -> Option<(NodeId, u64)> {
        self.raft(group_id).map(|r| {
            let soft = r.soft_state();
            (soft.leader, soft.term)
        })
    }

    pub fn applied(&self, group_id: GroupId) -> u64 {
        self.raft(group_id).map(|r| r.applied()).unwrap_or(0)
    }

    pub fn campaign(&self, group_id: GroupId) -> Result<()> {
        self.get_raft(group_id)?.campaign()
    }

    pub async fn status(&self, group_id: GroupId) -> Result<Status> {
        self.get_raft(group_id)?.status().await
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.inner.rafts.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every group, the tick loop and the transport.
    pub fn stop(&self) {
        if self.inner.stop_tx.send_replace(true) {
            return;
        }
        let rafts: Vec<Raft> = self.inner.rafts.write().drain().map(|(_, r)| r).collect();
        for raft in &rafts {
            raft.stop();
        }
        self.inner.transport.stop();
        info!(node = self.node_id(), groups = rafts.len(), "multiraft node stopped");
    }
}

impl MessageHandler for Node {
    fn receive_heartbeat(&self, m: Message) {
        match self.inner.heart_tx.try_send(m) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(m)) => {
                warn!(
                    node = self.node_id(),
                    from = m.from,
                    msg_type = %m.msg_type,
                    "heartbeat queue full, dropping heartbeat"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn receive_message(&self, m: Message) {
        if m.is_heartbeat() {
            self.receive_heartbeat(m);
            return;
        }
        // Messages for groups not hosted here are discarded.
        if let Some(raft) = self.inner.rafts.read().get(&m.group_id) {
            raft.receive_message(m);
        }
    }
}

impl NodeInner {
    fn groups(&self) -> Vec<Raft> {
        self.rafts.read().values().cloned().collect()
    }

    /// One coalesced heartbeat per peer, covering every group led here.
    fn coalesce_heartbeats(&self) -> Vec<Message> {
        let node_id = self.config.node_id;
        let mut per_peer: HashMap<NodeId, Vec<GroupId>> = HashMap::new();
        for raft in self.groups() {
            if !raft.is_leader() {
                continue;
            }
            for peer in raft.peers() {
                if peer.id == node_id {
                    continue;
                }
                per_peer.entry(peer.id).or_default().push(raft.group_id());
            }
        }

        let mut msgs: Vec<Message> = per_peer
            .into_iter()
            .map(|(to, mut ids)| {
                ids.sort_unstable();
                let mut m = Message::new(MessageType::HeartbeatRequest);
                m.from = node_id;
                m.to = to;
                m.context = encode_hb_context(&ids);
                m
            })
            .collect();
        msgs.sort_unstable_by_key(|m| m.to);
        msgs
    }

    async fn send_heartbeat(&self) {
        for m in self.coalesce_heartbeats() {
            self.transport.send(m).await;
        }
    }

    /// Fan a coalesced heartbeat out to the hosted groups it names. Returns
    /// the ids of those groups.
    fn forward_heartbeat(&self, m: &Message) -> Vec<GroupId> {
        let ids = decode_hb_context(&m.context);
        let rafts = self.rafts.read();
        let mut hosted = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(raft) = rafts.get(&id) else {
                continue;
            };
            let mut msg = Message::new(m.msg_type);
            msg.group_id = id;
            msg.from = m.from;
            msg.to = m.to;
            msg.term = m.term;
            raft.receive_message(msg);
            hosted.push(id);
        }
        hosted
    }

    async fn handle_heartbeat(&self, m: Message) {
        match m.msg_type {
            MessageType::HeartbeatRequest => {
                let hosted = self.forward_heartbeat(&m);
                if hosted.is_empty() {
                    debug!(from = m.from, "heartbeat names no hosted group");
                    return;
                }
                let mut resp = Message::new(MessageType::HeartbeatResponse);
                resp.from = self.config.node_id;
                resp.to = m.from;
                resp.context = encode_hb_context(&hosted);
                self.transport.send(resp).await;
            }
            MessageType::HeartbeatResponse => {
                self.forward_heartbeat(&m);
            }
            other => {
                debug!(msg_type = %other, "non-heartbeat message on heartbeat queue");
            }
        }
    }
}

/// Node-wide clock: ticks every group, sends coalesced heartbeats and
/// serves inbound heartbeats.
async fn run_ticker(
    inner: Arc<NodeInner>,
    mut heart_rx: mpsc::Receiver<Message>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(inner.config.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            _ = interval.tick() => {
                ticks += 1;
                if ticks >= inner.config.heartbeat_tick {
                    ticks = 0;
                    inner.send_heartbeat().await;
                }
                for raft in inner.groups() {
                    raft.tick();
                }
            }
            Some(m) = heart_rx.recv() => inner.handle_heartbeat(m).await,
        }
    }
    debug!(node = inner.config.node_id, "tick loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::proto::{Peer, NO_LEADER};
    use crate::raft::state_machine::tests::RecordingStateMachine;
    use crate::storage::MemoryStorage;

    #[derive(Default)]
    struct CaptureTransport {
        sent: Mutex<Vec<Message>>,
    }

    impl CaptureTransport {
        fn heartbeats(&self) -> Vec<Message> {
            self.sent
                .lock()
                .iter()
                .filter(|m| m.is_heartbeat())
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Transport for CaptureTransport {
        async fn send(&self, m: Message) {
            self.sent.lock().push(m);
        }

        fn stop(&self) {}
    }

    fn node(node_id: NodeId, transport: Arc<CaptureTransport>) -> Node {
        let config = NodeConfig {
            node_id,
            tick_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        Node::with_transport(config, transport).unwrap()
    }

    fn group(group_id: GroupId, peers: &[NodeId], leader: NodeId) -> RaftConfig {
        RaftConfig {
            group_id,
            term: 1,
            leader,
            applied: 0,
            peers: peers.iter().map(|id| Peer::normal(*id)).collect(),
            storage: Arc::new(MemoryStorage::new()),
            state_machine: Box::new(RecordingStateMachine::default()),
        }
    }

    #[tokio::test]
    async fn test_bootstrapped_leaders_report_immediately() {
        let node = node(1, Arc::new(CaptureTransport::default()));
        node.create_raft(group(1, &[1, 2], 1)).unwrap();
        node.create_raft(group(2, &[1, 2], 1)).unwrap();

        for id in [1, 2] {
            assert!(node.is_leader(id));
            assert_eq!(node.applied(id), 0);
            assert_eq!(node.leader_term(id), Some((1, 1)));
        }
        node.stop();
    }

    #[tokio::test]
    async fn test_create_raft_validation() {
        let node = node(1, Arc::new(CaptureTransport::default()));
        assert!(matches!(
            node.create_raft(group(0, &[1], 1)),
            Err(RaftError::Config(_))
        ));
        assert!(matches!(
            node.create_raft(group(3, &[], NO_LEADER)),
            Err(RaftError::Config(_))
        ));

        node.create_raft(group(3, &[1], 1)).unwrap();
        assert!(matches!(
            node.create_raft(group(3, &[1], 1)),
            Err(RaftError::GroupExists(3))
        ));
        assert!(matches!(
            node.propose(9, b"x".to_vec()).await,
            Err(RaftError::GroupNotFound(9))
        ));
        node.stop();
    }

    #[tokio::test]
    async fn test_heartbeats_coalesce_per_peer() {
        let node = node(1, Arc::new(CaptureTransport::default()));
        node.create_raft(group(1, &[1, 2], 1)).unwrap();
        node.create_raft(group(2, &[1, 2, 3], 1)).unwrap();
        node.create_raft(group(3, &[1, 3], 1)).unwrap();
        // Follower groups are not covered.
        node.create_raft(group(4, &[1, 2, 3], 2)).unwrap();

        let msgs = node.inner.coalesce_heartbeats();
        assert_eq!(msgs.len(), 2);

        assert_eq!(msgs[0].to, 2);
        assert_eq!(decode_hb_context(&msgs[0].context), vec![1, 2]);
        assert_eq!(msgs[1].to, 3);
        assert_eq!(decode_hb_context(&msgs[1].context), vec![2, 3]);
        for m in &msgs {
            assert_eq!(m.msg_type, MessageType::HeartbeatRequest);
            assert_eq!(m.from, 1);
            assert_eq!(m.term, 0);
            assert_eq!(m.group_id, 0);
        }
        node.stop();
    }

    #[tokio::test]
    async fn test_heartbeat_request_answers_hosted_groups() {
        let transport = Arc::new(CaptureTransport::default());
        let node = node(2, Arc::clone(&transport));
        node.create_raft(group(1, &[1, 2], 1)).unwrap();
        node.create_raft(group(2, &[1, 2], 1)).unwrap();

        let mut m = Message::new(MessageType::HeartbeatRequest);
        m.from = 1;
        m.to = 2;
        m.context = encode_hb_context(&[1, 2, 9]);
        node.inner.handle_heartbeat(m).await;

        let sent = transport.heartbeats();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::HeartbeatResponse);
        assert_eq!(sent[0].to, 1);
        assert_eq!(decode_hb_context(&sent[0].context), vec![1, 2]);
        node.stop();
    }

    #[tokio::test]
    async fn test_heartbeat_response_reaches_leader_replica() {
        let node = node(1, Arc::new(CaptureTransport::default()));
        let raft = node.create_raft(group(5, &[1, 2], 1)).unwrap();

        let mut m = Message::new(MessageType::HeartbeatResponse);
        m.from = 2;
        m.to = 1;
        m.context = encode_hb_context(&[5]);
        node.receive_message(m);

        let mut active = false;
        for _ in 0..100 {
            let status = raft.status().await.unwrap();
            if status.replicas.iter().any(|r| r.peer.id == 2 && r.active) {
                active = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(active);
        node.stop();
    }

    #[tokio::test]
    async fn test_unknown_group_is_discarded() {
        let node = node(1, Arc::new(CaptureTransport::default()));
        let mut m = Message::new(MessageType::Append);
        m.group_id = 42;
        m.from = 2;
        m.term = 1;
        node.receive_message(m);
        assert!(node.raft(42).is_none());
        node.stop();
    }

    #[tokio::test]
    async fn test_tick_loop_advances_groups() {
        let config = NodeConfig {
            node_id: 2,
            tick_interval: Duration::from_millis(10),
            heartbeat_tick: 2,
            ..Default::default()
        };
        let transport = Arc::new(CaptureTransport::default());
        let node = Node::with_transport(config, transport.clone()).unwrap();
        let follower = node.create_raft(group(1, &[1, 2], 1)).unwrap();
        node.create_raft(group(2, &[2, 3], 2)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(follower.status().await.unwrap().election_elapsed > 0);
        let hb = transport.heartbeats();
        assert!(!hb.is_empty());
        assert!(hb.iter().all(|m| m.to == 3 && decode_hb_context(&m.context) == vec![2]));
        node.stop();
    }

    #[tokio::test]
    async fn test_stop_rejects_new_groups() {
        let node = node(1, Arc::new(CaptureTransport::default()));
        let raft = node.create_raft(group(1, &[1], 1)).unwrap();
        node.stop();
        assert!(raft.is_stopped());
        assert!(matches!(
            node.create_raft(group(2, &[1], 1)),
            Err(RaftError::Stopped)
        ));
    }
}
