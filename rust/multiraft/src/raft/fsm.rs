//! Consensus state machine of one raft group.
//!
//! [`RaftFsm`] is a pure, single-threaded state machine: it consumes
//! [`Message`]s through [`RaftFsm::step`] and accumulates outbound messages
//! in `msgs` for the owning worker to flush. Role-specific handling is
//! dispatched on [`StateRole`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::config::{NodeConfig, RaftConfig};
use super::error::{RaftError, Result};
use super::log::RaftLog;
use super::replica::{Replica, ReplicaState};
use crate::proto::{
    ConfChange, ConfChangeType, Entry, EntryType, GroupId, HardState, Message, MessageType, NodeId,
    Peer, NO_LEADER,
};
use crate::storage::NO_LIMIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRole {
    Follower,
    Candidate,
    Leader,
    /// Won the vote, collecting leadership acknowledgements.
    ElectionAck,
}

impl fmt::Display for StateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateRole::Follower => "StateFollower",
            StateRole::Candidate => "StateCandidate",
            StateRole::Leader => "StateLeader",
            StateRole::ElectionAck => "StateElectionACK",
        };
        f.write_str(name)
    }
}

/// Replication progress of one member as seen by the leader.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub peer: Peer,
    pub state: ReplicaState,
    pub matched: u64,
    pub next: u64,
    pub committed: u64,
    pub active: bool,
    pub inactive_for: Duration,
    pub paused: bool,
    pub inflight: usize,
}

/// Point-in-time view of a group.
#[derive(Debug, Clone)]
pub struct Status {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub leader: NodeId,
    pub term: u64,
    pub vote: NodeId,
    pub role: StateRole,
    pub committed: u64,
    pub applied: u64,
    pub last_index: u64,
    pub election_elapsed: u32,
    pub pending_conf: bool,
    /// Empty unless this node leads the group.
    pub replicas: Vec<ReplicaStatus>,
}

pub(crate) struct RaftFsm {
    pub(crate) group_id: GroupId,
    pub(crate) node_id: NodeId,
    pub(crate) term: u64,
    pub(crate) vote: NodeId,
    pub(crate) leader: NodeId,
    pub(crate) state: StateRole,
    pub(crate) log: RaftLog,
    pub(crate) replicas: HashMap<NodeId, Replica>,
    votes: HashMap<NodeId, bool>,
    acks: HashMap<NodeId, bool>,
    pending_conf: bool,
    election_elapsed: u32,
    max_msg_size: u64,
    max_inflight: usize,
    lease_check: bool,
    /// Outbound messages, drained by the group worker.
    pub(crate) msgs: Vec<Message>,
}

impl RaftFsm {
    pub(crate) fn new(node: &NodeConfig, raft: &RaftConfig) -> Result<Self> {
        let log = RaftLog::new(Arc::clone(&raft.storage), raft.applied)?;
        let hs = raft.storage.initial_state()?;

        let mut fsm = Self {
            group_id: raft.group_id,
            node_id: node.node_id,
            term: hs.term,
            vote: hs.vote,
            leader: NO_LEADER,
            state: StateRole::Follower,
            log,
            replicas: HashMap::with_capacity(raft.peers.len()),
            votes: HashMap::new(),
            acks: HashMap::new(),
            pending_conf: false,
            election_elapsed: 0,
            max_msg_size: node.max_size_per_msg,
            max_inflight: node.max_inflight_msgs,
            lease_check: node.lease_check,
            msgs: Vec::new(),
        };
        for peer in &raft.peers {
            fsm.replicas
                .insert(peer.id, Replica::new(*peer, fsm.max_inflight));
        }

        // A configured leader only applies to a term newer than anything
        // persisted; otherwise the group resumes as a leaderless follower.
        let fresh = hs.is_empty() || raft.term > hs.term;
        if raft.leader == fsm.node_id && fresh {
            fsm.become_follower(raft.term, NO_LEADER);
            fsm.become_leader()?;
        } else if fresh {
            fsm.become_follower(raft.term, raft.leader);
        } else {
            fsm.become_follower(hs.term, NO_LEADER);
        }

        info!(
            group = fsm.group_id,
            node = fsm.node_id,
            term = fsm.term,
            leader = fsm.leader,
            committed = fsm.log.committed(),
            applied = fsm.log.applied(),
            last_index = fsm.log.last_index(),
            "raft group created"
        );
        Ok(fsm)
    }

    /// Feed one message into the state machine.
    ///
    /// Term zero marks node-local proposals and coalesced heartbeats, which
    /// skip the term check.
    pub(crate) fn step(&mut self, m: Message) -> Result<()> {
        if m.term > self.term {
            let leader = match m.msg_type {
                MessageType::Append | MessageType::Snapshot | MessageType::ElectionAck => m.from,
                _ => NO_LEADER,
            };
            info!(
                group = self.group_id,
                node = self.node_id,
                term = self.term,
                msg_term = m.term,
                from = m.from,
                msg_type = %m.msg_type,
                "received message with higher term"
            );
            self.become_follower(m.term, leader);
        } else if m.term != 0 && m.term < self.term {
            debug!(
                group = self.group_id,
                node = self.node_id,
                term = self.term,
                msg_term = m.term,
                from = m.from,
                msg_type = %m.msg_type,
                "ignored message with lower term"
            );
            return Ok(());
        }

        match self.state {
            StateRole::Follower => self.step_follower(m),
            StateRole::Candidate => self.step_candidate(m),
            StateRole::Leader => self.step_leader(m),
            StateRole::ElectionAck => self.step_election_ack(m),
        }
    }

    fn step_leader(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::LocalPropose => {
                if m.entries.is_empty() {
                    return Ok(());
                }
                let mut entries = m.entries;
                for e in entries.iter_mut() {
                    if e.entry_type == EntryType::ConfChange {
                        if self.pending_conf {
                            debug!(group = self.group_id, "replacing second pending conf change");
                            *e = Entry::default();
                        } else {
                            self.pending_conf = true;
                        }
                    }
                }
                self.append_entries(entries)?;
                self.bcast_append();
            }
            MessageType::AppendResponse => self.handle_append_response(m),
            MessageType::HeartbeatResponse => {
                let last_index = self.log.last_index();
                let lagging = match self.replicas.get_mut(&m.from) {
                    Some(r) => {
                        r.mark_active();
                        match r.state {
                            ReplicaState::Probe => r.resume(),
                            ReplicaState::Replicate if r.inflight.full() => {
                                r.inflight.free_first_one()
                            }
                            _ => {}
                        }
                        r.matched < last_index
                    }
                    None => {
                        debug!(group = self.group_id, from = m.from, "heartbeat response from unknown replica");
                        return Ok(());
                    }
                };
                if lagging {
                    self.send_append(m.from);
                }
            }
            MessageType::Vote => self.handle_vote(&m),
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::LocalPropose => {
                debug!(group = self.group_id, leader = self.leader, "dropping proposal on follower");
            }
            MessageType::HeartbeatRequest => {
                if m.from == self.leader {
                    self.election_elapsed = 0;
                } else {
                    debug!(
                        group = self.group_id,
                        from = m.from,
                        leader = self.leader,
                        "ignored heartbeat from non-leader"
                    );
                }
            }
            MessageType::Append => {
                self.election_elapsed = 0;
                self.leader = m.from;
                self.handle_append(m)?;
            }
            MessageType::Snapshot => {
                self.election_elapsed = 0;
                self.leader = m.from;
                self.handle_snapshot(&m);
            }
            MessageType::Vote => self.handle_vote(&m),
            MessageType::ElectionAck => {
                self.election_elapsed = 0;
                self.leader = m.from;
                let mut resp = Message::new(MessageType::ElectionAckResponse);
                resp.to = m.from;
                self.send(resp);
            }
            _ => {}
        }
        Ok(())
    }

    fn step_candidate(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::LocalPropose => {
                debug!(group = self.group_id, "dropping proposal during election");
            }
            MessageType::Append => {
                self.become_follower(self.term, m.from);
                self.handle_append(m)?;
            }
            MessageType::Snapshot => {
                self.become_follower(self.term, m.from);
                self.handle_snapshot(&m);
            }
            MessageType::ElectionAck => {
                self.become_follower(self.term, m.from);
                let mut resp = Message::new(MessageType::ElectionAckResponse);
                resp.to = m.from;
                self.send(resp);
            }
            MessageType::Vote => self.handle_vote(&m),
            MessageType::VoteResponse => {
                let granted = self.poll(m.from, !m.reject);
                let rejected = self.votes.len() - granted;
                let quorum = self.quorum();
                debug!(
                    group = self.group_id,
                    term = self.term,
                    granted,
                    rejected,
                    quorum,
                    "vote tally"
                );
                if granted >= quorum {
                    self.win_election()?;
                } else if rejected >= quorum {
                    self.become_follower(self.term, NO_LEADER);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn step_election_ack(&mut self, m: Message) -> Result<()> {
        match m.msg_type {
            MessageType::LocalPropose => {
                debug!(group = self.group_id, "dropping proposal during election ack");
            }
            MessageType::ElectionAckResponse => {
                if self.is_voter(m.from) {
                    self.acks.insert(m.from, true);
                }
                if self.acks.len() >= self.quorum() {
                    self.become_leader()?;
                }
            }
            MessageType::Vote => self.handle_vote(&m),
            _ => {}
        }
        Ok(())
    }

    fn handle_append(&mut self, m: Message) -> Result<()> {
        let mut resp = Message::new(MessageType::AppendResponse);
        resp.to = m.from;

        let committed = self.log.committed();
        if m.index < committed {
            resp.index = committed;
            resp.commit = committed;
            self.send(resp);
            return Ok(());
        }

        match self
            .log
            .maybe_append(m.index, m.log_term, m.commit, &m.entries)?
        {
            Some(last_new) => {
                resp.index = last_new;
                resp.commit = self.log.committed();
            }
            None => {
                debug!(
                    group = self.group_id,
                    from = m.from,
                    index = m.index,
                    log_term = m.log_term,
                    last_index = self.log.last_index(),
                    "rejected append"
                );
                resp.index = m.index;
                resp.reject = true;
                resp.reject_hint = self.log.last_index();
                resp.commit = self.log.committed();
            }
        }
        self.send(resp);
        Ok(())
    }

    fn handle_append_response(&mut self, m: Message) {
        let Some(r) = self.replicas.get_mut(&m.from) else {
            debug!(group = self.group_id, from = m.from, "append response from unknown replica");
            return;
        };
        r.mark_active();

        if m.reject {
            debug!(
                group = self.group_id,
                from = m.from,
                index = m.index,
                hint = m.reject_hint,
                "append rejected"
            );
            if r.maybe_decr_to(m.index, m.reject_hint) {
                if r.state == ReplicaState::Replicate {
                    r.become_probe();
                }
                self.send_append(m.from);
            }
            return;
        }

        if !r.maybe_update(m.index, m.commit) {
            return;
        }
        match r.state {
            ReplicaState::Probe => r.become_replicate(),
            ReplicaState::Snapshot if r.need_snapshot_abort() => r.become_probe(),
            ReplicaState::Replicate => r.inflight.free_to(m.index),
            ReplicaState::Snapshot => {}
        }
        let (next, follower_commit) = (r.next, r.committed);

        if self.maybe_commit() {
            self.bcast_append();
        } else if next <= self.log.last_index() || follower_commit < self.log.committed() {
            self.send_append(m.from);
        }
    }

    fn handle_vote(&mut self, m: &Message) {
        let can_vote =
            self.vote == m.from || (self.vote == NO_LEADER && self.leader == NO_LEADER);
        let mut resp = Message::new(MessageType::VoteResponse);
        resp.to = m.from;

        if can_vote && self.log.is_up_to_date(m.index, m.log_term) {
            self.election_elapsed = 0;
            self.vote = m.from;
            info!(group = self.group_id, term = self.term, candidate = m.from, "granted vote");
        } else {
            debug!(
                group = self.group_id,
                term = self.term,
                candidate = m.from,
                vote = self.vote,
                "rejected vote"
            );
            resp.reject = true;
        }
        self.send(resp);
    }

    fn handle_snapshot(&mut self, m: &Message) {
        warn!(
            group = self.group_id,
            from = m.from,
            index = m.index,
            "snapshot transfer is not supported, ignoring"
        );
    }

    /// Start an election for the next term.
    pub(crate) fn campaign(&mut self) -> Result<()> {
        if self.state == StateRole::Leader {
            debug!(group = self.group_id, "already leader, ignoring campaign");
            return Ok(());
        }
        if !self.is_voter(self.node_id) {
            warn!(group = self.group_id, node = self.node_id, "non-voting member cannot campaign");
            return Ok(());
        }

        self.become_candidate();
        if self.poll(self.node_id, true) >= self.quorum() {
            return self.win_election();
        }

        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for id in self.voter_ids() {
            if id == self.node_id {
                continue;
            }
            let mut m = Message::new(MessageType::Vote);
            m.to = id;
            m.index = last_index;
            m.log_term = last_term;
            self.send(m);
        }
        Ok(())
    }

    fn win_election(&mut self) -> Result<()> {
        if self.lease_check {
            self.become_election_ack()
        } else {
            self.become_leader()
        }
    }

    pub(crate) fn tick(&mut self) {
        self.election_elapsed = self.election_elapsed.saturating_add(1);
    }

    pub(crate) fn become_follower(&mut self, term: u64, leader: NodeId) {
        if term != self.term {
            self.term = term;
            self.vote = NO_LEADER;
        }
        self.leader = leader;
        self.state = StateRole::Follower;
        self.election_elapsed = 0;
        self.pending_conf = false;
        self.votes.clear();
        self.acks.clear();
        debug!(group = self.group_id, term = self.term, leader, "became follower");
    }

    fn become_candidate(&mut self) {
        self.term += 1;
        self.vote = self.node_id;
        self.leader = NO_LEADER;
        self.state = StateRole::Candidate;
        self.election_elapsed = 0;
        self.votes.clear();
        self.acks.clear();
        info!(group = self.group_id, node = self.node_id, term = self.term, "became candidate");
    }

    fn become_election_ack(&mut self) -> Result<()> {
        self.state = StateRole::ElectionAck;
        self.acks.clear();
        self.acks.insert(self.node_id, true);
        info!(group = self.group_id, term = self.term, "collecting election acks");

        if self.acks.len() >= self.quorum() {
            return self.become_leader();
        }
        for id in self.voter_ids() {
            if id == self.node_id {
                continue;
            }
            let mut m = Message::new(MessageType::ElectionAck);
            m.to = id;
            self.send(m);
        }
        Ok(())
    }

    pub(crate) fn become_leader(&mut self) -> Result<()> {
        self.state = StateRole::Leader;
        self.leader = self.node_id;
        self.election_elapsed = 0;
        self.votes.clear();
        self.acks.clear();

        let last_index = self.log.last_index();
        let node_id = self.node_id;
        let max_inflight = self.max_inflight;
        for (id, r) in self.replicas.iter_mut() {
            *r = Replica::new(r.peer, max_inflight);
            r.next = last_index + 1;
            if *id == node_id {
                r.matched = last_index;
                r.mark_active();
            }
        }
        self.pending_conf = self.has_uncommitted_conf_change()?;

        info!(
            group = self.group_id,
            node = self.node_id,
            term = self.term,
            last_index,
            "became leader"
        );
        self.append_entries(vec![Entry::default()])?;
        self.bcast_append();
        Ok(())
    }

    fn has_uncommitted_conf_change(&self) -> Result<bool> {
        let uncommitted = self.log.entries(self.log.committed() + 1, NO_LIMIT)?;
        Ok(uncommitted
            .iter()
            .any(|e| e.entry_type == EntryType::ConfChange))
    }

    /// Stamp `entries` with contiguous indexes under the current term and
    /// append them to the log.
    fn append_entries(&mut self, mut entries: Vec<Entry>) -> Result<()> {
        let last_index = self.log.last_index();
        for (i, e) in entries.iter_mut().enumerate() {
            e.term = self.term;
            e.index = last_index + 1 + i as u64;
        }
        let last_index = self.log.append(&entries)?;
        let committed = self.log.committed();
        if let Some(r) = self.replicas.get_mut(&self.node_id) {
            r.maybe_update(last_index, committed);
        }
        self.maybe_commit();
        Ok(())
    }

    fn bcast_append(&mut self) {
        let ids: Vec<NodeId> = self
            .replicas
            .keys()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect();
        for id in ids {
            self.send_append(id);
        }
    }

    fn send_append(&mut self, to: NodeId) {
        let committed = self.log.committed();
        let Some(r) = self.replicas.get_mut(&to) else {
            return;
        };
        if r.is_paused() {
            return;
        }

        let prev = r.next - 1;
        let fetched = match self.log.term(prev) {
            Ok(log_term) => self
                .log
                .entries(r.next, self.max_msg_size)
                .map(|entries| (log_term, entries)),
            Err(e) => Err(e),
        };

        let m = match fetched {
            Ok((log_term, entries)) => {
                if let Some(last) = entries.last().map(|e| e.index) {
                    match r.state {
                        ReplicaState::Replicate => {
                            r.optimistic_update(last);
                            r.inflight.add(last);
                        }
                        ReplicaState::Probe => r.pause(),
                        ReplicaState::Snapshot => {
                            error!(group = self.group_id, to, "sending append to replica awaiting snapshot");
                            return;
                        }
                    }
                }
                let mut m = Message::new(MessageType::Append);
                m.to = to;
                m.index = prev;
                m.log_term = log_term;
                m.entries = entries;
                m.commit = committed;
                m
            }
            Err(RaftError::Compacted) => {
                if !r.active {
                    debug!(group = self.group_id, to, "skip snapshot to inactive replica");
                    return;
                }
                let index = self.log.first_index() - 1;
                let log_term = self.log.term(index).unwrap_or(0);
                r.become_snapshot(index);
                warn!(
                    group = self.group_id,
                    to,
                    index,
                    "replica fell behind the log, snapshot required"
                );
                let mut m = Message::new(MessageType::Snapshot);
                m.to = to;
                m.index = index;
                m.log_term = log_term;
                m.commit = committed;
                m
            }
            Err(e) => {
                error!(group = self.group_id, to, error = %e, "failed to build append");
                return;
            }
        };
        self.send(m);
    }

    fn maybe_commit(&mut self) -> bool {
        let mut matched: Vec<u64> = self
            .replicas
            .values()
            .filter(|r| !r.peer.is_learner())
            .map(|r| r.matched)
            .collect();
        if matched.is_empty() {
            return false;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let mci = matched[self.quorum() - 1];
        self.log.maybe_commit(mci, self.term)
    }

    fn send(&mut self, mut m: Message) {
        m.group_id = self.group_id;
        m.from = self.node_id;
        if m.msg_type != MessageType::LocalPropose {
            m.term = self.term;
        }
        self.msgs.push(m);
    }

    fn poll(&mut self, id: NodeId, granted: bool) -> usize {
        if self.is_voter(id) {
            self.votes.entry(id).or_insert(granted);
        }
        self.votes.values().filter(|v| **v).count()
    }

    fn is_voter(&self, id: NodeId) -> bool {
        self.replicas
            .get(&id)
            .map(|r| !r.peer.is_learner())
            .unwrap_or(false)
    }

    fn voter_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .replicas
            .values()
            .filter(|r| !r.peer.is_learner())
            .map(|r| r.peer.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn quorum(&self) -> usize {
        self.voter_ids().len() / 2 + 1
    }

    /// Apply a committed membership change to the replica set.
    pub(crate) fn apply_conf_change(&mut self, cc: &ConfChange) {
        self.pending_conf = false;
        let id = cc.peer.id;
        match cc.change_type {
            ConfChangeType::AddNode => match self.replicas.get_mut(&id) {
                Some(r) => r.peer = cc.peer,
                None => {
                    let mut r = Replica::new(cc.peer, self.max_inflight);
                    r.next = self.log.last_index() + 1;
                    self.replicas.insert(id, r);
                }
            },
            ConfChangeType::RemoveNode => {
                self.replicas.remove(&id);
            }
            ConfChangeType::UpdateNode => {
                if let Some(r) = self.replicas.get_mut(&id) {
                    r.peer = cc.peer;
                }
            }
        }
        info!(
            group = self.group_id,
            change = ?cc.change_type,
            peer = id,
            learner = cc.peer.is_learner(),
            "applied membership change"
        );

        if self.state == StateRole::Leader && self.maybe_commit() {
            self.bcast_append();
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.state == StateRole::Leader
    }

    pub(crate) fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.log.committed(),
        }
    }

    pub(crate) fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.replicas.values().map(|r| r.peer).collect();
        peers.sort_unstable_by_key(|p| p.id);
        peers
    }

    pub(crate) fn status(&self) -> Status {
        let replicas = if self.is_leader() {
            let mut replicas: Vec<ReplicaStatus> = self
                .replicas
                .values()
                .map(|r| ReplicaStatus {
                    peer: r.peer,
                    state: r.state,
                    matched: r.matched,
                    next: r.next,
                    committed: r.committed,
                    active: r.active,
                    inactive_for: r.last_active.elapsed(),
                    paused: r.is_paused(),
                    inflight: r.inflight.count(),
                })
                .collect();
            replicas.sort_unstable_by_key(|r| r.peer.id);
            replicas
        } else {
            Vec::new()
        };

        Status {
            group_id: self.group_id,
            node_id: self.node_id,
            leader: self.leader,
            term: self.term,
            vote: self.vote,
            role: self.state,
            committed: self.log.committed(),
            applied: self.log.applied(),
            last_index: self.log.last_index(),
            election_elapsed: self.election_elapsed,
            pending_conf: self.pending_conf,
            replicas,
        }
    }
}
