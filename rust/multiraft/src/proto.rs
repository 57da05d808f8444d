//! Wire and log data types shared by every layer of the engine.
//!
//! A [`Message`] is the unit exchanged between peers. Heartbeats are not sent
//! per group: the node coalesces every group it leads towards one peer into a
//! single message whose [`Message::context`] carries a [`HeartbeatContext`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a physical process in the cluster.
pub type NodeId = u64;

/// Identifier of a replicated partition (one raft group).
pub type GroupId = u64;

/// Placeholder node id used when no leader is known.
pub const NO_LEADER: NodeId = 0;

/// Role of a peer inside a group's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PeerType {
    /// Voting member.
    #[default]
    Normal,
    /// Receives the log but does not vote or count towards quorum.
    Learner,
}

/// One member of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Node hosting this member.
    pub id: NodeId,
    /// Voting role.
    pub peer_type: PeerType,
}

impl Peer {
    /// A voting member.
    pub fn normal(id: NodeId) -> Self {
        Self {
            id,
            peer_type: PeerType::Normal,
        }
    }

    /// A non-voting member.
    pub fn learner(id: NodeId) -> Self {
        Self {
            id,
            peer_type: PeerType::Learner,
        }
    }

    pub fn is_learner(&self) -> bool {
        self.peer_type == PeerType::Learner
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryType {
    #[default]
    Normal,
    ConfChange,
}

/// A single log entry. Entries are totally ordered by `index` within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    pub data: Vec<u8>,
}

/// Fixed per-entry overhead used when sizing append messages.
const ENTRY_HEADER_SIZE: u64 = 17;

impl Entry {
    pub fn new(index: u64, term: u64, entry_type: EntryType, data: Vec<u8>) -> Self {
        Self {
            index,
            term,
            entry_type,
            data,
        }
    }

    /// Approximate encoded size, used to honour `max_size_per_msg`.
    pub fn size(&self) -> u64 {
        ENTRY_HEADER_SIZE + self.data.len() as u64
    }
}

/// Persistent per-group vote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HardState {
    pub term: u64,
    pub vote: NodeId,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeType {
    AddNode,
    RemoveNode,
    UpdateNode,
}

/// A membership change carried by a [`EntryType::ConfChange`] entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub peer: Peer,
    /// Opaque application payload delivered with the change.
    pub context: Vec<u8>,
}

impl ConfChange {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Coalesced liveness probe from a leader node.
    HeartbeatRequest,
    /// Coalesced answer listing the groups hosted by the responder.
    HeartbeatResponse,
    /// Batch of client commands injected into the local leader.
    LocalPropose,
    Append,
    AppendResponse,
    Vote,
    VoteResponse,
    /// Leadership confirmation sent after winning a vote with lease check on.
    ElectionAck,
    ElectionAckResponse,
    Snapshot,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::HeartbeatRequest => "ReqMsgHeartBeat",
            MessageType::HeartbeatResponse => "RespMsgHeartBeat",
            MessageType::LocalPropose => "LocalMsgProp",
            MessageType::Append => "ReqMsgAppend",
            MessageType::AppendResponse => "RespMsgAppend",
            MessageType::Vote => "ReqMsgVote",
            MessageType::VoteResponse => "RespMsgVote",
            MessageType::ElectionAck => "ReqMsgElectionAck",
            MessageType::ElectionAckResponse => "RespMsgElectionAck",
            MessageType::Snapshot => "ReqMsgSnapShot",
        };
        f.write_str(name)
    }
}

/// The wire unit exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    /// Target group. Zero for coalesced heartbeats.
    pub group_id: GroupId,
    pub from: NodeId,
    pub to: NodeId,
    /// Sender's term. Zero marks a node-local or coalesced message.
    pub term: u64,
    /// Term of the entry at `index` (append) or of the last entry (vote).
    pub log_term: u64,
    pub index: u64,
    pub commit: u64,
    pub reject: bool,
    /// Follower's last index, sent with a rejected append.
    pub reject_hint: u64,
    pub entries: Vec<Entry>,
    pub context: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            group_id: 0,
            from: 0,
            to: 0,
            term: 0,
            log_term: 0,
            index: 0,
            commit: 0,
            reject: false,
            reject_hint: 0,
            entries: Vec::new(),
            context: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::HeartbeatRequest | MessageType::HeartbeatResponse
        )
    }

    pub fn is_election(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::Vote
                | MessageType::VoteResponse
                | MessageType::ElectionAck
                | MessageType::ElectionAckResponse
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{type={}, group={}, from={}, to={}, term={}, logterm={}, index={}, commit={}, reject={}, entries={}}}",
            self.msg_type,
            self.group_id,
            self.from,
            self.to,
            self.term,
            self.log_term,
            self.index,
            self.commit,
            self.reject,
            self.entries.len()
        )
    }
}

/// Ordered list of group ids carried by a coalesced heartbeat.
pub type HeartbeatContext = Vec<GroupId>;

/// Encode group ids as concatenated big-endian u64 values.
pub fn encode_hb_context(ids: &[GroupId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.len() * 8);
    for id in ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf
}

/// Decode a heartbeat context. Trailing bytes that do not form a full id
/// are ignored.
pub fn decode_hb_context(buf: &[u8]) -> HeartbeatContext {
    buf.chunks_exact(8)
        .map(|chunk| {
            let mut id = [0u8; 8];
            id.copy_from_slice(chunk);
            u64::from_be_bytes(id)
        })
        .collect()
}
