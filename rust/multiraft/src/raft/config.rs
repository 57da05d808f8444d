//! Node-wide and per-group configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::error::{RaftError, Result};
use super::state_machine::StateMachine;
use crate::proto::{GroupId, NodeId, Peer, NO_LEADER};
use crate::storage::Storage;
use crate::transport::TransportConfig;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(5);
pub const DEFAULT_HEARTBEAT_TICK: u32 = 10;
pub const DEFAULT_ELECTION_TICK: u32 = 5;
pub const DEFAULT_SIZE_PER_MSG: u64 = 1024 * 1024;
pub const MAX_SIZE_PER_MSG: u64 = 4 * 1024 * 1024;
pub const DEFAULT_INFLIGHT_MSGS: usize = 128;
pub const MAX_INFLIGHT_MSGS: usize = 1024;
pub const DEFAULT_REQ_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_APP_BUFFER_SIZE: usize = 2048;
pub const DEFAULT_RETAIN_LOGS: u64 = 20000;

/// Configuration shared by every group hosted on one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id. Required, nonzero.
    pub node_id: NodeId,
    /// Period of the node's tick clock.
    pub tick_interval: Duration,
    /// Coalesced heartbeats go out every `heartbeat_tick` ticks.
    pub heartbeat_tick: u32,
    pub election_tick: u32,
    /// Upper bound for the entries carried by one append message.
    pub max_size_per_msg: u64,
    /// Per-replica in-flight window used while pipelining.
    pub max_inflight_msgs: usize,
    /// Capacity of each group's inbound message queue.
    pub req_buffer_size: usize,
    /// Capacity of each group's apply queue.
    pub app_buffer_size: usize,
    /// Number of applied entries to keep before compaction. Carried only.
    pub retain_logs: u64,
    /// Require a quorum of ElectionAck responses before leading.
    pub lease_check: bool,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            tick_interval: DEFAULT_TICK_INTERVAL,
            heartbeat_tick: DEFAULT_HEARTBEAT_TICK,
            election_tick: DEFAULT_ELECTION_TICK,
            max_size_per_msg: DEFAULT_SIZE_PER_MSG,
            max_inflight_msgs: DEFAULT_INFLIGHT_MSGS,
            req_buffer_size: DEFAULT_REQ_BUFFER_SIZE,
            app_buffer_size: DEFAULT_APP_BUFFER_SIZE,
            retain_logs: DEFAULT_RETAIN_LOGS,
            lease_check: false,
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reject invalid settings and fill unset ones with defaults.
    pub fn validate(&mut self) -> Result<()> {
        if self.node_id == 0 {
            return Err(RaftError::Config("NodeID is required".to_string()));
        }
        if self.max_size_per_msg > MAX_SIZE_PER_MSG {
            return Err(RaftError::Config(format!(
                "MaxSizePerMsg {} exceeds the {} byte ceiling",
                self.max_size_per_msg, MAX_SIZE_PER_MSG
            )));
        }
        if self.max_inflight_msgs > MAX_INFLIGHT_MSGS {
            return Err(RaftError::Config(format!(
                "MaxInflightMsgs {} exceeds the ceiling of {}",
                self.max_inflight_msgs, MAX_INFLIGHT_MSGS
            )));
        }

        if self.tick_interval < MIN_TICK_INTERVAL {
            self.tick_interval = DEFAULT_TICK_INTERVAL;
        }
        if self.heartbeat_tick == 0 {
            self.heartbeat_tick = DEFAULT_HEARTBEAT_TICK;
        }
        if self.election_tick == 0 {
            self.election_tick = DEFAULT_ELECTION_TICK;
        }
        if self.max_size_per_msg == 0 {
            self.max_size_per_msg = DEFAULT_SIZE_PER_MSG;
        }
        if self.max_inflight_msgs == 0 {
            self.max_inflight_msgs = DEFAULT_INFLIGHT_MSGS;
        }
        if self.req_buffer_size == 0 {
            self.req_buffer_size = DEFAULT_REQ_BUFFER_SIZE;
        }
        if self.app_buffer_size == 0 {
            self.app_buffer_size = DEFAULT_APP_BUFFER_SIZE;
        }
        if self.retain_logs == 0 {
            self.retain_logs = DEFAULT_RETAIN_LOGS;
        }

        self.transport.validate()?;
        Ok(())
    }
}

/// Configuration of one raft group.
pub struct RaftConfig {
    /// Required, nonzero.
    pub group_id: GroupId,
    /// Initial term, raised to the persisted term if that is higher.
    pub term: u64,
    /// Initial leader. Setting it to the local node id bootstraps the group
    /// as leader of `term`.
    pub leader: NodeId,
    /// Last index already applied by the state machine.
    pub applied: u64,
    /// Initial membership, must not be empty.
    pub peers: Vec<Peer>,
    pub storage: Arc<dyn Storage>,
    pub state_machine: Box<dyn StateMachine>,
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group_id == 0 {
            return Err(RaftError::Config("GroupID is required".to_string()));
        }
        if self.peers.is_empty() {
            return Err(RaftError::Config(format!(
                "group {} has an empty peer set",
                self.group_id
            )));
        }
        if self.leader != NO_LEADER && !self.peers.iter().any(|p| p.id == self.leader) {
            return Err(RaftError::Config(format!(
                "leader {} of group {} is not a member",
                self.leader, self.group_id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for RaftConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftConfig")
            .field("group_id", &self.group_id)
            .field("term", &self.term)
            .field("leader", &self.leader)
            .field("applied", &self.applied)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state_machine::tests::RecordingStateMachine;
    use crate::storage::MemoryStorage;

    fn group(group_id: GroupId, peers: Vec<Peer>) -> RaftConfig {
        RaftConfig {
            group_id,
            term: 0,
            leader: NO_LEADER,
            applied: 0,
            peers,
            storage: Arc::new(MemoryStorage::new()),
            state_machine: Box::new(RecordingStateMachine::default()),
        }
    }

    #[test]
    fn test_node_id_required() {
        let mut config = NodeConfig::default();
        assert!(matches!(config.validate(), Err(RaftError::Config(_))));
    }

    #[test]
    fn test_ceilings_are_fatal() {
        let mut config = NodeConfig {
            node_id: 1,
            max_size_per_msg: MAX_SIZE_PER_MSG + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = NodeConfig {
            node_id: 1,
            max_inflight_msgs: MAX_INFLIGHT_MSGS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_take_defaults() {
        let mut config = NodeConfig {
            node_id: 1,
            tick_interval: Duration::from_millis(1),
            heartbeat_tick: 0,
            election_tick: 0,
            max_size_per_msg: 0,
            max_inflight_msgs: 0,
            req_buffer_size: 0,
            app_buffer_size: 0,
            retain_logs: 0,
            ..Default::default()
        };
        config.validate().unwrap();

        assert_eq!(config.tick_interval, DEFAULT_TICK_INTERVAL);
        assert_eq!(config.heartbeat_tick, DEFAULT_HEARTBEAT_TICK);
        assert_eq!(config.election_tick, DEFAULT_ELECTION_TICK);
        assert_eq!(config.max_size_per_msg, DEFAULT_SIZE_PER_MSG);
        assert_eq!(config.max_inflight_msgs, DEFAULT_INFLIGHT_MSGS);
        assert_eq!(config.req_buffer_size, DEFAULT_REQ_BUFFER_SIZE);
        assert_eq!(config.app_buffer_size, DEFAULT_APP_BUFFER_SIZE);
        assert_eq!(config.retain_logs, DEFAULT_RETAIN_LOGS);
    }

    #[test]
    fn test_raft_config_validation() {
        assert!(group(0, vec![Peer::normal(1)]).validate().is_err());
        assert!(group(1, vec![]).validate().is_err());

        let mut cfg = group(1, vec![Peer::normal(1), Peer::normal(2)]);
        assert!(cfg.validate().is_ok());
        cfg.leader = 9;
        assert!(cfg.validate().is_err());
    }
}
