//! Multiraft Server
//!
//! A standalone node hosting one or more raft groups whose state machines
//! log every committed command.
//!
//! # Usage
//!
//! ```bash
//! # Single node, one group
//! MULTIRAFT_NODE_ID=1 multiraft-server
//!
//! # 3-node cluster hosting 8 groups
//! MULTIRAFT_NODE_ID=1 MULTIRAFT_GROUPS=8 \
//!   MULTIRAFT_PEERS=2=10.0.0.2:3016/10.0.0.2:2015,3=10.0.0.3:3016/10.0.0.3:2015 \
//!   multiraft-server
//! ```
//!
//! # Environment Variables
//!
//! - `MULTIRAFT_NODE_ID`: Node ID (defaults to 1)
//! - `MULTIRAFT_HEARTBEAT_ADDR`: Heartbeat listen address (defaults to 0.0.0.0:3016)
//! - `MULTIRAFT_REPLICATE_ADDR`: Replicate listen address (defaults to 0.0.0.0:2015)
//! - `MULTIRAFT_TICK_MS`: Tick interval in milliseconds (defaults to 100)
//! - `MULTIRAFT_GROUPS`: Number of groups to host (defaults to 1)
//! - `MULTIRAFT_DATA_DIR`: Directory for redb log files; in-memory logs when unset
//! - `MULTIRAFT_PEERS`: Comma-separated peer list in `id=hb_host:port/repl_host:port` format

use std::env;
use std::sync::Arc;
use std::time::Duration;

use multiraft::prelude::*;
use multiraft::raft::Result as RaftResult;

/// Logs committed commands.
struct LoggingStateMachine {
    group_id: GroupId,
}

impl StateMachine for LoggingStateMachine {
    fn apply(&mut self, command: &[u8], index: u64) -> RaftResult<()> {
        tracing::info!(
            group_id = self.group_id,
            index,
            command = %String::from_utf8_lossy(command),
            "applied"
        );
        Ok(())
    }

    fn apply_member_change(&mut self, change: &ConfChange, index: u64) -> RaftResult<()> {
        tracing::info!(group_id = self.group_id, index, ?change, "membership changed");
        Ok(())
    }

    fn snapshot(&self) -> RaftResult<Box<dyn SnapshotIterator>> {
        Ok(Box::new(VecSnapshot::new(0, Vec::new())))
    }

    fn apply_snapshot(&mut self, _peers: &[Peer], _iter: &mut dyn SnapshotIterator) -> RaftResult<()> {
        Err(RaftError::StateMachine("snapshots are not supported".to_string()))
    }

    fn handle_leader_change(&mut self, leader: NodeId) {
        tracing::info!(group_id = self.group_id, leader, "leader changed");
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| format!("{} has an invalid value: '{}'", key, v)),
        Err(_) => Ok(default),
    }
}

fn group_storage(group_id: GroupId) -> Result<Arc<dyn Storage>, Box<dyn std::error::Error>> {
    let Ok(data_dir) = env::var("MULTIRAFT_DATA_DIR") else {
        return Ok(Arc::new(MemoryStorage::new()));
    };

    #[cfg(feature = "durable")]
    {
        let dir = std::path::PathBuf::from(data_dir);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("group-{}.redb", group_id));
        Ok(Arc::new(RedbStorage::open(&path)?))
    }

    #[cfg(not(feature = "durable"))]
    {
        let _ = (data_dir, group_id);
        Err("MULTIRAFT_DATA_DIR requires the 'durable' feature".into())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multiraft=debug".parse()?),
        )
        .init();

    let node_id: NodeId = env_or("MULTIRAFT_NODE_ID", 1)?;
    let tick_ms: u64 = env_or("MULTIRAFT_TICK_MS", 100)?;
    let groups: GroupId = env_or("MULTIRAFT_GROUPS", 1)?;

    let peers: Vec<PeerAddress> = env::var("MULTIRAFT_PEERS")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| PeerAddress::parse(s.trim()))
        .collect::<Result<_, _>>()?;

    if peers.is_empty() {
        tracing::warn!("No peers configured (MULTIRAFT_PEERS is empty). Running as single node.");
    } else {
        tracing::info!(
            "Peers: {}",
            peers
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut members: Vec<Peer> = peers.iter().map(|p| Peer::normal(p.id)).collect();
    members.push(Peer::normal(node_id));

    let mut transport = TransportConfig::default();
    if let Ok(addr) = env::var("MULTIRAFT_HEARTBEAT_ADDR") {
        transport.heartbeat_addr = addr;
    }
    if let Ok(addr) = env::var("MULTIRAFT_REPLICATE_ADDR") {
        transport.replicate_addr = addr;
    }

    let config = NodeConfig {
        node_id,
        tick_interval: Duration::from_millis(tick_ms),
        transport,
        ..Default::default()
    };

    let resolver = Arc::new(StaticResolver::from_peers(peers));
    let node = Node::new(config, resolver).await?;
    tracing::info!(
        node_id,
        heartbeat = ?node.heartbeat_addr(),
        replicate = ?node.replicate_addr(),
        groups,
        "Starting Multiraft Server"
    );

    // The lowest member id leads term 1 on every node. A group restarted
    // from a newer persisted term comes up leaderless and its configured
    // leader campaigns for it.
    let leader = members.iter().map(|p| p.id).min().unwrap_or(node_id);
    for group_id in 1..=groups {
        let raft = node.create_raft(RaftConfig {
            group_id,
            term: 1,
            leader,
            applied: 0,
            peers: members.clone(),
            storage: group_storage(group_id)?,
            state_machine: Box::new(LoggingStateMachine { group_id }),
        })?;
        if leader == node_id && raft.soft_state().leader == NO_LEADER {
            tracing::info!(group_id, "resumed without a leader, campaigning");
            raft.campaign()?;
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    node.stop();
    tracing::info!("Multiraft server stopped");
    Ok(())
}
