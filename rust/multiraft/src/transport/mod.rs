//! TCP transport for raft messages.
//!
//! Two independent fabrics, each with its own listener and per-peer send
//! queues, so replication bursts never delay liveness traffic:
//!
//! | Fabric    | Carries                              | Queues per peer          |
//! |-----------|--------------------------------------|--------------------------|
//! | heartbeat | heartbeats, votes, election acks     | 1                        |
//! | replicate | appends, responses, snapshots        | `max_repl_concurrency`   |
//!
//! Replicate queues are sharded by group id, so one group's messages to a
//! peer always travel in order on the same connection.
//!
//! # Wire Format
//!
//! Each frame is a big-endian `u32` length followed by a bincode-encoded
//! [`Message`](crate::proto::Message).
//!
//! # Example
//!
//! ```rust,ignore
//! use multiraft::transport::{PeerAddress, StaticResolver};
//!
//! let resolver = StaticResolver::new();
//! resolver.add(PeerAddress::parse("2=10.0.0.2:3016/10.0.0.2:2015")?);
//! ```

mod codec;
mod fabric;
mod multi;
mod sender;

pub use codec::{encode_message, read_message, MAX_FRAME_SIZE};
pub use multi::MultiTransport;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::proto::{Message, NodeId};

pub const DEFAULT_HEARTBEAT_ADDR: &str = "0.0.0.0:3016";
pub const DEFAULT_REPLICATE_ADDR: &str = "0.0.0.0:2015";
pub const DEFAULT_REPL_CONCURRENCY: usize = 5;
pub const MAX_REPL_CONCURRENCY: usize = 256;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 10240;

/// Transport error types.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("no {1} address known for node {0}")]
    UnknownPeer(NodeId, SocketType),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Outbound side of the raft transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a message for delivery. Blocks while the destination queue is
    /// full; undeliverable messages are dropped and logged.
    async fn send(&self, m: Message);

    fn stop(&self);
}

/// Inbound side: receives decoded messages from the transport.
pub trait MessageHandler: Send + Sync {
    /// Coalesced heartbeat request or response.
    fn receive_heartbeat(&self, m: Message);

    fn receive_message(&self, m: Message);
}

/// Which fabric a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    HeartBeat,
    Replicate,
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::HeartBeat => f.write_str("HeartBeat"),
            SocketType::Replicate => f.write_str("Replicate"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Heartbeat listen address.
    pub heartbeat_addr: String,
    /// Replicate listen address.
    pub replicate_addr: String,
    /// Send queues per peer on the replicate fabric.
    pub max_repl_concurrency: usize,
    /// Capacity of each per-peer send queue.
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_addr: DEFAULT_HEARTBEAT_ADDR.to_string(),
            replicate_addr: DEFAULT_REPLICATE_ADDR.to_string(),
            max_repl_concurrency: DEFAULT_REPL_CONCURRENCY,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&mut self) -> Result<()> {
        if self.max_repl_concurrency > MAX_REPL_CONCURRENCY {
            return Err(TransportError::Config(format!(
                "MaxReplConcurrency {} exceeds the ceiling of {}",
                self.max_repl_concurrency, MAX_REPL_CONCURRENCY
            )));
        }
        if self.heartbeat_addr.is_empty() {
            self.heartbeat_addr = DEFAULT_HEARTBEAT_ADDR.to_string();
        }
        if self.replicate_addr.is_empty() {
            self.replicate_addr = DEFAULT_REPLICATE_ADDR.to_string();
        }
        if self.max_repl_concurrency == 0 {
            self.max_repl_concurrency = DEFAULT_REPL_CONCURRENCY;
        }
        if self.send_buffer_size == 0 {
            self.send_buffer_size = DEFAULT_SEND_BUFFER_SIZE;
        }
        Ok(())
    }
}

/// Maps a node to the address of one of its fabrics.
pub trait Resolver: Send + Sync {
    fn node_address(&self, node_id: NodeId, socket_type: SocketType) -> Option<String>;
}

/// Both listen addresses of one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub id: NodeId,
    pub heartbeat: String,
    pub replicate: String,
}

impl PeerAddress {
    pub fn new(id: NodeId, heartbeat: impl Into<String>, replicate: impl Into<String>) -> Self {
        Self {
            id,
            heartbeat: heartbeat.into(),
            replicate: replicate.into(),
        }
    }

    /// Parse from "id=heartbeat_host:port/replicate_host:port" format.
    pub fn parse(s: &str) -> Result<Self> {
        let (id, addrs) = s.split_once('=').ok_or_else(|| {
            TransportError::InvalidAddress(format!(
                "expected 'id=hb_host:port/repl_host:port', got '{}'",
                s
            ))
        })?;

        let id: NodeId = id
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("invalid node id: '{}'", id)))?;
        if id == 0 {
            return Err(TransportError::InvalidAddress("node id 0 is reserved".to_string()));
        }

        let (heartbeat, replicate) = addrs.split_once('/').ok_or_else(|| {
            TransportError::InvalidAddress(format!("missing replicate address in '{}'", s))
        })?;
        let (heartbeat, replicate) = (heartbeat.trim(), replicate.trim());
        if heartbeat.is_empty() || replicate.is_empty() {
            return Err(TransportError::InvalidAddress(format!("empty address in '{}'", s)));
        }

        Ok(Self::new(id, heartbeat, replicate))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}/{}", self.id, self.heartbeat, self.replicate)
    }
}

/// [`Resolver`] over a fixed, updatable address table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    addrs: RwLock<HashMap<NodeId, PeerAddress>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_peers(peers: impl IntoIterator<Item = PeerAddress>) -> Self {
        let resolver = Self::new();
        for peer in peers {
            resolver.add(peer);
        }
        resolver
    }

    pub fn add(&self, peer: PeerAddress) {
        self.addrs.write().insert(peer.id, peer);
    }

    pub fn remove(&self, id: NodeId) -> Option<PeerAddress> {
        self.addrs.write().remove(&id)
    }
}

impl Resolver for StaticResolver {
    fn node_address(&self, node_id: NodeId, socket_type: SocketType) -> Option<String> {
        let addrs = self.addrs.read();
        let peer = addrs.get(&node_id)?;
        Some(match socket_type {
            SocketType::HeartBeat => peer.heartbeat.clone(),
            SocketType::Replicate => peer.replicate.clone(),
        })
    }
}
