//! Multiraft: many Raft groups sharing one node, one clock and one network.
//!
//! This crate provides:
//!
//! 1. **Consensus** ([`raft`]): A Raft state machine per group, driven by a
//!    dedicated worker task, with leader-lease checks and single-step
//!    membership changes.
//!
//! 2. **Log Storage** ([`storage`]): The storage capability the log persists
//!    through, with an in-memory and a redb-backed implementation.
//!
//! 3. **Transport** ([`transport`]): Two TCP fabrics, one for heartbeats and
//!    elections and one for replication.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  multiraft crate                                                │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  raft module                                            │   │
//! │  │                                                         │   │
//! │  │  Node ──────────┬──► Raft (group 1) ──► StateMachine    │   │
//! │  │                 ├──► Raft (group 2) ──► StateMachine    │   │
//! │  │                 └──► coalesced heartbeats               │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  storage module                                         │   │
//! │  │                                                         │   │
//! │  │  MemoryStorage / RedbStorage ──► RaftLog                │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  transport module                                       │   │
//! │  │                                                         │   │
//! │  │  MultiTransport ┬──► heartbeat fabric (1 queue/peer)    │   │
//! │  │                 └──► replicate fabric (N queues/peer)   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use multiraft::prelude::*;
//!
//! struct Printer;
//!
//! impl StateMachine for Printer {
//!     fn apply(&mut self, command: &[u8], index: u64) -> multiraft::raft::Result<()> {
//!         println!("{index}: {}", String::from_utf8_lossy(command));
//!         Ok(())
//!     }
//!     fn apply_member_change(&mut self, _: &ConfChange, _: u64) -> multiraft::raft::Result<()> {
//!         Ok(())
//!     }
//!     fn snapshot(&self) -> multiraft::raft::Result<Box<dyn SnapshotIterator>> {
//!         Ok(Box::new(VecSnapshot::new(0, Vec::new())))
//!     }
//!     fn apply_snapshot(
//!         &mut self,
//!         _: &[Peer],
//!         _: &mut dyn SnapshotIterator,
//!     ) -> multiraft::raft::Result<()> {
//!         Ok(())
//!     }
//!     fn handle_leader_change(&mut self, _: NodeId) {}
//! }
//!
//! # async fn run() -> multiraft::raft::Result<()> {
//! let resolver = Arc::new(StaticResolver::new());
//! let node = Node::new(NodeConfig { node_id: 1, ..Default::default() }, resolver).await?;
//!
//! node.create_raft(RaftConfig {
//!     group_id: 1,
//!     term: 0,
//!     leader: 1,
//!     applied: 0,
//!     peers: vec![Peer::normal(1)],
//!     storage: Arc::new(MemoryStorage::new()),
//!     state_machine: Box::new(Printer),
//! })?;
//! node.propose(1, b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`proto`]: Wire and log types shared by every layer
//! - [`raft`]: Node, groups, log and replication
//! - [`storage`]: Log storage capability
//! - [`transport`]: TCP transport
//!
//! # Feature Flags
//!
//! - `durable` (default): redb-backed [`storage::RedbStorage`]
//! - `server`: the `multiraft-server` binary

pub mod proto;
pub mod raft;
mod shutdown;
pub mod storage;
pub mod transport;

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::proto::{
        ConfChange, ConfChangeType, Entry, EntryType, GroupId, HardState, Message, MessageType,
        NodeId, Peer, PeerType, NO_LEADER,
    };
    pub use crate::raft::{
        Node, NodeConfig, Raft, RaftConfig, RaftError, SnapshotIterator, SoftState, StateMachine,
        StateRole, Status, VecSnapshot,
    };
    pub use crate::storage::{MemoryStorage, Storage, StorageError};
    #[cfg(feature = "durable")]
    pub use crate::storage::RedbStorage;
    pub use crate::transport::{
        MessageHandler, MultiTransport, PeerAddress, Resolver, StaticResolver, Transport,
        TransportConfig, TransportError,
    };
}
