//! The two-fabric transport: routes each outbound message by its type.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::fabric::Fabric;
use super::{MessageHandler, Resolver, Result, SocketType, Transport, TransportConfig};
use crate::proto::{Message, NodeId};

/// The production [`Transport`]: a heartbeat fabric with one queue per peer
/// and a replicate fabric with `max_repl_concurrency` queues per peer.
pub struct MultiTransport {
    heartbeat: Fabric,
    replicate: Fabric,
}

impl MultiTransport {
    /// Bind both listeners. A bind failure is returned and nothing is left
    /// listening.
    pub async fn bind(
        config: &TransportConfig,
        node_id: NodeId,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        let mut config = config.clone();
        config.validate()?;

        let heartbeat = Fabric::bind(
            SocketType::HeartBeat,
            &config.heartbeat_addr,
            node_id,
            1,
            config.send_buffer_size,
            resolver.clone(),
        )
        .await?;
        let replicate = Fabric::bind(
            SocketType::Replicate,
            &config.replicate_addr,
            node_id,
            config.max_repl_concurrency,
            config.send_buffer_size,
            resolver,
        )
        .await?;

        Ok(Self {
            heartbeat,
            replicate,
        })
    }

    pub fn heartbeat_addr(&self) -> SocketAddr {
        self.heartbeat.local_addr()
    }

    pub fn replicate_addr(&self) -> SocketAddr {
        self.replicate.local_addr()
    }

    /// Start delivering inbound messages to `handler`.
    pub fn serve(&self, handler: Arc<dyn MessageHandler>) {
        self.heartbeat.serve(handler.clone());
        self.replicate.serve(handler);
    }

    fn route(m: &Message) -> SocketType {
        if m.is_heartbeat() || m.is_election() {
            SocketType::HeartBeat
        } else {
            SocketType::Replicate
        }
    }
}

#[async_trait]
impl Transport for MultiTransport {
    async fn send(&self, m: Message) {
        match Self::route(&m) {
            SocketType::HeartBeat => self.heartbeat.send(m).await,
            SocketType::Replicate => self.replicate.send(m).await,
        }
    }

    fn stop(&self) {
        self.heartbeat.stop();
        self.replicate.stop();
        info!("transport stopped");
    }
}
