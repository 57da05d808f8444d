//! Per-peer outbound queues.
//!
//! A [`TransportSender`] owns one or more shard queues toward a single peer.
//! Each shard runs its own task that dials lazily, batches whatever is
//! queued, and writes it on a single connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::codec::encode_message;
use super::{Resolver, SocketType, TransportError};
use crate::proto::{GroupId, Message, NodeId};
use crate::shutdown::stopped;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_WRITE_BATCH: usize = 64;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) struct TransportSender {
    target: NodeId,
    shards: Vec<mpsc::Sender<Message>>,
}

impl TransportSender {
    /// Spawns `concurrency` shard tasks. Must be called within a tokio runtime.
    pub(crate) fn new(
        target: NodeId,
        socket_type: SocketType,
        concurrency: usize,
        buffer_size: usize,
        resolver: Arc<dyn Resolver>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let mut shards = Vec::with_capacity(concurrency);
        for shard in 0..concurrency {
            let (tx, rx) = mpsc::channel(buffer_size.max(1));
            let worker = ShardWorker {
                target,
                socket_type,
                shard,
                resolver: resolver.clone(),
                conn: None,
            };
            tokio::spawn(worker.run(rx, stop_rx.clone()));
            shards.push(tx);
        }
        Self { target, shards }
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.shards.len()
    }

    /// Blocks while the selected shard queue is full.
    pub(crate) async fn send(&self, m: Message) {
        let shard = shard_index(m.group_id, self.shards.len());
        if self.shards[shard].send(m).await.is_err() {
            debug!(target_node = self.target, shard, "sender stopped, message dropped");
        }
    }
}

fn shard_index(group_id: GroupId, n: usize) -> usize {
    let n = n as u64;
    if n.is_power_of_two() {
        (group_id & (n - 1)) as usize
    } else {
        (group_id % n) as usize
    }
}

struct ShardWorker {
    target: NodeId,
    socket_type: SocketType,
    shard: usize,
    resolver: Arc<dyn Resolver>,
    conn: Option<BufWriter<TcpStream>>,
}

impl ShardWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>, mut stop_rx: watch::Receiver<bool>) {
        let mut batch = Vec::with_capacity(MAX_WRITE_BATCH);
        let mut buf = Vec::new();

        loop {
            let first = tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => break,
                },
            };

            batch.clear();
            batch.push(first);
            while batch.len() < MAX_WRITE_BATCH {
                match rx.try_recv() {
                    Ok(m) => batch.push(m),
                    Err(_) => break,
                }
            }

            buf.clear();
            for m in &batch {
                if let Err(e) = encode_message(m, &mut buf) {
                    warn!(
                        target_node = self.target,
                        msg_type = %m.msg_type,
                        error = %e,
                        "failed to encode message, dropping"
                    );
                }
            }
            if buf.is_empty() {
                continue;
            }

            if let Err(e) = self.write(&buf).await {
                warn!(
                    target_node = self.target,
                    socket = %self.socket_type,
                    shard = self.shard,
                    dropped = batch.len(),
                    error = %e,
                    "failed to deliver messages"
                );
                self.conn = None;
            }
        }

        trace!(target_node = self.target, shard = self.shard, "sender shard stopped");
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if self.conn.is_none() {
            self.conn = Some(self.dial().await?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        conn.write_all(buf).await?;
        conn.flush().await?;
        Ok(())
    }

    async fn dial(&self) -> Result<BufWriter<TcpStream>, TransportError> {
        let addr = self
            .resolver
            .node_address(self.target, self.socket_type)
            .ok_or(TransportError::UnknownPeer(self.target, self.socket_type))?;

        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", addr),
                ))
            })??;
        stream.set_nodelay(true)?;

        debug!(
            target_node = self.target,
            socket = %self.socket_type,
            shard = self.shard,
            addr = %addr,
            "connected to peer"
        );
        Ok(BufWriter::with_capacity(WRITE_BUFFER_SIZE, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MessageType;
    use crate::transport::codec::read_message;
    use crate::transport::{PeerAddress, StaticResolver};
    use tokio::net::TcpListener;

    #[test]
    fn test_shard_index() {
        assert_eq!(shard_index(5, 1), 0);
        assert_eq!(shard_index(5, 4), 1);
        assert_eq!(shard_index(7, 4), 3);
        assert_eq!(shard_index(7, 5), 2);
        assert_eq!(shard_index(10, 5), 0);
    }

    #[tokio::test]
    async fn test_sender_delivers_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let resolver = Arc::new(StaticResolver::from_peers([PeerAddress::new(
            2, "unused:1", addr,
        )]));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let sender = TransportSender::new(2, SocketType::Replicate, 1, 16, resolver, stop_rx);
        assert_eq!(sender.concurrency(), 1);
        for index in 1..=3 {
            let mut m = Message::new(MessageType::Append);
            m.group_id = 9;
            m.to = 2;
            m.index = index;
            sender.send(m).await;
        }

        let (mut stream, _) = listener.accept().await.unwrap();
        for index in 1..=3 {
            let m = read_message(&mut stream).await.unwrap().unwrap();
            assert_eq!(m.index, index);
            assert_eq!(m.group_id, 9);
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_does_not_block() {
        let resolver = Arc::new(StaticResolver::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let sender = TransportSender::new(3, SocketType::HeartBeat, 1, 1, resolver, stop_rx);

        let m = Message::new(MessageType::HeartbeatRequest);
        for _ in 0..8 {
            tokio::time::timeout(Duration::from_secs(2), sender.send(m.clone()))
                .await
                .unwrap();
        }
    }
}
