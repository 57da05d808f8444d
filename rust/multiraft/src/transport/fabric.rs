//! One TCP fabric: a listener plus lazily created per-peer senders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::codec::read_message;
use super::sender::TransportSender;
use super::{MessageHandler, Resolver, Result, SocketType, TransportError};
use crate::proto::{Message, MessageType, NodeId};
use crate::shutdown::stopped;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct Fabric {
    socket_type: SocketType,
    node_id: NodeId,
    concurrency: usize,
    send_buffer_size: usize,
    resolver: Arc<dyn Resolver>,
    senders: RwLock<HashMap<NodeId, Arc<TransportSender>>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
}

impl Fabric {
    pub(crate) async fn bind(
        socket_type: SocketType,
        addr: &str,
        node_id: NodeId,
        concurrency: usize,
        send_buffer_size: usize,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Listen {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(node_id, socket = %socket_type, addr = %local_addr, "transport listening");

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            socket_type,
            node_id,
            concurrency,
            send_buffer_size,
            resolver,
            senders: RwLock::new(HashMap::new()),
            listener: Mutex::new(Some(listener)),
            local_addr,
            stop_tx,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections. Only the first call has any effect.
    pub(crate) fn serve(&self, handler: Arc<dyn MessageHandler>) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        tokio::spawn(accept_loop(
            listener,
            self.socket_type,
            handler,
            self.stop_tx.subscribe(),
        ));
    }

    pub(crate) async fn send(&self, m: Message) {
        if *self.stop_tx.borrow() {
            return;
        }
        let sender = self.sender(m.to);
        sender.send(m).await;
    }

    fn sender(&self, to: NodeId) -> Arc<TransportSender> {
        if let Some(sender) = self.senders.read().get(&to) {
            return sender.clone();
        }
        let mut senders = self.senders.write();
        senders
            .entry(to)
            .or_insert_with(|| {
                debug!(node_id = self.node_id, socket = %self.socket_type, to, "creating sender");
                Arc::new(TransportSender::new(
                    to,
                    self.socket_type,
                    self.concurrency,
                    self.send_buffer_size,
                    self.resolver.clone(),
                    self.stop_tx.subscribe(),
                ))
            })
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn sender_concurrency(&self, to: NodeId) -> Option<usize> {
        self.senders.read().get(&to).map(|s| s.concurrency())
    }

    #[cfg(test)]
    pub(crate) fn sender_count(&self) -> usize {
        self.senders.read().len()
    }

    pub(crate) fn stop(&self) {
        self.stop_tx.send_replace(true);
        self.listener.lock().take();
        self.senders.write().clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    socket_type: SocketType,
    handler: Arc<dyn MessageHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "set_nodelay failed");
                    }
                    tokio::spawn(read_loop(stream, peer, socket_type, handler.clone(), stop_rx.clone()));
                }
                Err(e) => {
                    warn!(socket = %socket_type, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!(socket = %socket_type, "accept loop stopped");
}

async fn read_loop(
    stream: TcpStream,
    peer: SocketAddr,
    socket_type: SocketType,
    handler: Arc<dyn MessageHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);
    loop {
        let res = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            res = read_message(&mut reader) => res,
        };
        match res {
            Ok(Some(m)) => dispatch(socket_type, handler.as_ref(), m),
            Ok(None) => {
                debug!(peer = %peer, socket = %socket_type, "connection closed");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, socket = %socket_type, error = %e, "decode failed, closing connection");
                break;
            }
        }
    }
}

fn dispatch(socket_type: SocketType, handler: &dyn MessageHandler, m: Message) {
    match socket_type {
        SocketType::HeartBeat if m.is_heartbeat() => handler.receive_heartbeat(m),
        SocketType::Replicate if m.msg_type == MessageType::Snapshot => {
            warn!(
                group_id = m.group_id,
                from = m.from,
                "snapshot transfer is not supported, dropping"
            );
        }
        _ => handler.receive_message(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        heartbeats: Mutex<Vec<Message>>,
        messages: Mutex<Vec<Message>>,
    }

    impl MessageHandler for Recorder {
        fn receive_heartbeat(&self, m: Message) {
            self.heartbeats.lock().push(m);
        }

        fn receive_message(&self, m: Message) {
            self.messages.lock().push(m);
        }
    }

    #[test]
    fn test_dispatch_by_fabric() {
        let recorder = Recorder::default();

        dispatch(
            SocketType::HeartBeat,
            &recorder,
            Message::new(MessageType::HeartbeatRequest),
        );
        dispatch(SocketType::HeartBeat, &recorder, Message::new(MessageType::Vote));
        dispatch(SocketType::Replicate, &recorder, Message::new(MessageType::Append));
        dispatch(SocketType::Replicate, &recorder, Message::new(MessageType::Snapshot));

        let heartbeats = recorder.heartbeats.lock();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!(heartbeats[0].msg_type, MessageType::HeartbeatRequest);

        let messages = recorder.messages.lock();
        let types: Vec<_> = messages.iter().map(|m| m.msg_type).collect();
        assert_eq!(types, vec![MessageType::Vote, MessageType::Append]);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_listen_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let res = Fabric::bind(
            SocketType::Replicate,
            &addr,
            1,
            1,
            16,
            Arc::new(super::super::StaticResolver::new()),
        )
        .await;
        assert!(matches!(res, Err(TransportError::Listen { .. })));
    }
}
