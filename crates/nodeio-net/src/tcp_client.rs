//! TCP client for a [`BrokerServer`](crate::BrokerServer).
//!
//! [`RemoteBroker`] implements [`Broker`] by sending framed requests and
//! matching replies by id. A background reader task routes replies to the
//! waiting callers and deliveries to the local consumer of each queue.
//! Connection state changes are broadcast via a [`watch`] channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::broker::{Body, Broker, BrokerError, Consumer, QueueOptions};
use crate::framing::{FrameConfig, read_frame, write_frame};
use crate::protocol::{Frame, Reply, Request, decode_frame, encode_frame};

type PendingMap = HashMap<u64, oneshot::Sender<Result<Reply, BrokerError>>>;
type ConsumerMap = HashMap<String, mpsc::UnboundedSender<Body>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Broker connection over TCP.
pub struct RemoteBroker {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingMap>>,
    consumers: Arc<Mutex<ConsumerMap>>,
    next_request: AtomicU64,
    state: Arc<ConnectionStateWatch>,
    frame: FrameConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl RemoteBroker {
    /// Connect to the broker server at `addr` and start the reader task.
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        stream.set_nodelay(true)?;
        state.set(ConnectionState::Connected);

        let (reader, writer) = stream.into_split();
        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let consumers = Arc::new(Mutex::new(ConsumerMap::new()));
        let frame = FrameConfig::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&consumers),
            Arc::clone(&state),
            frame,
            shutdown_rx,
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            consumers,
            next_request: AtomicU64::new(1),
            state,
            frame,
            shutdown_tx,
        })
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// Route replies and deliveries until the socket closes.
    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: Arc<Mutex<PendingMap>>,
        consumers: Arc<Mutex<ConsumerMap>>,
        state: Arc<ConnectionStateWatch>,
        frame: FrameConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = read_frame(&mut reader, &frame) => {
                    let payload = match result {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::debug!("Broker connection ended: {e}");
                            break;
                        }
                    };
                    match decode_frame(&payload) {
                        Ok(Frame::Reply { id, result }) => {
                            if let Some(waiter) = pending.lock().await.remove(&id) {
                                let _ = waiter.send(result);
                            }
                        }
                        Ok(Frame::Deliver { queue, body }) => {
                            let mut consumers = consumers.lock().await;
                            let delivered = consumers
                                .get(&queue)
                                .is_some_and(|tx| tx.send(body).is_ok());
                            if !delivered {
                                consumers.remove(&queue);
                                tracing::debug!("Dropped delivery for unconsumed queue {queue}");
                            }
                        }
                        Ok(Frame::Request { .. }) => {
                            tracing::warn!("Broker server sent a request frame, ignoring");
                        }
                        Err(e) => {
                            tracing::error!("Undecodable frame from broker: {e}");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Order matters: `request` re-checks the state after registering.
        state.set(ConnectionState::Disconnected);
        pending.lock().await.clear();
        consumers.lock().await.clear();
    }

    /// Send one request and wait for its reply.
    async fn request(&self, request: Request) -> Result<Reply, BrokerError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.state.current() == ConnectionState::Disconnected {
            self.pending.lock().await.remove(&id);
            return Err(BrokerError::ConnectionClosed);
        }

        let payload = encode_frame(&Frame::Request { id, request })
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &payload, &self.frame).await
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(BrokerError::Transport(e.to_string()));
        }

        rx.await.map_err(|_| BrokerError::ConnectionClosed)?
    }

    async fn request_done(&self, request: Request) -> Result<(), BrokerError> {
        match self.request(request).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> BrokerError {
    BrokerError::Transport(format!("unexpected reply {reply:?}"))
}

impl Broker for RemoteBroker {
    async fn declare_anonymous(&self) -> Result<String, BrokerError> {
        match self.request(Request::DeclareAnonymous).await? {
            Reply::Queue(name) => Ok(name),
            other => Err(unexpected(other)),
        }
    }

    async fn declare_passive(&self, queue: &str) -> Result<(), BrokerError> {
        self.request_done(Request::DeclarePassive {
            queue: queue.to_string(),
        })
        .await
    }

    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.request_done(Request::Declare {
            queue: queue.to_string(),
            options,
        })
        .await
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.request_done(Request::Bind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
        })
        .await
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        // Register before asking: deliveries may overtake the reply.
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut consumers = self.consumers.lock().await;
            if consumers.get(queue).is_some_and(|tx| !tx.is_closed()) {
                return Err(BrokerError::AlreadyConsumed(queue.to_string()));
            }
            consumers.insert(queue.to_string(), tx);
        }

        let result = self
            .request_done(Request::Consume {
                queue: queue.to_string(),
            })
            .await;
        match result {
            Ok(()) => Ok(Consumer::new(queue, rx)),
            Err(e) => {
                self.consumers.lock().await.remove(queue);
                Err(e)
            }
        }
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Body) -> Result<(), BrokerError> {
        self.request_done(Request::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        })
        .await
    }

    async fn delete(&self, queue: &str) -> Result<(), BrokerError> {
        self.request_done(Request::Delete {
            queue: queue.to_string(),
        })
        .await
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        self.state.set(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DIRECT_EXCHANGE;
    use crate::tcp_server::{BrokerServer, ServerConfig};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn start_server() -> (SocketAddr, Arc<BrokerServer>) {
        let server = Arc::new(BrokerServer::new(ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        (addr, server)
    }

    #[tokio::test]
    async fn test_connection_state_transitions() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
        watch.set(ConnectionState::Connecting);
        assert_eq!(watch.current(), ConnectionState::Connecting);
        watch.set(ConnectionState::Connected);
        assert_eq!(watch.current(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_remote_declare_and_passive() {
        let (addr, _server) = start_server().await;
        let client = RemoteBroker::connect(addr).await.unwrap();
        assert_eq!(client.state().current(), ConnectionState::Connected);

        assert_eq!(
            client.declare_passive("nodeio/host").await,
            Err(BrokerError::QueueNotFound("nodeio/host".to_string()))
        );
        client
            .declare("nodeio/host", QueueOptions::auto_delete())
            .await
            .unwrap();
        assert!(client.declare_passive("nodeio/host").await.is_ok());
        assert_eq!(
            client
                .declare("nodeio/host", QueueOptions::auto_delete())
                .await,
            Err(BrokerError::QueueExists("nodeio/host".to_string()))
        );
    }

    #[tokio::test]
    async fn test_remote_fanout_delivery() {
        let (addr, _server) = start_server().await;
        let publisher = RemoteBroker::connect(addr).await.unwrap();
        let subscriber = RemoteBroker::connect(addr).await.unwrap();

        let queue = subscriber.declare_anonymous().await.unwrap();
        subscriber.bind(&queue, "amq.fanout").await.unwrap();
        let mut consumer = subscriber.consume(&queue).await.unwrap();

        publisher
            .publish("amq.fanout", "", b"commit".to_vec())
            .await
            .unwrap();
        let body = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body, b"commit");
    }

    #[tokio::test]
    async fn test_remote_backlog_flushed_on_consume() {
        let (addr, _server) = start_server().await;
        let host = RemoteBroker::connect(addr).await.unwrap();
        let peer = RemoteBroker::connect(addr).await.unwrap();
        host.declare("nodeio/host", QueueOptions::auto_delete())
            .await
            .unwrap();
        for body in [b"1", b"2", b"3"] {
            peer.publish(DIRECT_EXCHANGE, "nodeio/host", body.to_vec())
                .await
                .unwrap();
        }

        let mut consumer = host.consume("nodeio/host").await.unwrap();
        for expected in [b"1", b"2", b"3"] {
            let body = tokio::time::timeout(Duration::from_secs(1), consumer.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(body, expected);
        }
    }

    #[tokio::test]
    async fn test_close_releases_host_queue() {
        let (addr, server) = start_server().await;
        let host = RemoteBroker::connect(addr).await.unwrap();
        host.declare("nodeio/host", QueueOptions::auto_delete())
            .await
            .unwrap();
        host.close().await;
        assert_eq!(host.state().current(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.broker().queue_exists("nodeio/host").await);
        assert_eq!(
            host.declare_anonymous().await,
            Err(BrokerError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(RemoteBroker::connect(addr).await.is_err());
    }
}
