//! TCP broker server.
//!
//! Exposes a [`MemoryBroker`] to remote processes. Each accepted socket gets
//! its own [`MemoryConnection`](crate::MemoryConnection), a reader task that
//! executes requests in arrival order, and a writer task that serializes
//! replies and deliveries onto the socket. When the socket closes, the
//! connection is closed too, which is what removes a departed host's queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{RwLock, mpsc, watch};

use crate::broker::{Broker, BrokerError, ConnectionId};
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::memory::{MemoryBroker, MemoryConnection};
use crate::protocol::{Frame, Reply, Request, decode_frame, encode_frame};

/// Error returned when the connection map is at capacity.
#[derive(Debug)]
pub struct ConnectionLimitReached;

/// Thread-safe map of live connections to their outbound frame queues.
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Frame>>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Insert a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(
        &self,
        id: ConnectionId,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        map.insert(id, outbound);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) -> bool {
        self.inner.write().await.remove(id).is_some()
    }

    /// Return the number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Configuration for [`BrokerServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:5673`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Framing limits.
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5673)),
            max_connections: 256,
            frame: FrameConfig::default(),
        }
    }
}

/// TCP front-end for a [`MemoryBroker`].
pub struct BrokerServer {
    config: ServerConfig,
    broker: MemoryBroker,
    /// Live connection map (public for test inspection).
    pub connections: Arc<ConnectionMap>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BrokerServer {
    /// Create a server around a fresh, empty broker.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_broker(config, MemoryBroker::new())
    }

    /// Create a server exposing an existing broker.
    pub fn with_broker(config: ServerConfig, broker: MemoryBroker) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            broker,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// The broker this server exposes.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Broker listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = result?;
                    stream.set_nodelay(true)?;

                    let conn = self.broker.connect();
                    let id = conn.id();
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

                    if self.connections.insert(id, outbound_tx.clone()).await.is_err() {
                        tracing::warn!("Connection limit reached, rejecting {peer_addr}");
                        continue;
                    }
                    tracing::info!("Accepted broker connection {id:?} from {peer_addr}");

                    let (reader, writer) = stream.into_split();
                    let frame = self.config.frame;
                    tokio::spawn(Self::write_loop(id, writer, outbound_rx, frame));

                    let connections = Arc::clone(&self.connections);
                    let mut task_shutdown = self.shutdown_rx.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(&conn, reader, outbound_tx, frame, &mut task_shutdown)
                            .await;
                        conn.close().await;
                        connections.remove(&id).await;
                        tracing::info!("Broker connection {id:?} closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Broker server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Per-connection request loop.
    async fn handle_connection(
        conn: &MemoryConnection,
        mut reader: OwnedReadHalf,
        outbound: mpsc::UnboundedSender<Frame>,
        frame: FrameConfig,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let id = conn.id();
        loop {
            tokio::select! {
                result = read_frame(&mut reader, &frame) => {
                    let payload = match result {
                        Ok(payload) => payload,
                        Err(FrameError::ConnectionClosed) => break,
                        Err(e) => {
                            tracing::warn!("Connection {id:?} framing error: {e}");
                            break;
                        }
                    };
                    match decode_frame(&payload) {
                        Ok(Frame::Request { id: request_id, request }) => {
                            let result = Self::execute(conn, request, &outbound).await;
                            if outbound.send(Frame::Reply { id: request_id, result }).is_err() {
                                break;
                            }
                        }
                        Ok(other) => {
                            tracing::warn!("Connection {id:?} sent a non-request frame: {other:?}");
                        }
                        Err(e) => {
                            tracing::error!("Connection {id:?} sent an undecodable frame: {e}");
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
    }

    /// Run one request against the connection's broker handle.
    async fn execute(
        conn: &MemoryConnection,
        request: Request,
        outbound: &mpsc::UnboundedSender<Frame>,
    ) -> Result<Reply, BrokerError> {
        match request {
            Request::DeclareAnonymous => conn.declare_anonymous().await.map(Reply::Queue),
            Request::DeclarePassive { queue } => {
                conn.declare_passive(&queue).await.map(|()| Reply::Done)
            }
            Request::Declare { queue, options } => {
                conn.declare(&queue, options).await.map(|()| Reply::Done)
            }
            Request::Bind { queue, exchange } => {
                conn.bind(&queue, &exchange).await.map(|()| Reply::Done)
            }
            Request::Consume { queue } => {
                let mut consumer = conn.consume(&queue).await?;
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    while let Some(body) = consumer.recv().await {
                        let frame = Frame::Deliver {
                            queue: consumer.queue().to_string(),
                            body,
                        };
                        if outbound.send(frame).is_err() {
                            break;
                        }
                    }
                });
                Ok(Reply::Done)
            }
            Request::Publish {
                exchange,
                routing_key,
                body,
            } => conn
                .publish(&exchange, &routing_key, body)
                .await
                .map(|()| Reply::Done),
            Request::Delete { queue } => conn.delete(&queue).await.map(|()| Reply::Done),
        }
    }

    /// Drain the outbound queue onto the socket until every sender is gone.
    async fn write_loop(
        id: ConnectionId,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Frame>,
        frame: FrameConfig,
    ) {
        while let Some(message) = outbound.recv().await {
            let payload = match encode_frame(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("Connection {id:?} failed to encode frame: {e}");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &payload, &frame).await {
                tracing::debug!("Connection {id:?} write failed: {e}");
                break;
            }
        }
    }
}
