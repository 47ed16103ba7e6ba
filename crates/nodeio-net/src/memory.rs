//! In-process broker.
//!
//! [`MemoryBroker`] holds the whole topology (queues, bindings, backlogs)
//! behind one lock, so every operation is atomic with respect to every
//! other connection. Each participant obtains its own [`MemoryConnection`];
//! closing it removes the auto-delete and exclusive queues it declared.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::broker::{
    Body, Broker, BrokerError, ConnectionId, Consumer, DIRECT_EXCHANGE, IdGenerator, QueueOptions,
};

/// Prefix of server-generated queue names.
const ANONYMOUS_PREFIX: &str = "amq.gen-";

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Queue {
    owner: ConnectionId,
    options: QueueOptions,
    /// Messages published while no consumer was attached.
    backlog: VecDeque<Body>,
    consumer: Option<(ConnectionId, mpsc::UnboundedSender<Body>)>,
}

impl Queue {
    fn new(owner: ConnectionId, options: QueueOptions) -> Self {
        Self {
            owner,
            options,
            backlog: VecDeque::new(),
            consumer: None,
        }
    }

    fn push(&mut self, body: Body) {
        if let Some((_, tx)) = &self.consumer {
            match tx.send(body) {
                Ok(()) => return,
                Err(mpsc::error::SendError(body)) => {
                    // Consumer went away without closing; keep the message.
                    self.consumer = None;
                    self.backlog.push_back(body);
                }
            }
        } else {
            self.backlog.push_back(body);
        }
    }

    fn has_live_consumer(&self) -> bool {
        self.consumer.as_ref().is_some_and(|(_, tx)| !tx.is_closed())
    }
}

#[derive(Debug, Default)]
struct Topology {
    queues: HashMap<String, Queue>,
    /// Exchange name -> bound queue names, in bind order.
    bindings: HashMap<String, Vec<String>>,
    next_anonymous: u64,
}

impl Topology {
    fn remove_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        if removed {
            for queues in self.bindings.values_mut() {
                queues.retain(|q| q != name);
            }
            self.bindings.retain(|_, queues| !queues.is_empty());
        }
        removed
    }

    fn release(&mut self, conn: ConnectionId) {
        let doomed: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == conn && (q.options.auto_delete || q.options.exclusive))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            self.remove_queue(name);
            tracing::debug!("Auto-deleted queue {name} of {conn:?}");
        }
        for queue in self.queues.values_mut() {
            if queue.consumer.as_ref().is_some_and(|(c, _)| *c == conn) {
                queue.consumer = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared in-process broker. Cloning yields another handle to the same
/// topology.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    topology: Arc<Mutex<Topology>>,
    ids: Arc<IdGenerator>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            id: self.ids.next_id(),
            topology: Arc::clone(&self.topology),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a queue named `name` currently exists.
    pub async fn queue_exists(&self, name: &str) -> bool {
        self.topology.lock().await.queues.contains_key(name)
    }

    /// Number of existing queues.
    pub async fn queue_count(&self) -> usize {
        self.topology.lock().await.queues.len()
    }
}

// ---------------------------------------------------------------------------
// MemoryConnection
// ---------------------------------------------------------------------------

/// One participant's connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    topology: Arc<Mutex<Topology>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Identifier of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether [`Broker::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            Err(BrokerError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl Broker for MemoryConnection {
    async fn declare_anonymous(&self) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let mut topology = self.topology.lock().await;
        topology.next_anonymous += 1;
        let name = format!("{ANONYMOUS_PREFIX}{}", topology.next_anonymous);
        topology
            .queues
            .insert(name.clone(), Queue::new(self.id, QueueOptions::exclusive()));
        Ok(name)
    }

    async fn declare_passive(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let topology = self.topology.lock().await;
        if topology.queues.contains_key(queue) {
            Ok(())
        } else {
            Err(BrokerError::QueueNotFound(queue.to_string()))
        }
    }

    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.topology.lock().await;
        if topology.queues.contains_key(queue) {
            return Err(BrokerError::QueueExists(queue.to_string()));
        }
        topology
            .queues
            .insert(queue.to_string(), Queue::new(self.id, options));
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.topology.lock().await;
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let bound = topology.bindings.entry(exchange.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        self.ensure_open()?;
        let mut topology = self.topology.lock().await;
        let entry = topology
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if entry.options.exclusive && entry.owner != self.id {
            return Err(BrokerError::Exclusive(queue.to_string()));
        }
        if entry.has_live_consumer() {
            return Err(BrokerError::AlreadyConsumed(queue.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for body in entry.backlog.drain(..) {
            // Receiver is alive in this scope; send cannot fail.
            let _ = tx.send(body);
        }
        entry.consumer = Some((self.id, tx));
        Ok(Consumer::new(queue, rx))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Body) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.topology.lock().await;

        if exchange == DIRECT_EXCHANGE {
            match topology.queues.get_mut(routing_key) {
                Some(queue) => queue.push(body),
                None => tracing::debug!("Unroutable message to missing queue {routing_key}"),
            }
            return Ok(());
        }

        let targets = topology.bindings.get(exchange).cloned().unwrap_or_default();
        if targets.is_empty() {
            tracing::debug!("Exchange {exchange} has no bindings, message dropped");
        }
        for name in targets {
            if let Some(queue) = topology.queues.get_mut(&name) {
                queue.push(body.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.topology.lock().await;
        if topology.remove_queue(queue) {
            Ok(())
        } else {
            Err(BrokerError::QueueNotFound(queue.to_string()))
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.topology.lock().await.release(self.id);
        tracing::debug!("Connection {:?} closed", self.id);
    }
}
