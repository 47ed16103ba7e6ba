//! Broker primitives the replication layer relies on.
//!
//! The model is a small subset of AMQP: named queues, fan-out exchanges,
//! direct publish to a queue by name, and one auto-acknowledging consumer
//! per queue. [`Broker`] is implemented in-process by
//! [`MemoryConnection`](crate::MemoryConnection) and over TCP by
//! [`RemoteBroker`](crate::RemoteBroker).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Opaque message body. The broker never looks inside.
pub type Body = Vec<u8>;

/// Exchange name meaning "deliver straight to the queue named by the
/// routing key".
pub const DIRECT_EXCHANGE: &str = "";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by broker operations.
///
/// Serializable so the TCP server can forward them to clients verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum BrokerError {
    /// The named queue does not exist.
    #[error("queue {0} not found")]
    QueueNotFound(String),

    /// A queue with this name already exists.
    #[error("queue {0} already exists")]
    QueueExists(String),

    /// The queue already has a consumer attached.
    #[error("queue {0} already has a consumer")]
    AlreadyConsumed(String),

    /// The queue is exclusive to another connection.
    #[error("queue {0} is exclusive to another connection")]
    Exclusive(String),

    /// The connection to the broker is closed.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// The transport carrying broker traffic failed.
    #[error("transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Queue options
// ---------------------------------------------------------------------------

/// Flags applied when a queue is declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Delete the queue when the declaring connection closes.
    pub auto_delete: bool,
    /// Only the declaring connection may consume from the queue.
    pub exclusive: bool,
}

impl QueueOptions {
    /// Options for the host queue: removed together with its host.
    pub fn auto_delete() -> Self {
        Self {
            auto_delete: true,
            exclusive: false,
        }
    }

    /// Options for server-named private queues.
    pub fn exclusive() -> Self {
        Self {
            auto_delete: true,
            exclusive: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection ids
// ---------------------------------------------------------------------------

/// Unique identifier for a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Receiving end of a queue subscription. Messages are acknowledged on
/// delivery; dropping the consumer discards anything still buffered.
#[derive(Debug)]
pub struct Consumer {
    queue: String,
    rx: mpsc::UnboundedReceiver<Body>,
}

impl Consumer {
    /// Wrap a delivery channel for `queue`.
    pub fn new(queue: impl Into<String>, rx: mpsc::UnboundedReceiver<Body>) -> Self {
        Self {
            queue: queue.into(),
            rx,
        }
    }

    /// Name of the queue this consumer reads.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next message. `None` once the queue is deleted or the
    /// connection is gone.
    pub async fn recv(&mut self) -> Option<Body> {
        self.rx.recv().await
    }

    /// Take a message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Body> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

/// A connection to a message broker.
///
/// Calls may block on I/O and carry no timeout of their own. Every publish
/// is fire-and-forget: success means the broker accepted the message, not
/// that anyone consumed it.
pub trait Broker: Send + Sync + 'static {
    /// Declare a private, server-named queue and return its name.
    fn declare_anonymous(&self) -> impl Future<Output = Result<String, BrokerError>> + Send;

    /// Check that `queue` exists without creating it.
    fn declare_passive(&self, queue: &str)
    -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Create `queue`. Fails with [`BrokerError::QueueExists`] if it is
    /// already there; creation is atomic across connections.
    fn declare(
        &self,
        queue: &str,
        options: QueueOptions,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Bind `queue` to the fan-out `exchange`.
    fn bind(
        &self,
        queue: &str,
        exchange: &str,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Attach the single consumer of `queue`.
    fn consume(&self, queue: &str) -> impl Future<Output = Result<Consumer, BrokerError>> + Send;

    /// Publish `body`. With [`DIRECT_EXCHANGE`] it goes to the queue named
    /// `routing_key`; otherwise to every queue bound to `exchange`.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Body,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Delete `queue`, ending its consumer.
    fn delete(&self, queue: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Close the connection, removing its auto-delete and exclusive queues.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.0 + 1, id2.0);
    }

    #[test]
    fn test_host_queue_options() {
        let options = QueueOptions::auto_delete();
        assert!(options.auto_delete);
        assert!(!options.exclusive);
        assert!(QueueOptions::exclusive().exclusive);
    }

    #[tokio::test]
    async fn test_consumer_ends_when_sender_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut consumer = Consumer::new("q", rx);
        tx.send(b"one".to_vec()).unwrap();
        drop(tx);
        assert_eq!(consumer.recv().await, Some(b"one".to_vec()));
        assert_eq!(consumer.recv().await, None);
        assert_eq!(consumer.queue(), "q");
    }
}
