//! The two message flows between nodes.
//!
//! Proposals go point-to-point to the host queue. Commits go to the fan-out
//! exchange, which copies them to every follower's private queue.

use nodeio_config::Config;
use nodeio_net::{Broker, DIRECT_EXCHANGE};
use nodeio_world::{Action, Commit, encode};
use tracing::debug;

use crate::error::NodeError;

/// Well-known broker names shared by every node of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Queue the host consumes proposals from.
    pub host_queue: String,
    /// Fan-out exchange commits are published to.
    pub exchange: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Topology {
    /// Names from the network section of `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            host_queue: config.network.host_queue.clone(),
            exchange: config.network.exchange.clone(),
        }
    }
}

/// Publishes proposals and commits over a broker connection.
pub struct Replicator<B> {
    broker: B,
    topology: Topology,
}

impl<B: Broker> Replicator<B> {
    /// Wrap a broker connection.
    pub fn new(broker: B, topology: Topology) -> Self {
        Self { broker, topology }
    }

    /// The underlying connection.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Topology names in use.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Send a proposal to the host queue.
    pub async fn propose(&self, action: &Action) -> Result<(), NodeError> {
        let body = encode(action)?;
        debug!("Proposing {} ({} bytes)", action.kind(), body.len());
        self.broker
            .publish(DIRECT_EXCHANGE, &self.topology.host_queue, body)
            .await?;
        Ok(())
    }

    /// Fan a commit out to every follower.
    pub async fn broadcast(&self, commit: &Commit) -> Result<(), NodeError> {
        let body = encode(commit)?;
        debug!(
            "Broadcasting commit {} ({})",
            commit.sequence,
            commit.action.kind()
        );
        self.broker.publish(&self.topology.exchange, "", body).await?;
        Ok(())
    }

    /// Give up the host role by deleting the host queue. Nothing triggers
    /// this automatically; a node calls it when it leaves as host.
    pub async fn lose_host(&self) -> Result<(), NodeError> {
        self.broker.delete(&self.topology.host_queue).await?;
        Ok(())
    }
}
