//! Host election.
//!
//! The first node to create the well-known host queue becomes host. Queue
//! creation is atomic on the broker, so two nodes racing through an empty
//! broker cannot both win: the loser sees `QueueExists` and follows.

use std::fmt;

use nodeio_net::{Broker, BrokerError, Consumer, QueueOptions};
use nodeio_world::PlayerId;
use tracing::{debug, info};

use crate::error::NodeError;
use crate::replicator::Topology;

/// Where a node is in the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Not started, or torn down.
    #[default]
    Uninitialized,
    /// Talking to the broker to find out whether a host exists.
    Electing,
    /// Holds the authoritative world and validates proposals.
    Host,
    /// Mirrors the host's world from broadcast commits.
    Follower,
}

impl Role {
    /// Whether this node validates proposals.
    pub fn is_host(self) -> bool {
        self == Role::Host
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Uninitialized => "uninitialized",
            Role::Electing => "electing",
            Role::Host => "host",
            Role::Follower => "follower",
        })
    }
}

/// Outcome of [`elect`].
#[derive(Debug)]
pub struct Election {
    /// `Host` or `Follower`.
    pub role: Role,
    /// This node's player identity: the name of its private queue.
    pub player_id: PlayerId,
    /// Proposals for a host, commits for a follower.
    pub consumer: Consumer,
}

/// Run the election over `broker`.
///
/// Every node first declares its private queue, whose server-assigned name
/// becomes its player id. A follower binds that queue to the fan-out
/// exchange and consumes it; a host deletes it and consumes the host queue
/// instead. Any broker failure other than the expected not-found/exists
/// answers aborts the election.
pub async fn elect<B: Broker>(broker: &B, topology: &Topology) -> Result<Election, NodeError> {
    let own_queue = broker.declare_anonymous().await?;
    let player_id = PlayerId::new(own_queue.clone());
    debug!("Declared private queue {own_queue}");

    let host_exists = match broker.declare_passive(&topology.host_queue).await {
        Ok(()) => true,
        Err(BrokerError::QueueNotFound(_)) => {
            match broker
                .declare(&topology.host_queue, QueueOptions::auto_delete())
                .await
            {
                Ok(()) => false,
                Err(BrokerError::QueueExists(_)) => {
                    debug!("Lost the race for {}", topology.host_queue);
                    true
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    };

    if host_exists {
        broker.bind(&own_queue, &topology.exchange).await?;
        let consumer = broker.consume(&own_queue).await?;
        info!("Elected follower as {player_id}");
        Ok(Election {
            role: Role::Follower,
            player_id,
            consumer,
        })
    } else {
        broker.delete(&own_queue).await?;
        let consumer = broker.consume(&topology.host_queue).await?;
        info!("Elected host as {player_id}");
        Ok(Election {
            role: Role::Host,
            player_id,
            consumer,
        })
    }
}
