//! Player actions, in proposal and committed form.
//!
//! A node proposes an [`Action`] to the host. The host validates it, fills
//! in whatever the followers need to replay it deterministically (the spawn
//! grant of a `Connect`, the zone handover of a `Disconnect`) and broadcasts
//! it wrapped in a sequenced [`Commit`].

use serde::{Deserialize, Serialize};

use crate::movement::Direction;
use crate::world::{Player, PlayerId, WorldSnapshot, Zone};

/// What the host decided for a joining player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectGrant {
    /// The new player, placed at its spawn cell.
    pub player: Player,
    /// The zone created for it.
    pub zone: Zone,
    /// The world as it was before this connect was applied.
    pub world: WorldSnapshot,
}

/// Zone handover decided when a player leaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handover {
    /// Player inheriting the zones, `None` when nobody is left.
    pub new_owner: Option<PlayerId>,
    /// Zones the leaving player owned.
    pub zones: Vec<u32>,
}

/// A player action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// A node wants to join.
    Connect {
        /// Identity the joiner asks for. The host generates one when absent.
        requestor: Option<PlayerId>,
        /// Filled in by the host on commit.
        grant: Option<Box<ConnectGrant>>,
    },
    /// Move one cell.
    Move {
        /// Who moves.
        player: PlayerId,
        /// Where to.
        direction: Direction,
    },
    /// Say something.
    Speak {
        /// Who speaks.
        player: PlayerId,
        /// What is said.
        message: String,
    },
    /// A node is leaving.
    Disconnect {
        /// Who leaves.
        player: PlayerId,
        /// Filled in by the host on commit.
        handover: Option<Handover>,
    },
}

impl Action {
    /// Proposal to join.
    pub fn connect(requestor: Option<PlayerId>) -> Self {
        Action::Connect {
            requestor,
            grant: None,
        }
    }

    /// Proposal to move.
    pub fn moving(player: PlayerId, direction: Direction) -> Self {
        Action::Move { player, direction }
    }

    /// Proposal to speak.
    pub fn speak(player: PlayerId, message: impl Into<String>) -> Self {
        Action::Speak {
            player,
            message: message.into(),
        }
    }

    /// Proposal to leave.
    pub fn disconnect(player: PlayerId) -> Self {
        Action::Disconnect {
            player,
            handover: None,
        }
    }

    /// The player this action is about. For a committed `Connect` this is
    /// the granted identity, for a proposal the requested one.
    pub fn player_id(&self) -> Option<&PlayerId> {
        match self {
            Action::Connect {
                grant: Some(grant), ..
            } => Some(&grant.player.id),
            Action::Connect { requestor, .. } => requestor.as_ref(),
            Action::Move { player, .. }
            | Action::Speak { player, .. }
            | Action::Disconnect { player, .. } => Some(player),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Connect { .. } => "connect",
            Action::Move { .. } => "move",
            Action::Speak { .. } => "speak",
            Action::Disconnect { .. } => "disconnect",
        }
    }

    /// Whether the host has already filled in this action's committed
    /// fields.
    pub fn is_committed(&self) -> bool {
        match self {
            Action::Connect { grant, .. } => grant.is_some(),
            Action::Disconnect { handover, .. } => handover.is_some(),
            Action::Move { .. } | Action::Speak { .. } => false,
        }
    }
}

/// A committed action as broadcast by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Position in the host's commit order, starting at 1.
    pub sequence: u64,
    /// The validated action.
    pub action: Action,
}
