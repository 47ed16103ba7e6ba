//! Host-side validation of proposed actions.
//!
//! The [`Validator`] runs only on the host, one proposal at a time. It either
//! rejects a proposal or returns the committed action, enriched where the
//! followers need more than the proposal carries to replay it.

use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::action::{Action, ConnectGrant, Handover};
use crate::movement::{Cell, Direction, step};
use crate::world::{Player, PlayerId, WorldState, Zone, ZoneType};

// ---------------------------------------------------------------------------
// Rejection
// ---------------------------------------------------------------------------

/// Reasons a proposal is not committed. Never sent back to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The acting player is not in the world.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// Another player stands on the destination cell.
    #[error("cell {cell} is occupied by {by}")]
    CellOccupied {
        /// Destination of the move.
        cell: Cell,
        /// Player already there.
        by: PlayerId,
    },

    /// The destination zone does not exist.
    #[error("{player} cannot move {direction} out of the world")]
    OffGrid {
        /// Acting player.
        player: PlayerId,
        /// Attempted direction.
        direction: Direction,
    },

    /// A `Connect` named a player that is already in the world.
    #[error("player {0} is already connected")]
    AlreadyConnected(PlayerId),

    /// The proposal already carries host-filled fields.
    #[error("{0} proposal is already committed")]
    AlreadyCommitted(&'static str),
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Turns proposals into committed actions against the host's world.
pub struct Validator<R = ChaCha8Rng> {
    rng: R,
}

impl Validator<ChaCha8Rng> {
    /// Validator seeded from the operating system.
    pub fn new() -> Self {
        Self::with_rng(ChaCha8Rng::from_os_rng())
    }

    /// Validator with a fixed seed, for reproducible zone palettes and
    /// handovers.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed))
    }
}

impl Default for Validator<ChaCha8Rng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> Validator<R> {
    /// Validator drawing from the given generator.
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Check a proposal against `world`. Returns the action to commit.
    ///
    /// Does not mutate `world`; the caller applies the returned action.
    pub fn check(&mut self, action: Action, world: &WorldState) -> Result<Action, Rejection> {
        if action.is_committed() {
            return Err(Rejection::AlreadyCommitted(action.kind()));
        }
        match action {
            Action::Connect { requestor, .. } => self.check_connect(requestor, world),
            Action::Move { player, direction } => {
                Self::check_move(&player, direction, world)?;
                Ok(Action::Move { player, direction })
            }
            Action::Speak { .. } => Ok(action),
            Action::Disconnect { player, .. } => self.check_disconnect(player, world),
        }
    }

    fn check_connect(
        &mut self,
        requestor: Option<PlayerId>,
        world: &WorldState,
    ) -> Result<Action, Rejection> {
        let id = match requestor.clone() {
            Some(id) if world.find_player(&id).is_some() => {
                return Err(Rejection::AlreadyConnected(id));
            }
            Some(id) => id,
            None => self.generate_id(world),
        };

        let index = world.zone_count();
        let zone = Zone {
            id: index,
            kind: ZoneType::random(&mut self.rng),
            owner: Some(id.clone()),
        };
        let grant = ConnectGrant {
            player: Player::new(id, Cell::origin(index)),
            zone,
            world: world.snapshot(),
        };
        Ok(Action::Connect {
            requestor,
            grant: Some(Box::new(grant)),
        })
    }

    fn check_move(
        player: &PlayerId,
        direction: Direction,
        world: &WorldState,
    ) -> Result<(), Rejection> {
        let from = world
            .find_player(player)
            .ok_or_else(|| Rejection::UnknownPlayer(player.clone()))?
            .cell;
        let to = step(from, direction, world.dims())
            .filter(|cell| cell.zone < world.zone_count())
            .ok_or_else(|| Rejection::OffGrid {
                player: player.clone(),
                direction,
            })?;
        if let Some(other) = world.player_at(to) {
            return Err(Rejection::CellOccupied {
                cell: to,
                by: other.id.clone(),
            });
        }
        Ok(())
    }

    fn check_disconnect(
        &mut self,
        player: PlayerId,
        world: &WorldState,
    ) -> Result<Action, Rejection> {
        if world.find_player(&player).is_none() {
            return Err(Rejection::UnknownPlayer(player));
        }
        let zones: Vec<u32> = world
            .zones()
            .iter()
            .filter(|zone| zone.owner.as_ref() == Some(&player))
            .map(|zone| zone.id)
            .collect();
        let remaining: Vec<&PlayerId> = world
            .players()
            .iter()
            .map(|p| &p.id)
            .filter(|id| **id != player)
            .collect();
        let new_owner = remaining.choose(&mut self.rng).map(|id| (*id).clone());
        Ok(Action::Disconnect {
            player,
            handover: Some(Handover { new_owner, zones }),
        })
    }

    fn generate_id(&mut self, world: &WorldState) -> PlayerId {
        loop {
            let id = PlayerId(format!("player-{:08x}", self.rng.random::<u32>()));
            if world.find_player(&id).is_none() {
                return id;
            }
        }
    }
}
