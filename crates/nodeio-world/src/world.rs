//! World state: the zone list, the player roster, and change notifications.
//!
//! Every mutation goes through a method on [`WorldState`] and notifies the
//! registered observers synchronously, before the method returns.

use std::collections::HashSet;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::movement::{Cell, Direction, GridDimensions, step};

// ---------------------------------------------------------------------------
// Identifiers and entities
// ---------------------------------------------------------------------------

/// Stable player identity. Nodes use the name of their private broker
/// queue, so it is unique within a broker session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A player and the cell it occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Identity.
    pub id: PlayerId,
    /// Current position.
    pub cell: Cell,
    /// Last thing the player said, if anything.
    pub message: Option<String>,
}

impl Player {
    /// A silent player at `cell`.
    pub fn new(id: PlayerId, cell: Cell) -> Self {
        Self {
            id,
            cell,
            message: None,
        }
    }
}

/// Cosmetic zone palette. Carries no gameplay meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneType {
    /// Black.
    Black,
    /// Grass.
    Grass,
    /// Gravel.
    Gravel,
    /// Rock.
    Rock,
    /// Sand.
    Sand,
    /// Snow.
    Snow,
}

impl ZoneType {
    /// Every palette entry.
    pub const ALL: [ZoneType; 6] = [
        ZoneType::Black,
        ZoneType::Grass,
        ZoneType::Gravel,
        ZoneType::Rock,
        ZoneType::Sand,
        ZoneType::Snow,
    ];

    /// Pick a palette entry uniformly.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::ALL[rng.random_range(0..Self::ALL.len())]
    }
}

/// One zone of the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Dense index, equal to the zone's position in creation order.
    pub id: u32,
    /// Cosmetic type.
    pub kind: ZoneType,
    /// Player the zone belongs to; `None` once its owner left and nobody
    /// was around to inherit it.
    pub owner: Option<PlayerId>,
}

/// Serializable copy of a whole world, sent to joining nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    /// Grid geometry.
    pub dims: GridDimensions,
    /// Zones in creation order.
    pub zones: Vec<Zone>,
    /// Players in join order.
    pub players: Vec<Player>,
}

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// Change notification raised by every world mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldEvent {
    /// A zone was appended.
    ZoneAdded {
        /// Zone index.
        zone: u32,
        /// Its cosmetic type.
        kind: ZoneType,
    },
    /// A zone changed hands.
    ZoneOwnerChanged {
        /// Zone index.
        zone: u32,
        /// New owner.
        owner: Option<PlayerId>,
    },
    /// A player joined.
    PlayerAdded {
        /// Player identity.
        player: PlayerId,
        /// Spawn cell.
        cell: Cell,
    },
    /// A player left.
    PlayerRemoved {
        /// Player identity.
        player: PlayerId,
    },
    /// A player moved one cell.
    PlayerMoved {
        /// Player identity.
        player: PlayerId,
        /// Previous cell.
        from: Cell,
        /// New cell.
        to: Cell,
    },
    /// A player said something.
    PlayerSpoke {
        /// Player identity.
        player: PlayerId,
        /// What was said.
        message: String,
    },
}

/// Errors raised when a mutation cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    /// A zone was created out of order.
    #[error("zone index {got} does not follow the last zone (expected {expected})")]
    ZoneIndexMismatch {
        /// The next dense index.
        expected: u32,
        /// The index supplied.
        got: u32,
    },

    /// The referenced zone does not exist.
    #[error("unknown zone {0}")]
    UnknownZone(u32),

    /// The referenced player is not in the roster.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),

    /// A player with this identity is already present.
    #[error("player {0} already present")]
    DuplicatePlayer(PlayerId),

    /// Another player already stands on the cell.
    #[error("cell {0} already occupied")]
    CellOccupied(Cell),

    /// Row or column outside the zone.
    #[error("cell {0} lies outside its zone")]
    OutsideZone(Cell),

    /// The move would leave the grid.
    #[error("player {player} cannot move {direction} off the grid")]
    OffGrid {
        /// Player identity.
        player: PlayerId,
        /// Attempted direction.
        direction: Direction,
    },

    /// An action arrived in its proposal form where a committed one was
    /// required.
    #[error("{0} action was never committed by the host")]
    Uncommitted(&'static str),
}

// ---------------------------------------------------------------------------
// WorldState
// ---------------------------------------------------------------------------

type Observer = Box<dyn FnMut(&WorldEvent) + Send>;

/// A node's copy of the world.
pub struct WorldState {
    dims: GridDimensions,
    zones: Vec<Zone>,
    players: Vec<Player>,
    observers: Vec<Observer>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("dims", &self.dims)
            .field("zones", &self.zones)
            .field("players", &self.players)
            .finish_non_exhaustive()
    }
}

impl WorldState {
    /// An empty world with the given geometry.
    pub fn new(dims: GridDimensions) -> Self {
        Self {
            dims,
            zones: Vec::new(),
            players: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Rebuild a world from a snapshot, checking every invariant.
    pub fn from_snapshot(snapshot: WorldSnapshot) -> Result<Self, WorldError> {
        let world = Self {
            dims: snapshot.dims,
            zones: snapshot.zones,
            players: snapshot.players,
            observers: Vec::new(),
        };
        world.check_invariants()?;
        Ok(world)
    }

    /// Copy the world into a serializable snapshot.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            dims: self.dims,
            zones: self.zones.clone(),
            players: self.players.clone(),
        }
    }

    /// Verify zone density, unique identities, and unique in-zone cells.
    pub fn check_invariants(&self) -> Result<(), WorldError> {
        for (index, zone) in self.zones.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX);
            if zone.id != expected {
                return Err(WorldError::ZoneIndexMismatch {
                    expected,
                    got: zone.id,
                });
            }
        }

        let mut ids = HashSet::new();
        let mut cells = HashSet::new();
        for player in &self.players {
            if !ids.insert(&player.id) {
                return Err(WorldError::DuplicatePlayer(player.id.clone()));
            }
            if player.cell.zone >= self.zone_count() {
                return Err(WorldError::UnknownZone(player.cell.zone));
            }
            if !self.dims.contains(player.cell) {
                return Err(WorldError::OutsideZone(player.cell));
            }
            if !cells.insert(player.cell) {
                return Err(WorldError::CellOccupied(player.cell));
            }
        }
        Ok(())
    }

    /// Register an observer for every subsequent [`WorldEvent`].
    pub fn subscribe(&mut self, observer: impl FnMut(&WorldEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn notify(&mut self, event: WorldEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }

    // --- Queries ---

    /// Grid geometry.
    pub fn dims(&self) -> GridDimensions {
        self.dims
    }

    /// Number of zones; also the index the next zone will get.
    pub fn zone_count(&self) -> u32 {
        u32::try_from(self.zones.len()).unwrap_or(u32::MAX)
    }

    /// Zones in creation order.
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Zone by index.
    pub fn zone(&self, id: u32) -> Option<&Zone> {
        self.zones.get(usize::try_from(id).ok()?)
    }

    /// Players in join order.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Number of players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Look a player up by identity. `None` is a normal outcome: the player
    /// may have disconnected while an action naming it was in flight.
    pub fn find_player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| &p.id == id)
    }

    /// Player standing on `cell`, if any.
    pub fn player_at(&self, cell: Cell) -> Option<&Player> {
        self.players.iter().find(|p| p.cell == cell)
    }

    /// Whether any player stands on `cell`.
    pub fn is_occupied(&self, cell: Cell) -> bool {
        self.player_at(cell).is_some()
    }

    // --- Mutations ---

    /// Append a zone. `index` must equal [`zone_count`](Self::zone_count).
    pub fn create_zone(
        &mut self,
        owner: Option<PlayerId>,
        kind: ZoneType,
        index: u32,
    ) -> Result<(), WorldError> {
        let expected = self.zone_count();
        if index != expected {
            return Err(WorldError::ZoneIndexMismatch {
                expected,
                got: index,
            });
        }
        self.zones.push(Zone {
            id: index,
            kind,
            owner,
        });
        self.notify(WorldEvent::ZoneAdded { zone: index, kind });
        Ok(())
    }

    /// Add a player to the roster.
    pub fn add_player(&mut self, player: Player) -> Result<(), WorldError> {
        if self.find_player(&player.id).is_some() {
            return Err(WorldError::DuplicatePlayer(player.id));
        }
        if player.cell.zone >= self.zone_count() {
            return Err(WorldError::UnknownZone(player.cell.zone));
        }
        if !self.dims.contains(player.cell) {
            return Err(WorldError::OutsideZone(player.cell));
        }
        if self.is_occupied(player.cell) {
            return Err(WorldError::CellOccupied(player.cell));
        }
        let event = WorldEvent::PlayerAdded {
            player: player.id.clone(),
            cell: player.cell,
        };
        self.players.push(player);
        self.notify(event);
        Ok(())
    }

    /// Remove a player from the roster, returning it.
    pub fn remove_player(&mut self, id: &PlayerId) -> Option<Player> {
        let index = self.players.iter().position(|p| &p.id == id)?;
        let player = self.players.remove(index);
        self.notify(WorldEvent::PlayerRemoved {
            player: player.id.clone(),
        });
        Some(player)
    }

    /// Move a player one cell. Does not check occupancy: callers must only
    /// pass moves the host has already committed.
    pub fn move_player(&mut self, id: &PlayerId, direction: Direction) -> Result<Cell, WorldError> {
        let dims = self.dims;
        let player = self
            .players
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| WorldError::UnknownPlayer(id.clone()))?;
        let from = player.cell;
        let to = step(from, direction, dims).ok_or_else(|| WorldError::OffGrid {
            player: id.clone(),
            direction,
        })?;
        player.cell = to;
        self.notify(WorldEvent::PlayerMoved {
            player: id.clone(),
            from,
            to,
        });
        Ok(to)
    }

    /// Record what a player said.
    pub fn speak(&mut self, id: &PlayerId, message: &str) -> Result<(), WorldError> {
        let player = self
            .players
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| WorldError::UnknownPlayer(id.clone()))?;
        player.message = Some(message.to_string());
        self.notify(WorldEvent::PlayerSpoke {
            player: id.clone(),
            message: message.to_string(),
        });
        Ok(())
    }

    /// Hand the listed zones to `owner`. Unknown indices are skipped.
    pub fn reassign_zones(&mut self, zones: &[u32], owner: Option<PlayerId>) {
        for &index in zones {
            let Some(zone) = usize::try_from(index)
                .ok()
                .and_then(|i| self.zones.get_mut(i))
            else {
                tracing::warn!("Cannot reassign unknown zone {index}");
                continue;
            };
            zone.owner = owner.clone();
            self.notify(WorldEvent::ZoneOwnerChanged {
                zone: index,
                owner: owner.clone(),
            });
        }
    }

    /// Replay a committed action.
    pub fn apply(&mut self, action: &Action) -> Result<(), WorldError> {
        match action {
            Action::Connect { grant: None, .. } => Err(WorldError::Uncommitted("connect")),
            Action::Connect {
                grant: Some(grant), ..
            } => {
                self.create_zone(grant.zone.owner.clone(), grant.zone.kind, grant.zone.id)?;
                self.add_player(grant.player.clone())
            }
            Action::Move { player, direction } => self.move_player(player, *direction).map(|_| ()),
            Action::Speak { player, message } => self.speak(player, message),
            Action::Disconnect { handover: None, .. } => {
                Err(WorldError::Uncommitted("disconnect"))
            }
            Action::Disconnect {
                player,
                handover: Some(handover),
            } => {
                self.remove_player(player)
                    .ok_or_else(|| WorldError::UnknownPlayer(player.clone()))?;
                self.reassign_zones(&handover.zones, handover.new_owner.clone());
                Ok(())
            }
        }
    }
}
