//! Shared grid world: zones, players, the actions that change them, and the
//! host-side validator that decides which actions are committed.
//!
//! The host owns the authoritative [`WorldState`]. Nodes propose [`Action`]s,
//! the [`Validator`] turns accepted proposals into committed actions, and
//! every node replays each [`Commit`] exactly once through its [`Replica`].

pub mod action;
pub mod codec;
pub mod movement;
pub mod replica;
pub mod validator;
pub mod world;

pub use action::{Action, Commit, ConnectGrant, Handover};
pub use codec::{CodecError, WIRE_VERSION, decode, encode};
pub use movement::{
    Cell, DEFAULT_ZONE_LINE, DEFAULT_ZONE_SIZE, Direction, GridDimensions, ParseDirectionError,
    step,
};
pub use replica::{ApplyOutcome, Replica};
pub use validator::{Rejection, Validator};
pub use world::{
    Player, PlayerId, WorldError, WorldEvent, WorldSnapshot, WorldState, Zone, ZoneType,
};
