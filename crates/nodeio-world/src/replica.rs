//! A node's replica: a [`WorldState`] plus the sequence number of the last
//! commit applied to it.
//!
//! Commits are numbered by the host. A replica only moves forward, so a
//! redelivered commit is recognised and skipped instead of being replayed.

use tracing::warn;

use crate::action::{Action, Commit, ConnectGrant};
use crate::world::{WorldError, WorldState};

/// Result of offering a commit to a [`Replica`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The commit was new and has been applied.
    Applied,
    /// The commit was already applied; nothing changed.
    Duplicate,
}

/// World state tracked against the host's commit order.
#[derive(Debug)]
pub struct Replica {
    world: WorldState,
    applied: u64,
}

impl Replica {
    /// Replica of `world`, with no commits applied yet.
    pub fn new(world: WorldState) -> Self {
        Self { world, applied: 0 }
    }

    /// Replica for a joiner, built from the snapshot in its own connect
    /// grant. The grant's commit must be applied next, with `sequence`.
    pub fn from_grant(grant: &ConnectGrant, sequence: u64) -> Result<Self, WorldError> {
        let world = WorldState::from_snapshot(grant.world.clone())?;
        Ok(Self {
            world,
            applied: sequence.saturating_sub(1),
        })
    }

    /// The replicated world.
    pub fn world(&self) -> &WorldState {
        &self.world
    }

    /// Mutable access, for registering observers.
    pub fn world_mut(&mut self) -> &mut WorldState {
        &mut self.world
    }

    /// Sequence number of the last applied commit.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Apply a commit received from the host.
    ///
    /// A commit that fails to apply still counts as seen, so the replica
    /// stays in step with the host's numbering.
    pub fn apply(&mut self, commit: &Commit) -> Result<ApplyOutcome, WorldError> {
        if commit.sequence <= self.applied {
            return Ok(ApplyOutcome::Duplicate);
        }
        if commit.sequence != self.applied + 1 {
            warn!(
                "Commit sequence gap: expected {}, got {}",
                self.applied + 1,
                commit.sequence
            );
        }
        self.applied = commit.sequence;
        self.world.apply(&commit.action)?;
        Ok(ApplyOutcome::Applied)
    }

    /// Host side: apply a validated action and number it.
    pub fn commit(&mut self, action: Action) -> Result<Commit, WorldError> {
        self.world.apply(&action)?;
        self.applied += 1;
        Ok(Commit {
            sequence: self.applied,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{Cell, Direction, GridDimensions};
    use crate::validator::Validator;
    use crate::world::PlayerId;

    fn host_with_two_players() -> (Replica, Validator, Vec<Commit>) {
        let mut host = Replica::new(WorldState::new(GridDimensions::default()));
        let mut validator = Validator::seeded(1);
        let mut commits = Vec::new();
        for id in ["h", "f"] {
            let action = validator
                .check(Action::connect(Some(id.into())), host.world())
                .unwrap();
            commits.push(host.commit(action).unwrap());
        }
        (host, validator, commits)
    }

    fn joiner_from(commit: &Commit) -> Replica {
        let Action::Connect {
            grant: Some(grant), ..
        } = &commit.action
        else {
            panic!("not a committed connect");
        };
        let mut replica = Replica::from_grant(grant, commit.sequence).unwrap();
        assert_eq!(replica.apply(commit), Ok(ApplyOutcome::Applied));
        replica
    }

    #[test]
    fn test_host_numbers_commits_from_one() {
        let (host, _, commits) = host_with_two_players();
        let sequences: Vec<u64> = commits.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(host.applied(), 2);
    }

    #[test]
    fn test_joiner_converges_with_host() {
        let (host, _, commits) = host_with_two_players();
        let joiner = joiner_from(&commits[1]);
        assert_eq!(joiner.world().snapshot(), host.world().snapshot());
        assert_eq!(joiner.applied(), host.applied());
        assert_eq!(joiner.world().zone_count(), 2);
        assert_eq!(joiner.world().player_count(), 2);
    }

    #[test]
    fn test_duplicate_move_applied_once() {
        let (mut host, mut validator, commits) = host_with_two_players();
        let mut joiner = joiner_from(&commits[1]);

        let action = validator
            .check(Action::moving("f".into(), Direction::Up), host.world())
            .unwrap();
        let commit = host.commit(action).unwrap();

        assert_eq!(joiner.apply(&commit), Ok(ApplyOutcome::Applied));
        assert_eq!(joiner.apply(&commit), Ok(ApplyOutcome::Duplicate));

        let f = PlayerId::from("f");
        assert_eq!(
            joiner.world().find_player(&f).unwrap().cell,
            Cell::new(1, 1, 0)
        );
        assert_eq!(joiner.world().snapshot(), host.world().snapshot());
    }

    #[test]
    fn test_stale_commits_before_own_connect_are_skipped() {
        let (_, _, commits) = host_with_two_players();
        let mut joiner = joiner_from(&commits[1]);
        assert_eq!(joiner.apply(&commits[0]), Ok(ApplyOutcome::Duplicate));
    }

    #[test]
    fn test_failed_apply_still_advances() {
        let mut replica = Replica::new(WorldState::new(GridDimensions::default()));
        let commit = Commit {
            sequence: 1,
            action: Action::moving("ghost".into(), Direction::Up),
        };
        assert_eq!(
            replica.apply(&commit),
            Err(WorldError::UnknownPlayer("ghost".into()))
        );
        assert_eq!(replica.applied(), 1);
        assert_eq!(replica.apply(&commit), Ok(ApplyOutcome::Duplicate));
    }

    #[test]
    fn test_host_commit_failure_keeps_sequence() {
        let mut host = Replica::new(WorldState::new(GridDimensions::default()));
        assert!(
            host.commit(Action::moving("ghost".into(), Direction::Up))
                .is_err()
        );
        assert_eq!(host.applied(), 0);
    }
}
