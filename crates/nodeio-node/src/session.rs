//! Session actor: one task per node that owns the replica and every inbound
//! flow.
//!
//! All world mutations happen on the actor task. The host validates and
//! commits proposals as they come off the host queue; a follower applies
//! commits as they come off its private queue. Local intents reach the
//! actor through a [`SessionHandle`] and always travel through the host
//! queue, the host's own included.

use std::time::Duration;

use nodeio_config::Config;
use nodeio_net::{Body, Broker, Consumer};
use nodeio_world::{
    Action, ApplyOutcome, Commit, Direction, GridDimensions, PlayerId, Replica, Validator,
    WorldError, WorldEvent, WorldSnapshot, WorldState, decode,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::election::{Role, elect};
use crate::error::NodeError;
use crate::replicator::{Replicator, Topology};

// ---------------------------------------------------------------------------
// Configuration and events
// ---------------------------------------------------------------------------

/// Settings for one node session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker names.
    pub topology: Topology,
    /// Grid geometry used if this node becomes host.
    pub dims: GridDimensions,
    /// How long [`SessionHandle::leave`] waits for the disconnect commit.
    pub leave_timeout: Duration,
    /// Fixed validator seed; drawn from the OS when `None`.
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionConfig {
    /// Settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            topology: Topology::from_config(config),
            dims: GridDimensions {
                zone_size: config.world.zone_size,
                zone_line: config.world.zone_line,
            },
            leave_timeout: Duration::from_millis(config.network.leave_timeout_ms),
            seed: None,
        }
    }
}

/// Notifications for the rendering/session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired once, when this node's own player has been committed.
    WorldReady(WorldSnapshot),
    /// Fired for every change to the local world.
    WorldChanged(WorldEvent),
}

enum Command {
    Propose(Action),
    Snapshot(oneshot::Sender<Option<WorldSnapshot>>),
    Leave(oneshot::Sender<Result<(), NodeError>>),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Entry point for running a node.
pub struct Session;

impl Session {
    /// Elect over `broker`, spawn the session actor, and propose this
    /// node's `Connect`.
    ///
    /// Election failures are returned before anything is spawned.
    pub async fn start<B: Broker>(
        broker: B,
        config: SessionConfig,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), NodeError> {
        let (role_tx, role_rx) = watch::channel(Role::Uninitialized);
        role_tx.send_replace(Role::Electing);

        let election = match elect(&broker, &config.topology).await {
            Ok(election) => election,
            Err(e) => {
                role_tx.send_replace(Role::Uninitialized);
                broker.close().await;
                return Err(e);
            }
        };
        role_tx.send_replace(election.role);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let replicator = Replicator::new(broker, config.topology.clone());

        let host = if election.role.is_host() {
            let mut world = WorldState::new(config.dims);
            forward_events(&mut world, events_tx.clone());
            let validator = match config.seed {
                Some(seed) => Validator::seeded(seed),
                None => Validator::new(),
            };
            Some(HostState {
                replica: Replica::new(world),
                validator,
            })
        } else {
            None
        };

        let connect = Action::connect(Some(election.player_id.clone()));
        if let Err(e) = replicator.propose(&connect).await {
            replicator.broker().close().await;
            role_tx.send_replace(Role::Uninitialized);
            return Err(e);
        }

        let actor = Actor {
            replicator,
            role: election.role,
            role_tx,
            player_id: election.player_id.clone(),
            consumer: election.consumer,
            commands: commands_rx,
            events: events_tx,
            host,
            replica: None,
            leave_timeout: config.leave_timeout,
            leaving: None,
        };
        let task = tokio::spawn(actor.run());

        let handle = SessionHandle {
            commands: commands_tx,
            role: role_rx,
            player_id: election.player_id,
            task,
        };
        Ok((handle, events_rx))
    }
}

/// Route every world change to the session event channel.
fn forward_events(world: &mut WorldState, events: mpsc::UnboundedSender<SessionEvent>) {
    world.subscribe(move |event| {
        let _ = events.send(SessionEvent::WorldChanged(event.clone()));
    });
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Caller-side handle to a running session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    role: watch::Receiver<Role>,
    player_id: PlayerId,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Current role.
    pub fn role(&self) -> Role {
        *self.role.borrow()
    }

    /// Watch role changes.
    pub fn role_watch(&self) -> watch::Receiver<Role> {
        self.role.clone()
    }

    /// This node's player identity.
    pub fn player_id(&self) -> &PlayerId {
        &self.player_id
    }

    /// Propose moving this node's player one cell.
    pub fn move_player(&self, direction: Direction) -> Result<(), NodeError> {
        self.propose(Action::moving(self.player_id.clone(), direction))
    }

    /// Propose that this node's player says `message`.
    pub fn speak(&self, message: impl Into<String>) -> Result<(), NodeError> {
        self.propose(Action::speak(self.player_id.clone(), message))
    }

    /// Send an arbitrary proposal to the host. Fire-and-forget: a rejected
    /// proposal simply never shows up as a change.
    pub fn propose(&self, action: Action) -> Result<(), NodeError> {
        self.commands
            .send(Command::Propose(action))
            .map_err(|_| NodeError::SessionClosed)
    }

    /// Copy of the local world, or `None` before this node has joined.
    pub async fn snapshot(&self) -> Result<Option<WorldSnapshot>, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| NodeError::SessionClosed)?;
        rx.await.map_err(|_| NodeError::SessionClosed)
    }

    /// Leave the session: propose `Disconnect`, wait for it to be committed
    /// (bounded by the leave timeout), then remove this node's queue and
    /// close the broker connection. The queue removed is the host queue
    /// when this node is host.
    pub async fn leave(self) -> Result<(), NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Leave(tx))
            .map_err(|_| NodeError::SessionClosed)?;
        let result = rx.await.map_err(|_| NodeError::SessionClosed)?;
        if let Err(e) = self.task.await {
            error!("Session task failed: {e}");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct HostState {
    replica: Replica,
    validator: Validator,
}

struct Actor<B> {
    replicator: Replicator<B>,
    role: Role,
    role_tx: watch::Sender<Role>,
    player_id: PlayerId,
    consumer: Consumer,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Host only: the authoritative replica and its validator.
    host: Option<HostState>,
    /// Follower only: `None` until our own connect is committed.
    replica: Option<Replica>,
    leave_timeout: Duration,
    leaving: Option<(Instant, oneshot::Sender<Result<(), NodeError>>)>,
}

/// Whether the actor loop should keep running.
enum Flow {
    Continue,
    Stop,
}

impl<B: Broker> Actor<B> {
    async fn run(mut self) {
        loop {
            let deadline = self
                .leaving
                .as_ref()
                .map_or_else(Instant::now, |(deadline, _)| *deadline);

            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("Session handle dropped");
                        Flow::Stop
                    }
                },
                body = self.consumer.recv() => match body {
                    Some(body) => self.on_delivery(body).await,
                    None => {
                        error!("Lost {} queue {}", self.role, self.consumer.queue());
                        Flow::Stop
                    }
                },
                _ = sleep_until(deadline), if self.leaving.is_some() => {
                    warn!("Disconnect of {} not committed in time", self.player_id);
                    self.finish_leave(Err(NodeError::Timeout("disconnect commit")));
                    Flow::Stop
                }
            };

            if let Flow::Stop = flow {
                break;
            }
        }
        self.teardown().await;
    }

    fn world(&self) -> Option<&WorldState> {
        match &self.host {
            Some(host) => Some(host.replica.world()),
            None => self.replica.as_ref().map(Replica::world),
        }
    }

    fn joined(&self) -> bool {
        self.world()
            .is_some_and(|world| world.find_player(&self.player_id).is_some())
    }

    // --- Local commands ---

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Propose(action) => {
                if let Err(e) = self.replicator.propose(&action).await {
                    error!("Failed to propose {}: {e}", action.kind());
                }
                Flow::Continue
            }
            Command::Snapshot(reply) => {
                let snapshot = if self.joined() {
                    self.world().map(WorldState::snapshot)
                } else {
                    None
                };
                let _ = reply.send(snapshot);
                Flow::Continue
            }
            Command::Leave(reply) => {
                if !self.joined() {
                    debug!("Leaving before joining, nothing to disconnect");
                    let _ = reply.send(Ok(()));
                    return Flow::Stop;
                }
                let disconnect = Action::disconnect(self.player_id.clone());
                if let Err(e) = self.replicator.propose(&disconnect).await {
                    let _ = reply.send(Err(e));
                    return Flow::Stop;
                }
                self.leaving = Some((Instant::now() + self.leave_timeout, reply));
                Flow::Continue
            }
        }
    }

    fn finish_leave(&mut self, result: Result<(), NodeError>) {
        if let Some((_, reply)) = self.leaving.take() {
            let _ = reply.send(result);
        }
    }

    // --- Inbound traffic ---

    async fn on_delivery(&mut self, body: Body) -> Flow {
        if self.host.is_some() {
            self.on_proposal(&body).await
        } else {
            self.on_commit(&body)
        }
    }

    async fn on_proposal(&mut self, body: &[u8]) -> Flow {
        let action: Action = match decode(body) {
            Ok(action) => action,
            Err(e) => {
                error!("Dropping undecodable proposal: {e}");
                return Flow::Continue;
            }
        };
        let Some(host) = self.host.as_mut() else {
            return Flow::Continue;
        };

        let kind = action.kind();
        let committed = match host.validator.check(action, host.replica.world()) {
            Ok(committed) => committed,
            Err(rejection) => {
                debug!("Rejected {kind}: {rejection}");
                return Flow::Continue;
            }
        };
        let commit = match host.replica.commit(committed) {
            Ok(commit) => commit,
            Err(e) => {
                warn!("Validated {kind} failed to apply: {e}");
                return Flow::Continue;
            }
        };
        info!("Committed {} #{}", commit.action.kind(), commit.sequence);

        if let Err(e) = self.replicator.broadcast(&commit).await {
            error!("Failed to broadcast commit {}: {e}", commit.sequence);
        }
        self.after_commit(&commit)
    }

    fn on_commit(&mut self, body: &[u8]) -> Flow {
        let commit: Commit = match decode(body) {
            Ok(commit) => commit,
            Err(e) => {
                error!("Dropping undecodable commit: {e}");
                return Flow::Continue;
            }
        };

        let outcome = match self.replica.as_mut() {
            Some(replica) => replica.apply(&commit),
            None => self.join(&commit),
        };
        match outcome {
            Ok(ApplyOutcome::Applied) => self.after_commit(&commit),
            Ok(ApplyOutcome::Duplicate) => {
                debug!("Skipping commit #{}", commit.sequence);
                Flow::Continue
            }
            Err(e) => {
                warn!("Dropping commit #{}: {e}", commit.sequence);
                Flow::Continue
            }
        }
    }

    /// Build the follower replica from our own connect commit. Commits
    /// seen before it are already part of its snapshot.
    fn join(&mut self, commit: &Commit) -> Result<ApplyOutcome, WorldError> {
        let grant = match &commit.action {
            Action::Connect {
                grant: Some(grant), ..
            } if grant.player.id == self.player_id => grant,
            _ => return Ok(ApplyOutcome::Duplicate),
        };
        let mut replica = Replica::from_grant(grant, commit.sequence)?;
        forward_events(replica.world_mut(), self.events.clone());
        let outcome = replica.apply(commit)?;
        self.replica = Some(replica);
        Ok(outcome)
    }

    /// Session bookkeeping after a commit changed the local world.
    fn after_commit(&mut self, commit: &Commit) -> Flow {
        let ours = commit.action.player_id() == Some(&self.player_id);
        match &commit.action {
            Action::Connect { .. } if ours => {
                if let Some(world) = self.world() {
                    info!(
                        "World ready as {} with {} zones and {} players",
                        self.role,
                        world.zone_count(),
                        world.player_count()
                    );
                    let _ = self.events.send(SessionEvent::WorldReady(world.snapshot()));
                }
                Flow::Continue
            }
            Action::Disconnect { .. } if ours => {
                self.finish_leave(Ok(()));
                Flow::Stop
            }
            _ => Flow::Continue,
        }
    }

    /// Remove this node's queue and close the connection.
    async fn teardown(&mut self) {
        let result = if self.role.is_host() {
            self.replicator.lose_host().await
        } else {
            self.replicator
                .broker()
                .delete(self.player_id.as_str())
                .await
                .map_err(NodeError::from)
        };
        if let Err(e) = result {
            debug!("Queue cleanup skipped: {e}");
        }
        self.replicator.broker().close().await;
        self.role_tx.send_replace(Role::Uninitialized);
        info!("Session of {} closed", self.player_id);
    }
}

#[cfg(test)]
mod tests {
    use nodeio_net::MemoryBroker;

    use super::*;

    #[test]
    fn test_session_config_from_config() {
        let mut config = Config::default();
        config.world.zone_size = 5;
        config.network.leave_timeout_ms = 250;
        config.network.host_queue = "game/host".to_string();

        let session = SessionConfig::from_config(&config);
        assert_eq!(session.dims.zone_size, 5);
        assert_eq!(session.dims.zone_line, 4);
        assert_eq!(session.leave_timeout, Duration::from_millis(250));
        assert_eq!(session.topology.host_queue, "game/host");
        assert_eq!(session.seed, None);
    }

    #[tokio::test]
    async fn test_host_becomes_ready_alone() {
        let broker = MemoryBroker::new();
        let (handle, mut events) = Session::start(broker.connect(), SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(handle.role(), Role::Host);

        let snapshot = loop {
            match events.recv().await.unwrap() {
                SessionEvent::WorldReady(snapshot) => break snapshot,
                SessionEvent::WorldChanged(_) => {}
            }
        };
        assert_eq!(snapshot.zones.len(), 1);
        assert_eq!(snapshot.players.len(), 1);
        assert_eq!(&snapshot.players[0].id, handle.player_id());

        handle.leave().await.unwrap();
        assert_eq!(broker.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_before_join_returns_immediately() {
        let broker = MemoryBroker::new();
        let host_conn = broker.connect();
        // A host queue nobody consumes: the follower never gets its grant.
        host_conn
            .declare("nodeio/host", nodeio_net::QueueOptions::auto_delete())
            .await
            .unwrap();

        let (handle, _events) = Session::start(broker.connect(), SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(handle.role(), Role::Follower);
        assert_eq!(handle.snapshot().await.unwrap(), None);
        let own_queue = handle.player_id().as_str().to_string();
        handle.leave().await.unwrap();
        assert!(!broker.queue_exists(&own_queue).await);
    }
}
