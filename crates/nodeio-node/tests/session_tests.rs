//! Multi-node sessions against one broker.

use std::sync::Arc;
use std::time::Duration;

use nodeio_net::{Broker, BrokerServer, MemoryBroker, RemoteBroker, ServerConfig};
use nodeio_node::{Role, Session, SessionConfig, SessionEvent, SessionHandle};
use nodeio_world::{Action, Cell, Commit, Direction, PlayerId, WorldSnapshot, decode};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(3);

fn config(seed: u64) -> SessionConfig {
    SessionConfig {
        seed: Some(seed),
        leave_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

async fn start<B: Broker>(broker: B) -> (SessionHandle, UnboundedReceiver<SessionEvent>) {
    Session::start(broker, config(11)).await.unwrap()
}

/// Wait for the `WorldReady` event.
async fn ready(events: &mut UnboundedReceiver<SessionEvent>) -> WorldSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(SessionEvent::WorldReady(snapshot)) => return snapshot,
                Some(SessionEvent::WorldChanged(_)) => {}
                None => panic!("session ended before the world was ready"),
            }
        }
    })
    .await
    .expect("world never became ready")
}

/// Poll a node's world until `done` holds.
async fn converge(
    handle: &SessionHandle,
    done: impl Fn(&WorldSnapshot) -> bool,
) -> WorldSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(snapshot) = handle.snapshot().await.unwrap() {
                if done(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("world never converged")
}

fn cell_of(snapshot: &WorldSnapshot, id: &PlayerId) -> Option<Cell> {
    snapshot
        .players
        .iter()
        .find(|p| &p.id == id)
        .map(|p| p.cell)
}

fn said(snapshot: &WorldSnapshot, id: &PlayerId, message: &str) -> bool {
    snapshot
        .players
        .iter()
        .any(|p| &p.id == id && p.message.as_deref() == Some(message))
}

#[tokio::test]
async fn test_exactly_one_host_among_concurrent_starters() {
    let broker = MemoryBroker::new();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let conn = broker.connect();
        tasks.push(tokio::spawn(async move {
            Session::start(conn, SessionConfig::default()).await.unwrap()
        }));
    }
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap());
    }

    let hosts = sessions
        .iter()
        .filter(|(handle, _)| handle.role() == Role::Host)
        .count();
    assert_eq!(hosts, 1);

    for (_, events) in &mut sessions {
        ready(events).await;
    }
    let (host, _) = sessions
        .iter()
        .find(|(handle, _)| handle.role() == Role::Host)
        .unwrap();
    let world = converge(host, |s| s.players.len() == 8).await;
    assert_eq!(world.zones.len(), 8);
    let ids: Vec<u32> = world.zones.iter().map(|z| z.id).collect();
    assert_eq!(ids, (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_follower_move_converges_on_both_nodes() {
    let broker = MemoryBroker::new();

    let (host, mut host_events) = start(broker.connect()).await;
    assert_eq!(host.role(), Role::Host);
    let world = ready(&mut host_events).await;
    assert_eq!(world.zones.len(), 1);
    assert_eq!(cell_of(&world, host.player_id()), Some(Cell::origin(0)));

    let (follower, mut follower_events) = start(broker.connect()).await;
    assert_eq!(follower.role(), Role::Follower);
    let world = ready(&mut follower_events).await;
    assert_eq!(world.zones.len(), 2);
    assert_eq!(world.players.len(), 2);
    assert_eq!(cell_of(&world, follower.player_id()), Some(Cell::origin(1)));

    follower.move_player(Direction::Up).unwrap();
    let moved = Cell::new(1, 1, 0);
    let id = follower.player_id().clone();
    let on_host = converge(&host, |s| cell_of(s, &id) == Some(moved)).await;
    let on_follower = converge(&follower, |s| cell_of(s, &id) == Some(moved)).await;
    assert_eq!(on_host, on_follower);

    follower.leave().await.unwrap();
    host.leave().await.unwrap();
}

#[tokio::test]
async fn test_move_onto_occupied_cell_is_dropped() {
    let broker = MemoryBroker::new();
    let (host, mut host_events) = start(broker.connect()).await;
    ready(&mut host_events).await;
    let (follower, mut follower_events) = start(broker.connect()).await;
    ready(&mut follower_events).await;

    // Walk from zone 1 into zone 0 until next to the host's player, then
    // try to step onto it.
    for _ in 0..8 {
        follower.move_player(Direction::Right).unwrap();
    }
    follower.speak("done").unwrap();

    let id = follower.player_id().clone();
    let world = converge(&follower, |s| said(s, &id, "done")).await;
    assert_eq!(cell_of(&world, &id), Some(Cell::new(0, 0, 1)));
    assert_eq!(cell_of(&world, host.player_id()), Some(Cell::origin(0)));

    let host_world = converge(&host, |s| said(s, &id, "done")).await;
    assert_eq!(host_world, world);
}

#[tokio::test]
async fn test_duplicate_commit_delivery_moves_once() {
    let broker = MemoryBroker::new();
    let (host, mut host_events) = start(broker.connect()).await;
    ready(&mut host_events).await;
    let (follower, mut follower_events) = start(broker.connect()).await;
    ready(&mut follower_events).await;

    let spy = broker.connect();
    let spy_queue = spy.declare_anonymous().await.unwrap();
    spy.bind(&spy_queue, "amq.fanout").await.unwrap();
    let mut spied = spy.consume(&spy_queue).await.unwrap();

    follower.move_player(Direction::Up).unwrap();
    let body = tokio::time::timeout(WAIT, spied.recv())
        .await
        .unwrap()
        .unwrap();
    let commit: Commit = decode(&body).unwrap();
    assert!(matches!(commit.action, Action::Move { .. }));

    // Redeliver the same commit to every follower.
    spy.publish("amq.fanout", "", body).await.unwrap();
    follower.speak("after").unwrap();

    let id = follower.player_id().clone();
    let world = converge(&follower, |s| said(s, &id, "after")).await;
    assert_eq!(cell_of(&world, &id), Some(Cell::new(1, 1, 0)));
    assert_eq!(world, converge(&host, |s| said(s, &id, "after")).await);
}

#[tokio::test]
async fn test_leaving_follower_hands_over_its_zone() {
    let broker = MemoryBroker::new();
    let (host, mut host_events) = start(broker.connect()).await;
    ready(&mut host_events).await;
    let (first, mut first_events) = start(broker.connect()).await;
    ready(&mut first_events).await;
    let (second, mut second_events) = start(broker.connect()).await;
    ready(&mut second_events).await;

    let leaver = first.player_id().clone();
    first.leave().await.unwrap();
    assert!(!broker.queue_exists(leaver.as_str()).await);

    let heirs = [host.player_id().clone(), second.player_id().clone()];
    let on_host = converge(&host, |s| s.players.len() == 2).await;
    assert_eq!(on_host.zones.len(), 3);
    let owner = on_host.zones[1].owner.clone().unwrap();
    assert!(heirs.contains(&owner));

    let on_second = converge(&second, |s| s.players.len() == 2).await;
    assert_eq!(on_second, on_host);
}

#[tokio::test]
async fn test_host_leaving_frees_host_queue() {
    let broker = MemoryBroker::new();
    let (host, mut host_events) = start(broker.connect()).await;
    ready(&mut host_events).await;
    let (follower, mut follower_events) = start(broker.connect()).await;
    ready(&mut follower_events).await;

    let host_id = host.player_id().clone();
    host.leave().await.unwrap();
    assert!(!broker.queue_exists("nodeio/host").await);

    let world = converge(&follower, |s| cell_of(s, &host_id).is_none()).await;
    assert_eq!(world.zones[0].owner.as_ref(), Some(follower.player_id()));

    // Nobody takes over automatically; the next node to start hosts anew.
    assert_eq!(follower.role(), Role::Follower);
    let (newcomer, _events) = start(broker.connect()).await;
    assert_eq!(newcomer.role(), Role::Host);
}

#[tokio::test]
async fn test_nodes_over_tcp_broker() {
    let server = Arc::new(BrokerServer::new(ServerConfig::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let srv = Arc::clone(&server);
    tokio::spawn(async move {
        srv.run_with_listener(listener).await.unwrap();
    });

    let (host, mut host_events) = start(RemoteBroker::connect(addr).await.unwrap()).await;
    ready(&mut host_events).await;
    let (follower, mut follower_events) =
        start(RemoteBroker::connect(addr).await.unwrap()).await;
    let world = ready(&mut follower_events).await;
    assert_eq!(world.players.len(), 2);

    follower.move_player(Direction::Up).unwrap();
    follower.speak("over tcp").unwrap();
    let id = follower.player_id().clone();
    let on_host = converge(&host, |s| said(s, &id, "over tcp")).await;
    assert_eq!(cell_of(&on_host, &id), Some(Cell::new(1, 1, 0)));

    follower.leave().await.unwrap();
    host.leave().await.unwrap();
    server.shutdown();
}
