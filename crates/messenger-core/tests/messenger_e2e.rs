//! Two or more messengers talking over loopback, with multicast discovery
//! disabled.

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;

use messenger_core::{
    ClientConfig, EventBus, EventKind, JoinRoomData, Messenger, MessengerEvent, PeerAddress,
    SendMessageData,
};
use messenger_net::{spawn_mesh, ListenPort, MeshConfig, MeshHandle};
use messenger_shared::types::{Direction, MachineId, Mode};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

struct Node {
    messenger: Messenger,
    events: mpsc::UnboundedReceiver<MessengerEvent>,
}

impl Node {
    async fn start(id: &str, config: ClientConfig) -> Self {
        let bus = EventBus::new();
        let (tx, events) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            let _ = bus.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        let messenger = Messenger::spawn(config, MachineId::from(id), bus)
            .await
            .expect("messenger starts");
        Self { messenger, events }
    }

    async fn local(id: &str) -> Self {
        Self::start(id, ClientConfig::for_tests()).await
    }

    async fn port(&self) -> u16 {
        self.messenger
            .get_connection_stats()
            .await
            .unwrap()
            .local_port
            .expect("local endpoint is listening")
    }

    async fn join(&self, username: &str) {
        self.messenger
            .join_room(JoinRoomData {
                username: username.into(),
            })
            .await
            .unwrap();
    }

    async fn wait_for(&mut self, pred: impl Fn(&MessengerEvent) -> bool) -> MessengerEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event bus closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// `true` if nothing matching arrives within a short quiet period.
    async fn stays_quiet(&mut self, pred: impl Fn(&MessengerEvent) -> bool) -> bool {
        tokio::time::timeout(QUIET, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return,
                    Some(_) => {}
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await
        .is_err()
    }
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn unreachable_relay() -> ClientConfig {
    ClientConfig {
        relay_url: format!("ws://127.0.0.1:{}", closed_port()),
        ..ClientConfig::for_tests()
    }
}

async fn relay_hub() -> MeshHandle {
    let (hub, mut notifications) = spawn_mesh(MeshConfig {
        identity: MachineId::from("relay"),
        host: IpAddr::from([127, 0, 0, 1]),
        port: ListenPort::Fixed(0),
        acknowledge_joins: false,
    })
    .await
    .unwrap();
    tokio::spawn(async move { while notifications.recv().await.is_some() {} });
    hub
}

fn is_message(text: &'static str) -> impl Fn(&MessengerEvent) -> bool {
    move |event| matches!(event, MessengerEvent::MessageReceived(m) if m.text == text)
}

#[tokio::test]
async fn test_connect_announces_both_sides() {
    let mut alice = Node::local("alice-id").await;
    let mut bob = Node::local("bob-id").await;
    alice.join("alice").await;
    bob.join("bob").await;

    let result = alice
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", bob.port().await))
        .await
        .unwrap();
    assert!(result.success, "{result:?}");

    alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalPeerConnected(_)))
        .await;

    match bob
        .wait_for(|e| matches!(e, MessengerEvent::PeerConnected(_)))
        .await
    {
        MessengerEvent::PeerConnected(p) => {
            assert_eq!(p.machine_id, MachineId::from("alice-id"));
            assert_eq!(p.username, "alice");
        }
        other => panic!("unexpected: {other:?}"),
    }

    match alice
        .wait_for(|e| matches!(e, MessengerEvent::PeerConnected(_)))
        .await
    {
        MessengerEvent::PeerConnected(p) => assert_eq!(p.machine_id, MachineId::from("bob-id")),
        other => panic!("unexpected: {other:?}"),
    }

    assert_eq!(alice.messenger.peers().await.unwrap().len(), 1);
    assert_eq!(
        bob.messenger
            .get_connection_stats()
            .await
            .unwrap()
            .connected_peers_count,
        1
    );
}

#[tokio::test]
async fn test_hello_is_delivered_once_over_two_paths() {
    let mut alice = Node::local("alice-id").await;
    let mut bob = Node::local("bob-id").await;
    alice.join("alice").await;
    bob.join("bob").await;

    // Each side dials the other, so every message has two routes.
    let to_bob = PeerAddress::new("127.0.0.1", bob.port().await);
    let to_alice = PeerAddress::new("127.0.0.1", alice.port().await);
    assert!(alice.messenger.connect_to_local_peer(to_bob).await.unwrap().success);
    assert!(bob.messenger.connect_to_local_peer(to_alice).await.unwrap().success);
    bob.wait_for(|e| matches!(e, MessengerEvent::PeerConnected(p) if p.username == "alice"))
        .await;

    let sent = alice
        .messenger
        .send_message(SendMessageData {
            text: "hello".into(),
            username: None,
        })
        .await
        .unwrap();
    assert_eq!(sent.direction, Direction::Sent);
    assert_eq!(sent.username, "alice");

    match bob.wait_for(is_message("hello")).await {
        MessengerEvent::MessageReceived(m) => {
            assert_eq!(m.direction, Direction::Received);
            assert_eq!(m.sender_id, Some(MachineId::from("alice-id")));
            assert_eq!(m.timestamp, sent.timestamp);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(bob.stays_quiet(is_message("hello")).await);
    assert!(alice.stays_quiet(is_message("hello")).await);
}

#[tokio::test]
async fn test_join_produces_system_message() {
    let mut alice = Node::local("alice-id").await;
    alice.join("alice").await;

    alice
        .wait_for(|e| matches!(e, MessengerEvent::RoomJoined(j) if j.username == "alice"))
        .await;
    match alice.wait_for(is_message("You joined as alice")).await {
        MessengerEvent::MessageReceived(m) => assert_eq!(m.direction, Direction::System),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(alice.messenger.is_joined().await.unwrap());
}

#[tokio::test]
async fn test_single_session_per_endpoint() {
    let alice = Node::local("alice-id").await;
    let bob = Node::local("bob-id").await;
    let port = bob.port().await;

    let (first, second) = tokio::join!(
        alice
            .messenger
            .connect_to_local_peer(PeerAddress::new("127.0.0.1", port)),
        alice
            .messenger
            .connect_to_local_peer(PeerAddress::new("127.0.0.1", port)),
    );
    let results = [first.unwrap(), second.unwrap()];
    assert_eq!(results.iter().filter(|r| r.success).count(), 1);
    assert!(results
        .iter()
        .any(|r| r.error.as_deref() == Some("Already connected")));

    let again = alice
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", port))
        .await
        .unwrap();
    assert_eq!(again.error.as_deref(), Some("Already connected"));
    assert_eq!(
        alice
            .messenger
            .get_connection_stats()
            .await
            .unwrap()
            .local_peers_count,
        1
    );
}

#[tokio::test]
async fn test_unknown_disconnect_leaves_sessions_alone() {
    let mut alice = Node::local("alice-id").await;
    let bob = Node::local("bob-id").await;
    let port = bob.port().await;

    assert!(alice
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", port))
        .await
        .unwrap()
        .success);

    let missing = alice
        .messenger
        .disconnect_from_peer(PeerAddress::new("127.0.0.1", closed_port()))
        .await
        .unwrap();
    assert!(!missing.success);
    assert_eq!(missing.error.as_deref(), Some("Peer not found"));
    let stats = alice.messenger.get_connection_stats().await.unwrap();
    assert_eq!(stats.local_peers_count, 1);

    let removed = alice
        .messenger
        .disconnect_from_peer(PeerAddress::new("127.0.0.1", port))
        .await
        .unwrap();
    assert!(removed.success);
    alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalPeerDisconnected(p) if p.port == port))
        .await;
    assert_eq!(
        alice
            .messenger
            .get_connection_stats()
            .await
            .unwrap()
            .local_peers_count,
        0
    );
}

#[tokio::test]
async fn test_failed_dial_is_reported() {
    let mut alice = Node::local("alice-id").await;
    let port = closed_port();

    let result = alice
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", port))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.is_some());

    match alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalPeerConnectionFailed(_)))
        .await
    {
        MessengerEvent::LocalPeerConnectionFailed(f) => assert_eq!(f.port, port),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_internet_mode_without_relay_drops_sends() {
    let mut alice = Node::start("alice-id", unreachable_relay()).await;

    let switched = alice.messenger.switch_mode(Mode::Internet).await.unwrap();
    assert!(switched.success);
    assert_eq!(switched.mode, Mode::Internet);
    alice
        .wait_for(|e| matches!(e, MessengerEvent::InternetConnectionFailed { .. }))
        .await;

    let sent = alice
        .messenger
        .send_message(SendMessageData {
            text: "anyone?".into(),
            username: Some("alice".into()),
        })
        .await
        .unwrap();
    assert_eq!(sent.direction, Direction::Sent);

    let stats = alice.messenger.get_connection_stats().await.unwrap();
    assert!(!stats.internet_connected);
    assert!(!stats.local_server_active);
    assert_eq!(stats.current_mode, Mode::Internet);
    assert!(alice.stays_quiet(is_message("anyone?")).await);
}

#[tokio::test]
async fn test_switch_to_internet_tears_down_local_sessions() {
    let mut alice = Node::start("alice-id", unreachable_relay()).await;
    let mut bob = Node::local("bob-id").await;
    alice.join("alice").await;
    let bob_port = bob.port().await;
    let alice_port = alice.port().await;

    assert!(alice
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", bob_port))
        .await
        .unwrap()
        .success);
    bob.wait_for(|e| matches!(e, MessengerEvent::PeerConnected(_)))
        .await;
    alice
        .wait_for(|e| matches!(e, MessengerEvent::PeerConnected(_)))
        .await;

    alice.messenger.switch_mode(Mode::Internet).await.unwrap();

    // Outbound session closed before the relay attempt.
    alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalPeerDisconnected(p) if p.port == bob_port))
        .await;
    alice
        .wait_for(|e| matches!(e, MessengerEvent::InternetConnectionFailed { .. }))
        .await;

    assert!(alice.messenger.peers().await.unwrap().is_empty());
    assert!(alice.messenger.discovered_services().await.unwrap().is_empty());
    assert!(!alice.messenger.is_joined().await.unwrap());
    let stats = alice.messenger.get_connection_stats().await.unwrap();
    assert!(!stats.local_server_active);
    assert_eq!(stats.local_peers_count, 0);

    // Bob sees alice leave, and alice's endpoint is gone.
    bob.wait_for(|e| matches!(e, MessengerEvent::PeerDisconnected(p) if p.username == "alice"))
        .await;
    let redial = bob
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", alice_port))
        .await
        .unwrap();
    assert!(!redial.success);
}

#[tokio::test]
async fn test_switch_back_to_local_uses_fresh_endpoint() {
    let mut alice = Node::start("alice-id", unreachable_relay()).await;
    alice.join("alice").await;
    alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalServerStarted { .. }))
        .await;

    alice.messenger.switch_mode(Mode::Internet).await.unwrap();
    alice.messenger.switch_mode(Mode::Local).await.unwrap();

    alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalServerStarted { .. }))
        .await;
    let stats = alice.messenger.get_connection_stats().await.unwrap();
    assert!(stats.local_server_active);
    assert_eq!(stats.current_mode, Mode::Local);
    assert!(!alice.messenger.is_joined().await.unwrap());
}

#[tokio::test]
async fn test_switch_to_same_mode_resets_state() {
    let mut alice = Node::local("alice-id").await;
    let mut bob = Node::local("bob-id").await;
    alice.join("alice").await;
    bob.join("bob").await;
    let bob_port = bob.port().await;
    let old_port = alice.port().await;

    assert!(alice
        .messenger
        .connect_to_local_peer(PeerAddress::new("127.0.0.1", bob_port))
        .await
        .unwrap()
        .success);
    alice
        .wait_for(|e| matches!(e, MessengerEvent::PeerConnected(p) if p.username == "bob"))
        .await;
    assert_eq!(alice.messenger.peers().await.unwrap().len(), 1);

    let switched = alice.messenger.switch_mode(Mode::Local).await.unwrap();
    assert_eq!(switched.mode, Mode::Local);
    alice
        .wait_for(|e| matches!(e, MessengerEvent::LocalPeerDisconnected(p) if p.port == bob_port))
        .await;

    assert!(alice.messenger.peers().await.unwrap().is_empty());
    assert!(alice.messenger.discovered_services().await.unwrap().is_empty());
    assert!(!alice.messenger.is_joined().await.unwrap());
    let stats = alice.messenger.get_connection_stats().await.unwrap();
    assert_eq!(stats.local_peers_count, 0);
    assert!(stats.local_server_active);
    assert_ne!(stats.local_port, Some(old_port));
}

#[tokio::test]
async fn test_switch_cancels_pending_connect() {
    let mut alice = Node::local("alice-id").await;

    // Accepts TCP but never answers the WebSocket handshake.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let switch = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        alice.messenger.switch_mode(Mode::Local).await.unwrap()
    };
    let (result, switched) = tokio::join!(
        alice
            .messenger
            .connect_to_local_peer(PeerAddress::new("127.0.0.1", port)),
        switch,
    );

    let result = result.unwrap();
    assert!(switched.success);
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Connection cancelled"));
    assert!(
        alice
            .stays_quiet(|e| matches!(e, MessengerEvent::LocalPeerConnected(_)))
            .await
    );
    assert_eq!(
        alice
            .messenger
            .get_connection_stats()
            .await
            .unwrap()
            .local_peers_count,
        0
    );
}

#[tokio::test]
async fn test_messages_cross_the_relay() {
    let hub = relay_hub().await;
    let config = ClientConfig {
        relay_url: format!("ws://127.0.0.1:{}", hub.port()),
        ..ClientConfig::for_tests()
    };
    let mut alice = Node::start("alice-id", config.clone()).await;
    let mut bob = Node::start("bob-id", config).await;

    for node in [&mut alice, &mut bob] {
        node.messenger.switch_mode(Mode::Internet).await.unwrap();
        node.wait_for(|e| matches!(e, MessengerEvent::InternetConnected))
            .await;
    }

    bob.join("bob").await;
    alice.join("alice").await;
    match bob
        .wait_for(|e| matches!(e, MessengerEvent::PeerConnected(_)))
        .await
    {
        MessengerEvent::PeerConnected(p) => assert_eq!(p.machine_id, MachineId::from("alice-id")),
        other => panic!("unexpected: {other:?}"),
    }

    alice
        .messenger
        .send_message(SendMessageData {
            text: "over the internet".into(),
            username: None,
        })
        .await
        .unwrap();

    match bob.wait_for(is_message("over the internet")).await {
        MessengerEvent::MessageReceived(m) => {
            assert_eq!(m.username, "alice");
            assert_eq!(m.direction, Direction::Received);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(alice.stays_quiet(is_message("over the internet")).await);
    assert!(alice.messenger.get_connection_stats().await.unwrap().internet_connected);

    hub.stop().await;
    alice
        .wait_for(|e| matches!(e, MessengerEvent::InternetDisconnected))
        .await;
}
