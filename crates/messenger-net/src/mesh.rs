//! Local mesh endpoint: the WebSocket server side of the peer protocol.
//!
//! The endpoint runs in a dedicated tokio task that owns the listener and
//! every inbound session. External code talks to it through a
//! [`MeshHandle`] and reads [`MeshNotification`]s, the same command /
//! notification split the rest of the networking layer uses.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use messenger_shared::constants::{
    LOCAL_PORT_ATTEMPTS, LOCAL_PORT_MAX, LOCAL_PORT_MIN, SELF_ACK_SOCKET_ID, SELF_ACK_USERNAME,
};
use messenger_shared::protocol::{ChatPayload, JoinRoom, PeerPresence, WireEvent};
use messenger_shared::types::{now_millis, MachineId};

use crate::error::NetError;
use crate::session::{spawn_session, SessionEvent, SessionHandle};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Port selection for the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenPort {
    /// A random port in `min..=max`, falling back to an OS-assigned one.
    Random { min: u16, max: u16 },
    /// Exactly this port; `0` lets the OS choose.
    Fixed(u16),
}

impl Default for ListenPort {
    fn default() -> Self {
        ListenPort::Random {
            min: LOCAL_PORT_MIN,
            max: LOCAL_PORT_MAX,
        }
    }
}

/// Configuration for spawning the endpoint.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Identity carried by the join acknowledgement.
    pub identity: MachineId,
    pub host: IpAddr,
    pub port: ListenPort,
    /// Reply to each join with a synthetic user-joined for ourselves.
    /// The relay server turns this off since it is not a chat participant.
    pub acknowledge_joins: bool,
}

impl MeshConfig {
    pub fn new(identity: MachineId) -> Self {
        Self {
            identity,
            host: IpAddr::from([0, 0, 0, 0]),
            port: ListenPort::default(),
            acknowledge_joins: true,
        }
    }
}

/// Commands sent *into* the endpoint task.
#[derive(Debug)]
pub enum MeshCommand {
    /// Emit an event to every inbound session.
    Broadcast(WireEvent),
    /// Number of open inbound sessions.
    SessionCount(oneshot::Sender<usize>),
    /// Close the listener and every session.
    Shutdown,
}

/// Notifications sent *from* the endpoint task.
#[derive(Debug, Clone)]
pub enum MeshNotification {
    SessionOpened {
        session_id: String,
        remote: SocketAddr,
    },
    PeerJoined {
        session_id: String,
        username: String,
        machine_id: MachineId,
    },
    MessageReceived(ChatPayload),
    PeerLeft {
        session_id: String,
        username: String,
        machine_id: MachineId,
    },
    SessionClosed {
        session_id: String,
    },
}

/// Handle to a running endpoint.
#[derive(Debug)]
pub struct MeshHandle {
    port: u16,
    cmd_tx: mpsc::Sender<MeshCommand>,
    task: JoinHandle<()>,
}

impl MeshHandle {
    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn broadcast(&self, event: WireEvent) -> Result<(), NetError> {
        self.cmd_tx
            .send(MeshCommand::Broadcast(event))
            .await
            .map_err(|_| NetError::ChannelClosed)
    }

    pub async fn session_count(&self) -> Result<usize, NetError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(MeshCommand::SessionCount(reply_tx))
            .await
            .map_err(|_| NetError::ChannelClosed)?;
        reply_rx.await.map_err(|_| NetError::ChannelClosed)
    }

    /// Close the listener and all sessions, waiting for the task to exit.
    pub async fn stop(self) {
        if self.cmd_tx.send(MeshCommand::Shutdown).await.is_err() {
            debug!("Mesh endpoint already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "Mesh endpoint task ended abnormally");
        }
    }
}

struct InboundSession {
    handle: SessionHandle,
    joined: Option<JoinRoom>,
}

/// Bind the listener and spawn the endpoint task.
///
/// Returns the handle (carrying the bound port) and the notification
/// receiver.
pub async fn spawn_mesh(
    config: MeshConfig,
) -> anyhow::Result<(MeshHandle, mpsc::Receiver<MeshNotification>)> {
    let listener = bind_listener(config.host, config.port).await?;
    let port = listener.local_addr()?.port();

    info!(port, "Local mesh endpoint listening");

    let (cmd_tx, cmd_rx) = mpsc::channel::<MeshCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<MeshNotification>(256);

    let task = tokio::spawn(run_mesh(config, listener, cmd_rx, notif_tx));

    Ok((MeshHandle { port, cmd_tx, task }, notif_rx))
}

async fn bind_listener(host: IpAddr, port: ListenPort) -> Result<TcpListener, NetError> {
    match port {
        ListenPort::Fixed(p) => Ok(TcpListener::bind(SocketAddr::new(host, p)).await?),
        ListenPort::Random { min, max } => {
            for _ in 0..LOCAL_PORT_ATTEMPTS {
                let candidate = rand::thread_rng().gen_range(min..=max);
                match TcpListener::bind(SocketAddr::new(host, candidate)).await {
                    Ok(listener) => return Ok(listener),
                    Err(e) => debug!(port = candidate, error = %e, "Port unavailable"),
                }
            }
            warn!(min, max, "No free port in range, letting the OS choose");
            Ok(TcpListener::bind(SocketAddr::new(host, 0)).await?)
        }
    }
}

async fn run_mesh(
    config: MeshConfig,
    listener: TcpListener,
    mut cmd_rx: mpsc::Receiver<MeshCommand>,
    notif_tx: mpsc::Sender<MeshNotification>,
) {
    let (accepted_tx, mut accepted_rx) =
        mpsc::unbounded_channel::<(WebSocketStream<TcpStream>, SocketAddr)>();
    let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut sessions: HashMap<String, InboundSession> = HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(MeshCommand::Broadcast(event)) => {
                        for session in sessions.values() {
                            session.handle.send(event.clone());
                        }
                    }
                    Some(MeshCommand::SessionCount(reply)) => {
                        let _ = reply.send(sessions.len());
                    }
                    Some(MeshCommand::Shutdown) | None => {
                        info!(sessions = sessions.len(), "Mesh endpoint shutting down");
                        break;
                    }
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let accepted_tx = accepted_tx.clone();
                        tokio::spawn(async move {
                            let handshake = tokio::time::timeout(
                                HANDSHAKE_TIMEOUT,
                                tokio_tungstenite::accept_async(stream),
                            );
                            match handshake.await {
                                Ok(Ok(ws)) => {
                                    let _ = accepted_tx.send((ws, remote));
                                }
                                Ok(Err(e)) => debug!(remote = %remote, error = %e, "WebSocket handshake failed"),
                                Err(_) => debug!(remote = %remote, "WebSocket handshake timed out"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }

            Some((ws, remote)) = accepted_rx.recv() => {
                let handle = spawn_session(ws, session_tx.clone());
                let session_id = handle.id().to_string();
                info!(session = %session_id, remote = %remote, "Local client connected");
                sessions.insert(session_id.clone(), InboundSession { handle, joined: None });
                let _ = notif_tx
                    .send(MeshNotification::SessionOpened { session_id, remote })
                    .await;
            }

            Some(event) = session_rx.recv() => {
                match event {
                    SessionEvent::Frame { session_id, event } => {
                        on_frame(&config, &mut sessions, &notif_tx, session_id, event).await;
                    }
                    SessionEvent::Closed { session_id } => {
                        on_closed(&mut sessions, &notif_tx, session_id).await;
                    }
                }
            }
        }
    }

    for session in sessions.values() {
        session.handle.close();
    }
    info!("Mesh endpoint stopped");
}

async fn on_frame(
    config: &MeshConfig,
    sessions: &mut HashMap<String, InboundSession>,
    notif_tx: &mpsc::Sender<MeshNotification>,
    session_id: String,
    event: WireEvent,
) {
    match event {
        WireEvent::JoinRoom(join) => {
            let Some(session) = sessions.get_mut(&session_id) else {
                return;
            };
            debug!(session = %session_id, username = %join.username, "Join received");
            session.joined = Some(join.clone());

            if config.acknowledge_joins {
                session.handle.send(WireEvent::UserJoined(PeerPresence {
                    username: SELF_ACK_USERNAME.to_string(),
                    machine_id: config.identity.clone(),
                    socket_id: SELF_ACK_SOCKET_ID.to_string(),
                }));
            }

            broadcast_except(
                sessions,
                &session_id,
                WireEvent::UserJoined(PeerPresence {
                    username: join.username.clone(),
                    machine_id: join.machine_id.clone(),
                    socket_id: session_id.clone(),
                }),
            );

            let _ = notif_tx
                .send(MeshNotification::PeerJoined {
                    session_id,
                    username: join.username,
                    machine_id: join.machine_id,
                })
                .await;
        }

        WireEvent::SendMessage(mut chat) => {
            let joined = sessions.get(&session_id).and_then(|s| s.joined.as_ref());
            if let Some(join) = joined {
                if chat.sender_id.is_none() {
                    chat.sender_id = Some(join.machine_id.clone());
                }
                if chat.username.is_empty() {
                    chat.username = join.username.clone();
                }
            }
            chat.timestamp.get_or_insert_with(now_millis);
            chat.sender_socket_id = Some(session_id.clone());

            broadcast_except(sessions, &session_id, WireEvent::MessageReceived(chat.clone()));

            let _ = notif_tx.send(MeshNotification::MessageReceived(chat)).await;
        }

        other => {
            debug!(session = %session_id, event = other.name(), "Ignoring client event");
        }
    }
}

async fn on_closed(
    sessions: &mut HashMap<String, InboundSession>,
    notif_tx: &mpsc::Sender<MeshNotification>,
    session_id: String,
) {
    let Some(session) = sessions.remove(&session_id) else {
        return;
    };
    info!(session = %session_id, "Local client disconnected");

    if let Some(join) = session.joined {
        broadcast_except(
            sessions,
            &session_id,
            WireEvent::UserLeft(PeerPresence {
                username: join.username.clone(),
                machine_id: join.machine_id.clone(),
                socket_id: session_id.clone(),
            }),
        );
        let _ = notif_tx
            .send(MeshNotification::PeerLeft {
                session_id: session_id.clone(),
                username: join.username,
                machine_id: join.machine_id,
            })
            .await;
    }

    let _ = notif_tx
        .send(MeshNotification::SessionClosed { session_id })
        .await;
}

fn broadcast_except(sessions: &HashMap<String, InboundSession>, skip: &str, event: WireEvent) {
    for (id, session) in sessions {
        if id != skip {
            session.handle.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::dial;

    fn test_config() -> MeshConfig {
        MeshConfig {
            identity: MachineId::from("mesh-host"),
            host: IpAddr::from([127, 0, 0, 1]),
            port: ListenPort::Fixed(0),
            acknowledge_joins: true,
        }
    }

    async fn client(
        port: u16,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let ws = dial(&format!("ws://127.0.0.1:{port}"), Duration::from_secs(5))
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (spawn_session(ws, tx), rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> WireEvent {
        loop {
            match rx.recv().await.expect("session ended") {
                SessionEvent::Frame { event, .. } => return event,
                SessionEvent::Closed { .. } => panic!("session closed"),
            }
        }
    }

    async fn next_notification(rx: &mut mpsc::Receiver<MeshNotification>) -> MeshNotification {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("endpoint ended")
    }

    fn join(name: &str, id: &str) -> WireEvent {
        WireEvent::JoinRoom(JoinRoom {
            username: name.into(),
            machine_id: MachineId::from(id),
        })
    }

    #[tokio::test]
    async fn test_random_port_in_range() {
        let listener = bind_listener(
            IpAddr::from([127, 0, 0, 1]),
            ListenPort::Random {
                min: LOCAL_PORT_MIN,
                max: LOCAL_PORT_MAX,
            },
        )
        .await
        .unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_join_ack_and_broadcast() {
        let (mesh, mut notif) = spawn_mesh(test_config()).await.unwrap();

        let (alice, mut alice_rx) = client(mesh.port()).await;
        let (_bob, mut bob_rx) = client(mesh.port()).await;
        assert!(matches!(next_notification(&mut notif).await, MeshNotification::SessionOpened { .. }));
        assert!(matches!(next_notification(&mut notif).await, MeshNotification::SessionOpened { .. }));

        alice.send(join("alice", "m-alice"));

        // The joiner gets the synthetic acknowledgement carrying our identity.
        match next_frame(&mut alice_rx).await {
            WireEvent::UserJoined(p) => {
                assert_eq!(p.username, SELF_ACK_USERNAME);
                assert_eq!(p.machine_id, MachineId::from("mesh-host"));
                assert_eq!(p.socket_id, SELF_ACK_SOCKET_ID);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Everyone else learns about the joiner.
        match next_frame(&mut bob_rx).await {
            WireEvent::UserJoined(p) => assert_eq!(p.username, "alice"),
            other => panic!("unexpected: {other:?}"),
        }

        match next_notification(&mut notif).await {
            MeshNotification::PeerJoined { username, machine_id, .. } => {
                assert_eq!(username, "alice");
                assert_eq!(machine_id, MachineId::from("m-alice"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_message_is_stamped_and_not_echoed() {
        let (mesh, mut notif) = spawn_mesh(test_config()).await.unwrap();

        let (alice, mut alice_rx) = client(mesh.port()).await;
        let (_bob, mut bob_rx) = client(mesh.port()).await;
        next_notification(&mut notif).await;
        next_notification(&mut notif).await;

        alice.send(join("alice", "m-alice"));
        next_frame(&mut alice_rx).await;
        next_frame(&mut bob_rx).await;
        next_notification(&mut notif).await;

        alice.send(WireEvent::SendMessage(ChatPayload {
            text: "hello".into(),
            username: String::new(),
            timestamp: Some(42),
            sender_id: None,
            sender_socket_id: None,
        }));

        let chat = match next_frame(&mut bob_rx).await {
            WireEvent::MessageReceived(chat) => chat,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(chat.text, "hello");
        assert_eq!(chat.username, "alice");
        assert_eq!(chat.timestamp, Some(42));
        assert_eq!(chat.sender_id, Some(MachineId::from("m-alice")));
        assert_eq!(chat.sender_socket_id.as_deref(), Some(alice_server_side_id(&mut notif).await.as_str()));

        // No echo to the sender.
        let echoed = tokio::time::timeout(Duration::from_millis(200), alice_rx.recv()).await;
        assert!(echoed.is_err());

        mesh.stop().await;
    }

    async fn alice_server_side_id(notif: &mut mpsc::Receiver<MeshNotification>) -> String {
        match next_notification(notif).await {
            MeshNotification::MessageReceived(chat) => chat.sender_socket_id.unwrap(),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_user_left() {
        let (mesh, mut notif) = spawn_mesh(test_config()).await.unwrap();

        let (alice, mut alice_rx) = client(mesh.port()).await;
        let (_bob, mut bob_rx) = client(mesh.port()).await;
        next_notification(&mut notif).await;
        next_notification(&mut notif).await;

        alice.send(join("alice", "m-alice"));
        next_frame(&mut alice_rx).await;
        next_frame(&mut bob_rx).await;
        next_notification(&mut notif).await;

        alice.close();

        match next_frame(&mut bob_rx).await {
            WireEvent::UserLeft(p) => assert_eq!(p.machine_id, MachineId::from("m-alice")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(next_notification(&mut notif).await, MeshNotification::PeerLeft { .. }));
        assert!(matches!(next_notification(&mut notif).await, MeshNotification::SessionClosed { .. }));
        assert_eq!(mesh.session_count().await.unwrap(), 1);

        mesh.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_sessions() {
        let (mesh, mut notif) = spawn_mesh(test_config()).await.unwrap();
        let port = mesh.port();
        let (_alice, mut alice_rx) = client(port).await;
        next_notification(&mut notif).await;

        mesh.stop().await;

        let closed = tokio::time::timeout(Duration::from_secs(5), alice_rx.recv())
            .await
            .unwrap();
        assert!(matches!(closed, Some(SessionEvent::Closed { .. })));
        assert!(dial(&format!("ws://127.0.0.1:{port}"), Duration::from_secs(2))
            .await
            .is_err());
    }
}
