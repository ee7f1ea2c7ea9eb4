//! The controller task.
//!
//! One tokio task owns the mode, the peer and discovery maps, the join
//! state and every transport. Commands from [`crate::Messenger`] and
//! notifications from the transports are handled one at a time in a single
//! `select!` loop, so a mode switch never interleaves with a send or join.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use messenger_net::peers::peer_key;
use messenger_net::{
    spawn_mesh, DialOutcome, DialResolution, DialTarget, DiscoveryEvent, DiscoveryService,
    MeshConfig, MeshHandle, MeshNotification, PeerSessionManager, RelayClient, RelayResolution,
    SessionEvent,
};
use messenger_shared::protocol::{ChatPayload, PeerPresence, WireEvent};
use messenger_shared::types::{
    now_millis, ConnectionStats, DiscoveredService, MachineId, Message, Mode, Peer, PeerRole,
};

use crate::config::ClientConfig;
use crate::events::{
    ConnectionFailedPayload, EndpointPayload, EventBus, MessengerEvent, PeerEventPayload,
    RoomJoinedPayload, ServiceLostPayload,
};
use crate::router::MessageRouter;
use crate::state::CoreState;

/// Outcome of a connect or disconnect request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeerActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Commands sent *into* the controller task.
#[derive(Debug)]
pub enum Command {
    SwitchMode {
        mode: Mode,
        reply: oneshot::Sender<Mode>,
    },
    SendMessage {
        text: String,
        username: Option<String>,
        reply: oneshot::Sender<Message>,
    },
    JoinRoom {
        username: String,
        reply: oneshot::Sender<RoomJoinedPayload>,
    },
    ConnectPeer {
        host: String,
        port: u16,
        /// Answered once the dial settles.
        reply: oneshot::Sender<PeerActionResult>,
    },
    DisconnectPeer {
        host: String,
        port: u16,
        reply: oneshot::Sender<PeerActionResult>,
    },
    GetMode(oneshot::Sender<Mode>),
    GetStats(oneshot::Sender<ConnectionStats>),
    GetPeers(oneshot::Sender<Vec<Peer>>),
    GetDiscovered(oneshot::Sender<Vec<DiscoveredService>>),
    IsJoined(oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct Controller {
    config: ClientConfig,
    state: CoreState,
    router: MessageRouter,
    bus: EventBus,

    mesh: Option<MeshHandle>,
    mesh_rx: Option<mpsc::Receiver<MeshNotification>>,
    discovery: DiscoveryService,
    discovery_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    outbound: PeerSessionManager,
    relay: RelayClient,

    session_tx: mpsc::UnboundedSender<SessionEvent>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
    /// Connect requests waiting on their dial, by `host:port`.
    pending_connects: HashMap<String, oneshot::Sender<PeerActionResult>>,
}

/// Spawn the controller task and return its command sender.
pub(crate) fn spawn_controller(
    config: ClientConfig,
    identity: MachineId,
    bus: EventBus,
) -> mpsc::Sender<Command> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
    let (session_tx, session_rx) = mpsc::unbounded_channel();
    let (dial_tx, dial_rx) = mpsc::unbounded_channel();

    let controller = Controller {
        outbound: PeerSessionManager::new(config.local_connect_timeout),
        relay: RelayClient::new(config.relay_url.clone(), config.internet_connect_timeout),
        discovery: DiscoveryService::new(identity.clone()),
        router: MessageRouter::new(identity.clone()),
        state: CoreState::new(identity),
        config,
        bus,
        mesh: None,
        mesh_rx: None,
        discovery_rx: None,
        session_tx,
        dial_tx,
        pending_connects: HashMap::new(),
    };

    tokio::spawn(controller.run(cmd_rx, session_rx, dial_rx));
    cmd_tx
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Controller {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut dial_rx: mpsc::UnboundedReceiver<DialOutcome>,
    ) {
        info!(identity = %self.state.identity(), "Messenger controller started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown(reply)) => {
                            self.teardown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            self.teardown().await;
                            break;
                        }
                    }
                }

                notification = recv_opt(&mut self.mesh_rx) => {
                    match notification {
                        Some(n) => self.on_mesh(n),
                        None => self.mesh_rx = None,
                    }
                }

                event = recv_opt(&mut self.discovery_rx) => {
                    match event {
                        Some(e) => self.on_discovery(e),
                        None => self.discovery_rx = None,
                    }
                }

                Some(event) = session_rx.recv() => self.on_session_event(event),

                Some(outcome) = dial_rx.recv() => self.on_dial_outcome(outcome),
            }
        }

        info!("Messenger controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SwitchMode { mode, reply } => {
                self.switch_mode(mode).await;
                let _ = reply.send(self.state.mode());
            }
            Command::SendMessage {
                text,
                username,
                reply,
            } => {
                let message = self.send_message(&text, username).await;
                let _ = reply.send(message);
            }
            Command::JoinRoom { username, reply } => {
                let _ = reply.send(self.join_room(username));
            }
            Command::ConnectPeer { host, port, reply } => self.connect_peer(host, port, reply),
            Command::DisconnectPeer { host, port, reply } => {
                let _ = reply.send(self.disconnect_peer(&host, port));
            }
            Command::GetMode(reply) => {
                let _ = reply.send(self.state.mode());
            }
            Command::GetStats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::GetPeers(reply) => {
                let _ = reply.send(self.state.peers());
            }
            Command::GetDiscovered(reply) => {
                let _ = reply.send(self.state.discovered());
            }
            Command::IsJoined(reply) => {
                let _ = reply.send(self.state.is_joined());
            }
            Command::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
        }
    }

    // -- Mode --

    async fn switch_mode(&mut self, mode: Mode) {
        info!(from = %self.state.mode(), to = %mode, "Switching mode");

        self.teardown().await;
        let generation = self.state.begin_mode(mode);
        debug!(generation, "Transport state cleared");

        match mode {
            Mode::Internet => self.relay.connect(self.dial_tx.clone()),
            Mode::Local => self.start_local().await,
        }
    }

    /// Stop every transport of either mode. State maps are left to the
    /// caller.
    async fn teardown(&mut self) {
        if let Some(mesh) = self.mesh.take() {
            mesh.stop().await;
        }
        self.mesh_rx = None;

        self.discovery.stop();
        self.discovery_rx = None;

        for session in self.outbound.stop_all() {
            self.bus
                .emit(&MessengerEvent::LocalPeerDisconnected(EndpointPayload {
                    host: session.host,
                    port: session.port,
                }));
        }
        for (_, reply) in self.pending_connects.drain() {
            let _ = reply.send(PeerActionResult::failed("Connection cancelled"));
        }

        if self.relay.disconnect() {
            self.bus.emit(&MessengerEvent::InternetDisconnected);
        }
    }

    async fn start_local(&mut self) {
        let config = MeshConfig {
            host: IpAddr::from([0, 0, 0, 0]),
            port: self.config.listen_port,
            ..MeshConfig::new(self.state.identity().clone())
        };

        let (mesh, mesh_rx) = match spawn_mesh(config).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(error = %e, "Failed to start local mesh endpoint");
                return;
            }
        };
        let port = mesh.port();
        self.mesh = Some(mesh);
        self.mesh_rx = Some(mesh_rx);
        self.bus.emit(&MessengerEvent::LocalServerStarted { port });

        if !self.config.discovery {
            debug!("Local discovery disabled");
            return;
        }
        if let Err(e) = self.discovery.advertise(port) {
            warn!(error = %e, "Failed to advertise on the local network");
        }
        match self.discovery.browse() {
            Ok(rx) => self.discovery_rx = Some(rx),
            Err(e) => warn!(error = %e, "Failed to browse the local network"),
        }
    }

    // -- Messaging --

    async fn send_message(&mut self, text: &str, username: Option<String>) -> Message {
        let username = username
            .filter(|u| !u.is_empty())
            .or_else(|| self.state.username().map(str::to_string))
            .unwrap_or_default();
        let (message, payload) = self.router.outgoing(text, &username);

        match self.state.mode() {
            Mode::Local => {
                if let Some(mesh) = &self.mesh {
                    if let Err(e) = mesh.broadcast(WireEvent::MessageReceived(payload.clone())).await {
                        debug!(error = %e, "Mesh endpoint unavailable for broadcast");
                    }
                }
                self.outbound.broadcast(&WireEvent::SendMessage(payload));
            }
            Mode::Internet => {
                if !self.relay.send(WireEvent::SendMessage(payload)) {
                    debug!("Not connected to the internet relay, message dropped");
                }
            }
        }

        message
    }

    fn join_room(&mut self, username: String) -> RoomJoinedPayload {
        let join = self.router.join_payload(&username);
        self.state.join(username.clone());

        match self.state.mode() {
            Mode::Local => self.outbound.broadcast(&WireEvent::JoinRoom(join.clone())),
            Mode::Internet => {
                if !self.relay.send(WireEvent::JoinRoom(join.clone())) {
                    debug!("Not connected to the internet relay, join kept locally");
                }
            }
        }
        info!(username = %username, mode = %self.state.mode(), "Joined room");

        let joined = RoomJoinedPayload {
            username: join.username,
            machine_id: join.machine_id,
        };
        self.bus.emit(&MessengerEvent::RoomJoined(joined.clone()));
        let notice = self.router.system(format!("You joined as {username}"));
        self.bus.emit(&MessengerEvent::MessageReceived(notice));
        joined
    }

    fn deliver(&mut self, chat: ChatPayload) {
        if let Some(message) = self.router.inbound(chat) {
            self.bus.emit(&MessengerEvent::MessageReceived(message));
        }
    }

    // -- Outbound peers --

    fn connect_peer(&mut self, host: String, port: u16, reply: oneshot::Sender<PeerActionResult>) {
        if self.state.mode() != Mode::Local {
            let _ = reply.send(PeerActionResult::failed("Local mode is not active"));
            return;
        }
        match self.outbound.connect(&host, port, self.dial_tx.clone()) {
            Ok(()) => {
                self.pending_connects.insert(peer_key(&host, port), reply);
            }
            Err(e) => {
                let _ = reply.send(PeerActionResult::failed(e.to_string()));
            }
        }
    }

    fn disconnect_peer(&mut self, host: &str, port: u16) -> PeerActionResult {
        match self.outbound.disconnect(host, port) {
            Ok(session) => {
                for machine_id in &session.announced {
                    self.forget_remote_peer(machine_id, PeerRole::OutboundLocal);
                }
                self.state.set_connected(host, port, false);
                self.bus
                    .emit(&MessengerEvent::LocalPeerDisconnected(EndpointPayload {
                        host: host.to_string(),
                        port,
                    }));
                PeerActionResult::ok()
            }
            Err(e) => PeerActionResult::failed(e.to_string()),
        }
    }

    fn on_dial_outcome(&mut self, outcome: DialOutcome) {
        match outcome.target {
            DialTarget::Peer { .. } => self.on_peer_dial(outcome),
            DialTarget::Relay => self.on_relay_dial(outcome),
        }
    }

    fn on_peer_dial(&mut self, outcome: DialOutcome) {
        match self.outbound.on_dial_outcome(outcome, &self.session_tx) {
            DialResolution::Connected(session) => {
                if let Some(username) = self.state.username() {
                    let join = self.router.join_payload(username);
                    session.handle.send(WireEvent::JoinRoom(join));
                }
                self.state.set_connected(&session.host, session.port, true);
                if let Some(reply) = self.pending_connects.remove(&session.key()) {
                    let _ = reply.send(PeerActionResult::ok());
                }
                self.bus
                    .emit(&MessengerEvent::LocalPeerConnected(EndpointPayload {
                        host: session.host,
                        port: session.port,
                    }));
            }
            DialResolution::Failed { host, port, error } => {
                if let Some(reply) = self.pending_connects.remove(&peer_key(&host, port)) {
                    let _ = reply.send(PeerActionResult::failed(error.clone()));
                }
                self.bus
                    .emit(&MessengerEvent::LocalPeerConnectionFailed(ConnectionFailedPayload {
                        host,
                        port,
                        error,
                    }));
            }
            DialResolution::Discarded => {}
        }
    }

    fn on_relay_dial(&mut self, outcome: DialOutcome) {
        match self.relay.on_dial_outcome(outcome, &self.session_tx) {
            RelayResolution::Connected { .. } => {
                if let Some(username) = self.state.username() {
                    let join = self.router.join_payload(username);
                    self.relay.send(WireEvent::JoinRoom(join));
                }
                self.bus.emit(&MessengerEvent::InternetConnected);
            }
            RelayResolution::Failed { error } => {
                self.bus
                    .emit(&MessengerEvent::InternetConnectionFailed { error });
            }
            RelayResolution::Discarded => {}
        }
    }

    // -- Client sessions (outbound peers and relay) --

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Frame { session_id, event } => {
                let role = if self.outbound.contains_session(&session_id) {
                    PeerRole::OutboundLocal
                } else if self.relay.is_session(&session_id) {
                    PeerRole::InternetRelay
                } else {
                    debug!(session = %session_id, "Frame from a closed session");
                    return;
                };
                self.on_client_frame(&session_id, role, event);
            }
            SessionEvent::Closed { session_id } => self.on_client_closed(&session_id),
        }
    }

    fn on_client_frame(&mut self, session_id: &str, role: PeerRole, event: WireEvent) {
        match event {
            WireEvent::UserJoined(presence) => {
                if presence.machine_id == *self.state.identity() {
                    return;
                }
                if role == PeerRole::OutboundLocal {
                    if let Some(session) = self.outbound.session_mut(session_id) {
                        session.announced.insert(presence.machine_id.clone());
                    }
                }
                let payload = peer_payload(&presence);
                let fresh = self.state.add_peer(Peer {
                    username: presence.username,
                    machine_id: presence.machine_id,
                    socket_id: presence.socket_id,
                    role,
                    connected_at: now_millis(),
                });
                if fresh {
                    info!(peer = %payload.machine_id, username = %payload.username, "Peer connected");
                    self.bus.emit(&MessengerEvent::PeerConnected(payload));
                }
            }
            WireEvent::UserLeft(presence) => {
                if presence.machine_id == *self.state.identity() {
                    return;
                }
                if role == PeerRole::OutboundLocal {
                    if let Some(session) = self.outbound.session_mut(session_id) {
                        session.announced.remove(&presence.machine_id);
                    }
                }
                self.forget_remote_peer(&presence.machine_id, role);
            }
            WireEvent::MessageReceived(chat) | WireEvent::SendMessage(chat) => self.deliver(chat),
            WireEvent::JoinRoom(_) => {
                debug!(session = %session_id, "Ignoring join-room from a server");
            }
        }
    }

    fn forget_remote_peer(&mut self, machine_id: &MachineId, role: PeerRole) {
        if let Some(peer) = self.state.remove_remote_peer(machine_id, role) {
            info!(peer = %peer.machine_id, username = %peer.username, "Peer disconnected");
            self.bus.emit(&MessengerEvent::PeerDisconnected(PeerEventPayload {
                username: peer.username,
                machine_id: peer.machine_id,
                socket_id: peer.socket_id,
            }));
        }
    }

    fn on_client_closed(&mut self, session_id: &str) {
        if let Some(session) = self.outbound.on_session_closed(session_id) {
            for machine_id in &session.announced {
                self.forget_remote_peer(machine_id, PeerRole::OutboundLocal);
            }
            self.state.set_connected(&session.host, session.port, false);
            self.bus
                .emit(&MessengerEvent::LocalPeerDisconnected(EndpointPayload {
                    host: session.host,
                    port: session.port,
                }));
        } else if self.relay.on_session_closed(session_id) {
            for peer in self.state.drain_peers(PeerRole::InternetRelay) {
                self.bus.emit(&MessengerEvent::PeerDisconnected(PeerEventPayload {
                    username: peer.username,
                    machine_id: peer.machine_id,
                    socket_id: peer.socket_id,
                }));
            }
            self.bus.emit(&MessengerEvent::InternetDisconnected);
        }
    }

    // -- Mesh endpoint --

    fn on_mesh(&mut self, notification: MeshNotification) {
        match notification {
            MeshNotification::SessionOpened { session_id, remote } => {
                debug!(session = %session_id, remote = %remote, "Inbound session opened");
            }
            MeshNotification::PeerJoined {
                session_id,
                username,
                machine_id,
            } => {
                if machine_id == *self.state.identity() {
                    debug!(session = %session_id, "Ignoring our own join");
                    return;
                }
                let payload = PeerEventPayload {
                    username: username.clone(),
                    machine_id: machine_id.clone(),
                    socket_id: session_id.clone(),
                };
                self.state.add_peer(Peer {
                    username,
                    machine_id,
                    socket_id: session_id,
                    role: PeerRole::InboundLocal,
                    connected_at: now_millis(),
                });
                info!(peer = %payload.machine_id, username = %payload.username, "Peer joined");
                self.bus.emit(&MessengerEvent::PeerConnected(payload));
            }
            MeshNotification::MessageReceived(chat) => self.deliver(chat),
            MeshNotification::PeerLeft { session_id, .. } => {
                if let Some(peer) = self.state.remove_peer(&session_id) {
                    info!(peer = %peer.machine_id, username = %peer.username, "Peer left");
                    self.bus.emit(&MessengerEvent::PeerDisconnected(PeerEventPayload {
                        username: peer.username,
                        machine_id: peer.machine_id,
                        socket_id: peer.socket_id,
                    }));
                }
            }
            MeshNotification::SessionClosed { session_id } => {
                debug!(session = %session_id, "Inbound session closed");
            }
        }
    }

    // -- Discovery --

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Appeared(mut service) => {
                service.connected = self.outbound.is_connected(&service.host, service.port);
                if self.state.add_discovered(service.clone()) {
                    info!(service = %service.name, host = %service.host, port = service.port, "Discovered local peer");
                    self.bus.emit(&MessengerEvent::LocalServiceDiscovered(service));
                }
            }
            DiscoveryEvent::Disappeared { id, name } => {
                if self.state.remove_discovered(&id).is_some() {
                    info!(service = %name, "Local peer went away");
                    self.bus
                        .emit(&MessengerEvent::LocalServiceLost(ServiceLostPayload { id, name }));
                }
            }
        }
    }

    fn stats(&self) -> ConnectionStats {
        let running = self.mesh.as_ref().filter(|m| m.is_running());
        ConnectionStats {
            local_server_active: running.is_some(),
            local_port: running.map(MeshHandle::port),
            internet_connected: self.relay.is_connected(),
            local_peers_count: self.outbound.session_count(),
            connected_peers_count: self.state.peer_count(PeerRole::InboundLocal),
            discovered_count: self.state.discovered_count(),
            current_mode: self.state.mode(),
        }
    }
}

fn peer_payload(presence: &PeerPresence) -> PeerEventPayload {
    PeerEventPayload {
        username: presence.username.clone(),
        machine_id: presence.machine_id.clone(),
        socket_id: presence.socket_id.clone(),
    }
}
