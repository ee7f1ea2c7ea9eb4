//! Command surface used by the presentation layer.
//!
//! [`Messenger`] is a cheap, cloneable handle. Every method sends a
//! [`Command`] to the controller task and waits for its reply, so calls are
//! applied in the order they are made.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use messenger_shared::constants::{APP_NAME, DEFAULT_PEER_PORT};
use messenger_shared::identity::IdentityProvider;
use messenger_shared::types::{ConnectionStats, DiscoveredService, MachineId, Message, Mode, Peer};

use crate::config::ClientConfig;
use crate::controller::{spawn_controller, Command, PeerActionResult};
use crate::error::MessengerError;
use crate::events::{EventBus, EventKind, MessengerEvent, RoomJoinedPayload, Subscription};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageData {
    pub text: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomData {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    /// Defaults to 8080 when omitted.
    #[serde(default)]
    pub port: Option<u16>,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PEER_PORT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchModeResult {
    pub success: bool,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub struct Messenger {
    identity: MachineId,
    cmd_tx: mpsc::Sender<Command>,
    bus: EventBus,
}

impl Messenger {
    /// Resolve the machine identity and start in local mode.
    pub async fn start(config: ClientConfig) -> Result<Self, MessengerError> {
        let identity = IdentityProvider::default().resolve();
        Self::spawn(config, identity, EventBus::new()).await
    }

    /// Start with an explicit identity and event bus.
    ///
    /// Listeners already subscribed on `bus` observe the startup events,
    /// such as `local-server-started`. Returns once the local mode is up.
    pub async fn spawn(
        config: ClientConfig,
        identity: MachineId,
        bus: EventBus,
    ) -> Result<Self, MessengerError> {
        info!(identity = %identity, relay = %config.relay_url, "Starting {APP_NAME}");
        let cmd_tx = spawn_controller(config, identity.clone(), bus.clone());
        let messenger = Self {
            identity,
            cmd_tx,
            bus,
        };
        messenger.switch_mode(Mode::Local).await?;
        Ok(messenger)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MessengerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx.send(make(reply_tx)).await?;
        Ok(reply_rx.await?)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&MessengerEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, listener)
    }

    pub fn get_machine_id(&self) -> MachineId {
        self.identity.clone()
    }

    pub async fn switch_mode(&self, mode: Mode) -> Result<SwitchModeResult, MessengerError> {
        let mode = self
            .request(|reply| Command::SwitchMode { mode, reply })
            .await?;
        Ok(SwitchModeResult {
            success: true,
            mode,
        })
    }

    pub async fn get_current_mode(&self) -> Result<Mode, MessengerError> {
        self.request(Command::GetMode).await
    }

    pub async fn send_message(&self, data: SendMessageData) -> Result<Message, MessengerError> {
        self.request(|reply| Command::SendMessage {
            text: data.text,
            username: data.username,
            reply,
        })
        .await
    }

    pub async fn join_room(&self, data: JoinRoomData) -> Result<RoomJoinedPayload, MessengerError> {
        self.request(|reply| Command::JoinRoom {
            username: data.username,
            reply,
        })
        .await
    }

    /// Dial a mesh endpoint. Resolves once the dial succeeds or fails.
    pub async fn connect_to_local_peer(
        &self,
        address: PeerAddress,
    ) -> Result<PeerActionResult, MessengerError> {
        let port = address.port_or_default();
        self.request(|reply| Command::ConnectPeer {
            host: address.host,
            port,
            reply,
        })
        .await
    }

    pub async fn disconnect_from_peer(
        &self,
        address: PeerAddress,
    ) -> Result<PeerActionResult, MessengerError> {
        let port = address.port_or_default();
        self.request(|reply| Command::DisconnectPeer {
            host: address.host,
            port,
            reply,
        })
        .await
    }

    pub async fn get_connection_stats(&self) -> Result<ConnectionStats, MessengerError> {
        self.request(Command::GetStats).await
    }

    pub async fn peers(&self) -> Result<Vec<Peer>, MessengerError> {
        self.request(Command::GetPeers).await
    }

    pub async fn discovered_services(&self) -> Result<Vec<DiscoveredService>, MessengerError> {
        self.request(Command::GetDiscovered).await
    }

    pub async fn is_joined(&self) -> Result<bool, MessengerError> {
        self.request(Command::IsJoined).await
    }

    /// Stop every transport and the controller task.
    pub async fn shutdown(&self) -> Result<(), MessengerError> {
        self.request(Command::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_defaults_port() {
        let address: PeerAddress = serde_json::from_str(r#"{"host":"10.0.0.2"}"#).unwrap();
        assert_eq!(address.port_or_default(), DEFAULT_PEER_PORT);
        assert_eq!(PeerAddress::new("10.0.0.2", 8123).port_or_default(), 8123);
    }

    #[test]
    fn test_peer_action_result_shape() {
        let json = serde_json::to_value(PeerActionResult::failed("Peer not found")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Peer not found");

        let json = serde_json::to_value(PeerActionResult::ok()).unwrap();
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_stopped_controller_is_reported() {
        let messenger = Messenger::spawn(
            ClientConfig::for_tests(),
            MachineId::from("solo"),
            EventBus::new(),
        )
        .await
        .unwrap();

        messenger.shutdown().await.unwrap();
        assert!(matches!(
            messenger.get_current_mode().await,
            Err(MessengerError::ControllerStopped)
        ));
    }
}
