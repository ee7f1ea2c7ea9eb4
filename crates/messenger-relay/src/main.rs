//! # messenger-relay
//!
//! Internet relay for the messenger. Instances in internet mode connect
//! here; every join, leave and message is rebroadcast to the other
//! connected instances using the same wire protocol as the local mesh.

mod config;

use messenger_net::{spawn_mesh, ListenPort, MeshConfig, MeshNotification};
use messenger_shared::types::MachineId;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,messenger_relay=debug")),
        )
        .init();

    info!("Starting messenger relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");

    let mesh_config = MeshConfig {
        identity: MachineId(config.relay_id.clone()),
        host: config.listen_addr.ip(),
        port: ListenPort::Fixed(config.listen_addr.port()),
        // The hub is not a chat participant.
        acknowledge_joins: false,
    };
    let (hub, notifications) = spawn_mesh(mesh_config).await?;
    info!(addr = %config.listen_addr, port = hub.port(), "Relay hub running");

    tokio::select! {
        _ = log_activity(notifications) => {
            info!("Relay hub stopped on its own");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    hub.stop().await;
    Ok(())
}

async fn log_activity(mut notifications: mpsc::Receiver<MeshNotification>) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            MeshNotification::SessionOpened { session_id, remote } => {
                debug!(session = %session_id, remote = %remote, "Client connected");
            }
            MeshNotification::PeerJoined {
                session_id,
                username,
                machine_id,
            } => {
                info!(session = %session_id, username = %username, machine_id = %machine_id, "User joined");
            }
            MeshNotification::MessageReceived(chat) => {
                debug!(
                    session = ?chat.sender_socket_id,
                    username = %chat.username,
                    len = chat.text.len(),
                    "Message relayed"
                );
            }
            MeshNotification::PeerLeft {
                session_id,
                username,
                ..
            } => {
                info!(session = %session_id, username = %username, "User left");
            }
            MeshNotification::SessionClosed { session_id } => {
                debug!(session = %session_id, "Client disconnected");
            }
        }
    }
}
