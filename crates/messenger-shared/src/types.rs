use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identifier of one running instance.
///
/// Resolved once at startup by [`crate::identity::IdentityProvider`] and
/// stamped onto every outgoing message and discovery record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MachineId(pub String);

impl MachineId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last 8 characters, used in the advertised instance name.
    pub fn short(&self) -> &str {
        let len = self.0.chars().count();
        match self.0.char_indices().nth(len.saturating_sub(8)) {
            Some((idx, _)) => &self.0[idx..],
            None => &self.0,
        }
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Local,
    Internet,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Internet => "internet",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "internet" => Ok(Mode::Internet),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// How a peer reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    /// Joined through our own mesh endpoint.
    InboundLocal,
    /// Announced over a session we dialed.
    OutboundLocal,
    /// Announced by the internet relay.
    InternetRelay,
}

/// A remote instance currently considered connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub username: String,
    pub machine_id: MachineId,
    /// Session id (inbound) or the remote's socket id as it reported it.
    pub socket_id: String,
    pub role: PeerRole,
    /// Unix epoch millis.
    pub connected_at: i64,
}

impl Peer {
    /// Key used in the peer map: session id for inbound peers, machine id
    /// for everything learned through a client session.
    pub fn key(&self) -> String {
        match self.role {
            PeerRole::InboundLocal => self.socket_id.clone(),
            PeerRole::OutboundLocal | PeerRole::InternetRelay => self.machine_id.0.clone(),
        }
    }
}

/// An advertised endpoint seen on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredService {
    pub id: MachineId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub discovered_at: i64,
    pub connected: bool,
}

impl DiscoveredService {
    pub fn matches_endpoint(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
    System,
}

/// One chat line as delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Display key, unique per materialization; not used for deduplication.
    pub id: String,
    pub text: String,
    pub username: String,
    pub sender_id: Option<MachineId>,
    /// Socket id the message arrived through on the originating endpoint.
    pub sender_socket_id: Option<String>,
    /// Unix epoch millis, assigned once by the sender.
    pub timestamp: i64,
    pub direction: Direction,
}

/// Snapshot of the transport state, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub local_server_active: bool,
    pub local_port: Option<u16>,
    pub internet_connected: bool,
    /// Sessions we dialed.
    pub local_peers_count: usize,
    /// Peers joined through our mesh endpoint.
    pub connected_peers_count: usize,
    pub discovered_count: usize,
    pub current_mode: Mode,
}

/// Current time as Unix epoch millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
