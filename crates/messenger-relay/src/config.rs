//! Relay configuration loaded from environment variables.

use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket hub listens on.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:8080`
    pub listen_addr: SocketAddr,

    /// Identity the hub reports in its logs.
    /// Env: `RELAY_ID`
    /// Default: `relay`
    pub relay_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            relay_id: "relay".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.listen_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default");
            }
        }

        // Hosting platforms commonly hand out only a port.
        if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.listen_addr.set_port(port),
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, ignoring"),
            }
        }

        if let Some(id) = lookup("RELAY_ID") {
            if !id.is_empty() {
                config.relay_id = id;
            }
        }

        config
    }
}
