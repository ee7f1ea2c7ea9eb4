//! Client configuration.
//!
//! Every setting has a default so the messenger starts with zero
//! configuration; environment variables override individual values.

use std::time::Duration;

use messenger_net::ListenPort;
use messenger_shared::constants::{
    INTERNET_CONNECT_TIMEOUT_SECS, INTERNET_SERVER_URL, LOCAL_CONNECT_TIMEOUT_SECS, LOCAL_PORT_MAX,
    LOCAL_PORT_MIN,
};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay used in internet mode.
    /// Env: `MESSENGER_RELAY_URL`
    /// Default: `wss://desktop-messanger-app.onrender.com`
    pub relay_url: String,

    /// Listening port of the local mesh endpoint.
    /// Env: `MESSENGER_PORT_MIN` / `MESSENGER_PORT_MAX`
    /// Default: random in `8000..=9000`
    pub listen_port: ListenPort,

    /// Advertise and browse on the local network.
    /// Env: `MESSENGER_DISCOVERY` (true/false)
    /// Default: `true`
    pub discovery: bool,

    pub local_connect_timeout: Duration,
    pub internet_connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: INTERNET_SERVER_URL.to_string(),
            listen_port: ListenPort::Random {
                min: LOCAL_PORT_MIN,
                max: LOCAL_PORT_MAX,
            },
            discovery: true,
            local_connect_timeout: Duration::from_secs(LOCAL_CONNECT_TIMEOUT_SECS),
            internet_connect_timeout: Duration::from_secs(INTERNET_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("MESSENGER_RELAY_URL") {
            if url.starts_with("ws://") || url.starts_with("wss://") {
                config.relay_url = url;
            } else {
                tracing::warn!(value = %url, "Invalid MESSENGER_RELAY_URL, using default");
            }
        }

        let min = parse_port(&lookup, "MESSENGER_PORT_MIN").unwrap_or(LOCAL_PORT_MIN);
        let max = parse_port(&lookup, "MESSENGER_PORT_MAX").unwrap_or(LOCAL_PORT_MAX);
        if min <= max {
            config.listen_port = ListenPort::Random { min, max };
        } else {
            tracing::warn!(min, max, "Empty port range, using default");
        }

        if let Some(val) = lookup("MESSENGER_DISCOVERY") {
            config.discovery = val != "false" && val != "0";
        }

        config
    }

    /// Settings for tests: loopback-friendly OS-assigned port, no multicast.
    pub fn for_tests() -> Self {
        Self {
            listen_port: ListenPort::Fixed(0),
            discovery: false,
            ..Self::default()
        }
    }
}

fn parse_port(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u16> {
    let val = lookup(key)?;
    match val.parse::<u16>() {
        Ok(port) => Some(port),
        Err(_) => {
            tracing::warn!(value = %val, key, "Invalid port, using default");
            None
        }
    }
}
