/// Application name
pub const APP_NAME: &str = "Desktop Messenger";

/// Version advertised in the discovery record's txt entries
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Service type, as announced on the local network
pub const SERVICE_TYPE: &str = "desktop-messenger";

/// Fully qualified mDNS service type for `SERVICE_TYPE`
pub const MDNS_SERVICE_TYPE: &str = "_desktop-messenger._tcp.local.";

/// Prefix of the advertised instance name
pub const SERVICE_NAME_PREFIX: &str = "DesktopMessenger-";

/// Relay server used in internet mode
pub const INTERNET_SERVER_URL: &str = "wss://desktop-messanger-app.onrender.com";

/// Range the local mesh endpoint picks its listening port from
pub const LOCAL_PORT_MIN: u16 = 8000;
pub const LOCAL_PORT_MAX: u16 = 9000;

/// Random ports tried before asking the OS for one
pub const LOCAL_PORT_ATTEMPTS: usize = 8;

/// Port assumed when a connect request omits it
pub const DEFAULT_PEER_PORT: u16 = 8080;

/// Dial timeouts in seconds
pub const LOCAL_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const INTERNET_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Username carried by the join acknowledgement a mesh endpoint sends back
pub const SELF_ACK_USERNAME: &str = "You";

/// Socket id carried by the join acknowledgement
pub const SELF_ACK_SOCKET_ID: &str = "self";

/// Recently delivered message keys remembered for deduplication
pub const DEDUP_WINDOW: usize = 1024;
