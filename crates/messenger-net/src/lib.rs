// Transports for the messenger: WebSocket sessions, the local mesh endpoint,
// outbound peer and relay clients, and mDNS discovery.

pub mod discovery;
pub mod error;
pub mod mesh;
pub mod peers;
pub mod relay;
pub mod session;

pub use discovery::{DiscoveryEvent, DiscoveryService};
pub use error::NetError;
pub use mesh::{spawn_mesh, ListenPort, MeshCommand, MeshConfig, MeshHandle, MeshNotification};
pub use peers::{DialResolution, OutboundSession, PeerSessionManager};
pub use relay::{RelayClient, RelayResolution};
pub use session::{DialOutcome, DialTarget, SessionEvent, SessionHandle};
