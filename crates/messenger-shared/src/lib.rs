//! Types, wire protocol and identity shared by the messenger crates.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use identity::{IdentityProvider, MachineIdSource, OsMachineId};
pub use protocol::WireEvent;
pub use types::{
    ConnectionStats, Direction, DiscoveredService, MachineId, Message, Mode, Peer, PeerRole,
};
