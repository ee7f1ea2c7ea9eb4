pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod router;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use commands::{JoinRoomData, Messenger, PeerAddress, SendMessageData, SwitchModeResult};
pub use config::ClientConfig;
pub use controller::PeerActionResult;
pub use error::MessengerError;
pub use events::{EventBus, EventKind, MessengerEvent, Subscription};

/// Install the global `tracing` subscriber, honouring `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("messenger_core=debug,messenger_net=debug,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
