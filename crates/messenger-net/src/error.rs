use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Peer not found")]
    PeerNotFound,

    #[error("Connection timed out after {0}s")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Bind failed: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Discovery unavailable: {0}")]
    Discovery(#[from] mdns_sd::Error),

    #[error("Already browsing")]
    AlreadyBrowsing,

    #[error("Endpoint task closed")]
    ChannelClosed,
}
