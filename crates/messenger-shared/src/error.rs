use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Machine id source unavailable on this platform")]
    Unsupported,

    #[error("Machine id is empty")]
    Empty,

    #[error("Machine id read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
