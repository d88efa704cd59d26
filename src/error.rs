use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Membership has been shut down")]
    Shutdown,
}
