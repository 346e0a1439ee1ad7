use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid source bundle: {0}")]
    InvalidBundle(String),

    #[error("Assembly failed: {0}")]
    Assembly(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Channel session reset: {0}")]
    SessionReset(String),

    #[error("Inspection already in flight for selector: {0}")]
    InspectionInFlight(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Hot reloading is not enabled for sandbox {0}")]
    HotReloadDisabled(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

pub type SandboxResult<T> = Result<T, SandboxError>;
