use thiserror::Error;

/// Errors produced anywhere in the tunnel gateway.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("keyID not found: {0}")]
    KeyIdNotFound(String),

    #[error("failed to connect: {0}")]
    FailedToConnect(String),

    #[error("port pool exhausted")]
    PortPoolExhausted,

    #[error("keyID already allocated: {0}")]
    KeyIdAlreadyAllocated(String),

    #[error("duplicate token id: {0}")]
    DuplicateTokenId(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("request cancelled")]
    RequestCancelled,

    #[error("parent cancelled")]
    ParentCancelled,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
