use thiserror::Error;

/// Errors produced by the tunnel protocol layer and the sessions built on it.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Received bytes are not a well-formed envelope.
    #[error("codec error: {0}")]
    Codec(String),

    /// An outgoing message could not be turned into a frame.
    #[error("encode error: {0}")]
    Encode(String),

    /// The envelope carried a type tag that is unknown, or not valid on the
    /// channel/state it arrived in.
    #[error("unknown response: {0}")]
    UnknownResponse(String),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u64, max: usize },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("tunnel request rejected: {0}")]
    NewTunnel(String),

    #[error("unknown proxy url: {0}")]
    UnknownProxyUrl(String),

    #[error("failed to connect local service: {0}")]
    ConnectLocal(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Stable numeric code for this error (`-100` and below), as reported
    /// by the CLI on exit.
    pub fn code(&self) -> i32 {
        match self {
            TunnelError::UnknownResponse(_) => -100,
            TunnelError::AuthFailed(_) => -101,
            TunnelError::NewTunnel(_) => -102,
            TunnelError::UnknownProxyUrl(_) => -103,
            TunnelError::ConnectLocal(_) => -104,
            TunnelError::Encode(_) => -105,
            TunnelError::Codec(_) | TunnelError::FrameTooLarge { .. } => -106,
            TunnelError::Transport(_) | TunnelError::Io(_) => -107,
            TunnelError::Config(_) => -108,
            TunnelError::Closed => -109,
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
