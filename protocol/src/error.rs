use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("payload length exceeds u32 range")]
    PayloadTooLarge,

    #[error("channel closed")]
    ChannelClosed,

    #[error("missing file descriptor in reply ancillary data")]
    MissingFd,

    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Error kind string carried in `Err` reply bodies.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            ProtocolError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }
}
