use cradle_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("vm token already registered: {0}")]
    Conflict(String),

    #[error("unknown vm token: {0}")]
    UnknownVm(String),

    #[error("session is not attached to a vm")]
    NotAttached,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("pod definition holds more than one container")]
    InvalidPod,

    #[error("agent channel closed")]
    ChannelClosed,

    #[error("agent command timed out")]
    Timeout,

    #[error("agent error {code}: {message}")]
    Agent { code: i32, message: String },

    #[error("unsupported opcode {0:#x}")]
    UnknownOpcode(u32),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Error-kind string carried in `Err` reply bodies on the command socket.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Conflict(_) => "Conflict",
            ProxyError::UnknownVm(_) => "NotFound",
            ProxyError::NotAttached => "BadRequest",
            ProxyError::BadRequest(_) => "BadRequest",
            ProxyError::InvalidPod => "BadRequest",
            ProxyError::ChannelClosed => "ChannelClosed",
            ProxyError::Timeout => "Timeout",
            ProxyError::Agent { .. } => "AgentError",
            ProxyError::UnknownOpcode(_) => "BadRequest",
            ProxyError::Protocol(_) | ProxyError::Io(_) | ProxyError::Json(_) => "Internal",
        }
    }
}
