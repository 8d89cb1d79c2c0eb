use cradle_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("handoff failed: {0}")]
    Handoff(String),

    #[error("stream socketpair missing from handoff")]
    MissingStreamFd,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
