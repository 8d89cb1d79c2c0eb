use cradle_protocol::ProtocolError;
use thiserror::Error;

/// Error taxonomy for the runtime. Every user-visible failure is one line
/// prefixed by its kind; the kind also fixes the process exit code.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("BadRequest: {0}")]
    BadRequest(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("PreconditionFailed: {0}")]
    PreconditionFailed(String),

    #[error("AgentError: {0}")]
    Agent(String),

    #[error("ChannelClosed: {0}")]
    ChannelClosed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("HypervisorError: {0}")]
    Hypervisor(String),

    #[error("HookError: {0}")]
    Hook(String),

    #[error("Internal: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeError::BadRequest(_) => 1,
            RuntimeError::NotFound(_) => 2,
            RuntimeError::Conflict(_) => 3,
            RuntimeError::PreconditionFailed(_) => 4,
            RuntimeError::Agent(_) => 5,
            RuntimeError::ChannelClosed(_) => 6,
            RuntimeError::Timeout(_) => 7,
            RuntimeError::Hypervisor(_) => 8,
            RuntimeError::Hook(_) => 9,
            RuntimeError::Internal(_) => 10,
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Internal(e.to_string())
    }
}

impl From<ProtocolError> for RuntimeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            // Proxy-side errors come back tagged with their kind.
            ProtocolError::Remote { kind, message } => match kind.as_str() {
                "BadRequest" => RuntimeError::BadRequest(message),
                "NotFound" => RuntimeError::NotFound(message),
                "Conflict" => RuntimeError::Conflict(message),
                "AgentError" => RuntimeError::Agent(message),
                "ChannelClosed" => RuntimeError::ChannelClosed(message),
                "Timeout" => RuntimeError::Timeout(message),
                _ => RuntimeError::Internal(message),
            },
            ProtocolError::ChannelClosed => {
                RuntimeError::ChannelClosed("proxy connection closed".to_string())
            }
            other => RuntimeError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_kind_prefixed() {
        let e = RuntimeError::NotFound("container x does not exist".to_string());
        assert_eq!(e.to_string(), "NotFound: container x does not exist");
    }

    #[test]
    fn test_remote_kind_maps_back_into_taxonomy() {
        let remote = ProtocolError::Remote {
            kind: "Conflict".to_string(),
            message: "vm token already registered: v".to_string(),
        };
        let e: RuntimeError = remote.into();
        assert!(matches!(e, RuntimeError::Conflict(_)));
        assert_eq!(e.exit_code(), 3);
    }
}
