use std::fmt;

/// Every failure the session controller can surface to the presentation layer.
///
/// The `Display` output is the human-readable string stored in the
/// snapshot's `error` slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Could not obtain a session credential: {0}")]
    Credential(String),
    #[error("Voice connection failed: {0}")]
    Transport(String),
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Chat message could not be delivered: {0}")]
    Channel(String),
}

/// The coarse category of a `SessionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Credential,
    Transport,
    PermissionDenied,
    Channel,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Credential => write!(f, "credential"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::PermissionDenied => write!(f, "permission_denied"),
            ErrorKind::Channel => write!(f, "channel"),
        }
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Credential(_) => ErrorKind::Credential,
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SessionError::Channel(_) => ErrorKind::Channel,
        }
    }
}
