#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Transport failure: {0}")]
    Transport(#[from] russh::Error),
    #[error("Authentication rejected")]
    Auth,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("User '{0}' not found")]
    UserNotFound(String),
    #[error("'{0}' is not supported on this platform")]
    PlatformUnsupported(&'static str),
    #[error("Malformed request payload: {0}")]
    ProtocolViolation(String),
    #[error("Resource unavailable: {0}")]
    Resource(String),
    #[error("Interrupted by cancellation")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No host key could be loaded")]
    NoHostKeys,
    #[error("Invalid uid/gid for user '{0}'")]
    InvalidCredentials(String),
    #[error("Server is not listening")]
    NotListening,
    #[error("Teardown finished with errors: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

impl ServerError {
    /// Whether this error ends the whole SSH connection, as opposed to a
    /// single request or channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Transport(_) | ServerError::Auth)
    }
}
