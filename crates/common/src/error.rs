use thiserror::Error;

/// Common error type for peerchat
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Domain(#[from] crate::DomainError),

    #[error("Connection timeout")]
    Timeout,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Identity rejected: {0}")]
    IdentityRejected(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for peerchat operations
pub type Result<T, E = ChatError> = std::result::Result<T, E>;

impl ChatError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Faults that only end the current connection.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Protocol(_) | Self::Timeout | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ChatError::network("reset").is_transient());
        assert!(ChatError::Timeout.is_transient());
        assert!(!ChatError::storage("disk full").is_transient());
        assert!(!ChatError::UserNotFound("bob".into()).is_transient());
    }
}
