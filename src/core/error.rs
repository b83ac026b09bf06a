//! Error types for the change pipeline

/// Errors returned synchronously by `Endpoint` calls.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// No node at the given path
    #[error("Node not found: {0}")]
    NotFound(String),

    /// A node already exists at the given path
    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    /// The path cannot be addressed by this backend
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The backend cannot be reached
    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the underlying change-notification mechanism.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to start watching {root}: {reason}")]
    Setup { root: String, reason: String },

    #[error("Watch backend error: {0}")]
    Backend(String),

    #[error("Watch stream disconnected")]
    Disconnected,
}

/// Why a supervised worker stopped running.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Worker exited unexpectedly")]
    Exited,
}

/// Errors surfaced by a `Target` to its consumer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    #[error("Target is already serving")]
    AlreadyServing,

    #[error("Watch failed on {root}: {source}")]
    Watch { root: String, source: WatchError },

    #[error("Worker {worker} on {root} gave up after {restarts} restarts: {reason}")]
    WorkerFailed {
        root: String,
        worker: String,
        restarts: usize,
        reason: String,
    },
}

pub type EndpointResult<T> = std::result::Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(EndpointError::NotFound("a/b".into()).to_string(), "Node not found: a/b");
        assert_eq!(WatchError::Disconnected.to_string(), "Watch stream disconnected");

        let err = TargetError::Watch {
            root: "docs".into(),
            source: WatchError::Backend("inotify limit reached".into()),
        };
        assert_eq!(err.to_string(), "Watch failed on docs: Watch backend error: inotify limit reached");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EndpointError = io.into();
        assert!(matches!(err, EndpointError::Io(_)));
    }
}
