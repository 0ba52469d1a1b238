//! Error taxonomy for a session.
//!
//! Only [`ConfigError`] is fatal: it surfaces from session construction,
//! before any worker thread exists. Everything that can go wrong while a
//! session runs is folded into the stop path instead.

/// Returned by a blocking dequeue when its cancellation token fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task kind '{kind}': min_threads {min} exceeds max_threads {max}")]
    InvalidBounds { kind: String, min: u32, max: u32 },

    #[error("task kind '{kind}': threads {init} outside [{min}, {max}]")]
    InitOutOfBounds {
        kind: String,
        init: u32,
        min: u32,
        max: u32,
    },

    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("unknown observer '{0}'")]
    UnknownObserver(String),

    #[error("duplicate task kind '{0}'")]
    DuplicateKind(String),

    #[error("no strategy specified with a non-zero thread count")]
    NoStrategy,

    #[error("{0} threads are configured but no {0} factory is registered")]
    MissingFactory(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("task pool is shut down")]
    ShutDown,

    #[error("failed to spawn worker thread for '{kind}': {source}")]
    Spawn {
        kind: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TerminationError {
    #[error("termination was already seeded")]
    AlreadySeeded,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("termination error: {0}")]
    Termination(#[from] TerminationError),
}

/// Why a task body returned.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The worker was asked to stop while waiting for work.
    #[error("task cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let e = ConfigError::InvalidBounds {
            kind: "diver".into(),
            min: 4,
            max: 2,
        };
        assert!(e.to_string().contains("min_threads 4 exceeds max_threads 2"));
        assert_eq!(
            ConfigError::MissingFactory("surfer".into()).to_string(),
            "surfer threads are configured but no surfer factory is registered"
        );
    }

    #[test]
    fn test_cancelled_converts_to_task_error() {
        fn dequeue() -> Result<(), Cancelled> {
            Err(Cancelled)
        }
        fn body() -> Result<(), TaskError> {
            dequeue()?;
            Ok(())
        }
        assert!(matches!(body(), Err(TaskError::Cancelled)));
    }
}
