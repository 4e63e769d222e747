use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The resource is held by someone else, possibly another task of this
    /// process. Expected under contention, not a failure.
    #[error("'{identifier}' is already locked")]
    AlreadyLocked { identifier: String },

    #[error("timed out after {waited:?} waiting for lock '{identifier}'")]
    LockTimeout { identifier: String, waited: Duration },

    #[error("coordination service is closed")]
    Closed,

    #[error("{backend}: {message}")]
    Backend { backend: &'static str, message: String },

    #[error("invalid coordination config: {0}")]
    InvalidConfig(String),
}

impl CoordinationError {
    pub fn backend(backend: &'static str, message: impl std::fmt::Display) -> Self {
        CoordinationError::Backend {
            backend,
            message: message.to_string(),
        }
    }

    pub fn is_already_locked(&self) -> bool {
        matches!(self, CoordinationError::AlreadyLocked { .. })
    }

    /// Backend hiccups and lock timeouts clear up on their own; callers
    /// retry the outer operation instead of failing hard.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::Backend { .. } | CoordinationError::LockTimeout { .. }
        )
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CoordinationError {
    fn from(e: redis::RedisError) -> Self {
        CoordinationError::backend("redis", e)
    }
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for CoordinationError {
    fn from(e: etcd_client::Error) -> Self {
        CoordinationError::backend("etcd", e)
    }
}
