use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::CoordinationError;
use crate::service::CoordinationService;

/// Hard upper bound on how long [`CoordinationService::lock`] waits.
pub const LOCK_DEADLINE: Duration = Duration::from_secs(120);

/// Backend key for a `(system, collection)` pair.
pub fn lock_identifier(system: &str, collection: &str) -> String {
    format!("{system}_{collection}")
}

/// A held lock.
///
/// Only produced by a [`CoordinationService`]. Cheap to clone and safe to
/// move to another task. Clones share the released flag, so releasing any
/// of them releases all.
#[derive(Debug, Clone)]
pub struct CoordinationLock {
    identifier: String,
    /// Owner token stored in the backend; release only succeeds if it matches.
    token: String,
    released: Arc<AtomicBool>,
}

impl CoordinationLock {
    pub(crate) fn new(identifier: String, token: String) -> Self {
        Self {
            identifier,
            token,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fresh lock for `identifier` with a unique owner token.
    pub(crate) fn issue(identifier: String, owner: &str) -> Self {
        let token = format!("{owner}:{}", uuid::Uuid::new_v4().simple());
        Self::new(identifier, token)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Flip to released. `true` only for the first caller.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

/// Take the lock by retrying [`CoordinationService::try_lock`] with
/// exponential backoff while it reports contention, for at most `deadline`.
///
/// Any other error ends the wait immediately.
pub async fn acquire_with_retry<S>(
    service: &S,
    system: &str,
    collection: &str,
    deadline: Duration,
) -> Result<CoordinationLock, CoordinationError>
where
    S: CoordinationService + ?Sized,
{
    let policy = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(1))
        .with_jitter()
        .with_max_times(usize::MAX);

    let attempt = (|| service.try_lock(system, collection))
        .retry(policy)
        .when(CoordinationError::is_already_locked)
        .notify(|_, dur| {
            tracing::trace!(system, collection, "lock busy, retrying in {:.2}s", dur.as_secs_f32());
        });

    match tokio::time::timeout(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(CoordinationError::LockTimeout {
            identifier: lock_identifier(system, collection),
            waited: deadline,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_joins_system_and_collection() {
        assert_eq!(lock_identifier("dest1", "events"), "dest1_events");
    }

    #[test]
    fn release_flag_is_shared_and_flips_once() {
        let lock = CoordinationLock::issue("dest1_events".into(), "node-1");
        let clone = lock.clone();

        assert!(lock.token().starts_with("node-1:"));
        assert!(clone.mark_released());
        assert!(!lock.mark_released());
        assert!(lock.is_released());
    }
}
