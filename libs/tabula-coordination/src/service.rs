use std::future::Future;
use std::pin::Pin;

use crate::error::CoordinationError;
use crate::instance::InstanceId;
use crate::lock::{CoordinationLock, LOCK_DEADLINE, acquire_with_retry};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Coordination backend trait.
///
/// Lock keys are `"<system>_<collection>"`: typically a destination id and a
/// table name. The state of a key is either free or held by exactly one
/// owner. A crashed owner's lock is freed by backend-side lease expiry.
pub trait CoordinationService: Send + Sync {
    /// Identifier this service registers in the liveness directory.
    fn instance_id(&self) -> &InstanceId;

    /// Attempt once. Returns [`CoordinationError::AlreadyLocked`] right away
    /// if anyone holds the key, including another task of this process.
    fn try_lock<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<CoordinationLock, CoordinationError>>;

    /// Wait until the key is free, then take it. Gives up after
    /// [`LOCK_DEADLINE`] with [`CoordinationError::LockTimeout`].
    fn lock<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<CoordinationLock, CoordinationError>> {
        Box::pin(acquire_with_retry(self, system, collection, LOCK_DEADLINE))
    }

    /// Release `lock`. May be called from any task and more than once; only
    /// the first call has an effect. Backend failures are logged, not raised.
    fn unlock<'a>(&'a self, lock: &'a CoordinationLock) -> BoxFuture<'a, ()>;

    /// Whether anyone holds the key right now. Never blocks.
    fn is_locked<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<bool, CoordinationError>> {
        Box::pin(async move {
            match self.try_lock(system, collection).await {
                Ok(lock) => {
                    self.unlock(&lock).await;
                    Ok(false)
                }
                Err(e) if e.is_already_locked() => Ok(true),
                Err(e) => Err(e),
            }
        })
    }

    /// Current value of the per-key version counter (0 if never bumped).
    fn get_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>>;

    /// Atomically bump the per-key version counter, returning the new value.
    fn increment_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>>;

    /// Instances whose heartbeat is fresh.
    fn get_instances(&self) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>>;

    /// Stop background loops and release every lock this service still
    /// holds. Operations after `close` fail with [`CoordinationError::Closed`].
    fn close(&self) -> BoxFuture<'_, Result<(), CoordinationError>>;
}
