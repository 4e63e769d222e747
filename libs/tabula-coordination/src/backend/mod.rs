mod memory;
#[cfg(feature = "etcd")]
mod etcd;
#[cfg(feature = "redis")]
mod redis;

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use crate::error::CoordinationError;

pub use memory::MemoryCoordinationService;
#[cfg(feature = "etcd")]
pub use self::etcd::EtcdCoordinationService;
#[cfg(feature = "redis")]
pub use self::redis::RedisCoordinationService;

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// The guarded maps stay consistent across a panic because every update
/// is a single insert or remove.
pub(crate) fn lock_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("{what} mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Run every cleanup step of `close()` in order. A failed step is logged
/// and the rest still run. Returns the number of failed steps.
pub(crate) async fn run_cleanup<I, F>(backend: &str, steps: I) -> usize
where
    I: IntoIterator<Item = (String, F)>,
    F: Future<Output = Result<(), CoordinationError>>,
{
    let mut failed = 0;
    for (step, fut) in steps {
        if let Err(e) = fut.await {
            tracing::error!(backend, step = %step, error = %e, "cleanup step failed on close");
            failed += 1;
        }
    }
    failed
}
