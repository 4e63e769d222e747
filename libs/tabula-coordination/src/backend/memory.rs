use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::backend::lock_recover;
use crate::error::CoordinationError;
use crate::instance::InstanceId;
use crate::lock::{CoordinationLock, lock_identifier};
use crate::service::{BoxFuture, CoordinationService};

/// Process-local coordination: locks and versions live in mutex-guarded
/// maps, and the instance list is just this server.
///
/// Correct for a single-node deployment and for tests that run several
/// reconcilers inside one process against a shared instance.
pub struct MemoryCoordinationService {
    instance_id: InstanceId,
    /// identifier → owner token
    locks: Mutex<HashMap<String, String>>,
    versions: Mutex<HashMap<String, i64>>,
    shutdown: CancellationToken,
}

impl MemoryCoordinationService {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            locks: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn ensure_open(&self) -> Result<(), CoordinationError> {
        if self.shutdown.is_cancelled() {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }

    fn try_lock_sync(&self, system: &str, collection: &str) -> Result<CoordinationLock, CoordinationError> {
        self.ensure_open()?;
        let identifier = lock_identifier(system, collection);
        let mut locks = lock_recover(&self.locks, "memory locks");
        match locks.entry(identifier) {
            Entry::Occupied(entry) => Err(CoordinationError::AlreadyLocked {
                identifier: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                let lock = CoordinationLock::issue(entry.key().clone(), self.instance_id.as_str());
                entry.insert(lock.token().to_string());
                Ok(lock)
            }
        }
    }
}

impl CoordinationService for MemoryCoordinationService {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn try_lock<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<CoordinationLock, CoordinationError>> {
        let result = self.try_lock_sync(system, collection);
        Box::pin(async move { result })
    }

    fn unlock<'a>(&'a self, lock: &'a CoordinationLock) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !lock.mark_released() {
                tracing::debug!(lock = %lock.identifier(), "lock already released");
                return;
            }
            let mut locks = lock_recover(&self.locks, "memory locks");
            match locks.get(lock.identifier()) {
                Some(token) if token == lock.token() => {
                    locks.remove(lock.identifier());
                }
                _ => tracing::debug!(lock = %lock.identifier(), "lock no longer owned, nothing to release"),
            }
        })
    }

    fn get_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>> {
        let result = self.ensure_open().map(|()| {
            let versions = lock_recover(&self.versions, "memory versions");
            versions
                .get(&lock_identifier(system, collection))
                .copied()
                .unwrap_or(0)
        });
        Box::pin(async move { result })
    }

    fn increment_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>> {
        let result = self.ensure_open().map(|()| {
            let mut versions = lock_recover(&self.versions, "memory versions");
            let version = versions.entry(lock_identifier(system, collection)).or_insert(0);
            *version += 1;
            *version
        });
        Box::pin(async move { result })
    }

    fn get_instances(&self) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        let result = self
            .ensure_open()
            .map(|()| vec![self.instance_id.to_string()]);
        Box::pin(async move { result })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CoordinationError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            let released = {
                let mut locks = lock_recover(&self.locks, "memory locks");
                let count = locks.len();
                locks.clear();
                count
            };
            tracing::info!(instance = %self.instance_id, released, "memory coordination closed");
            Ok(())
        })
    }
}
