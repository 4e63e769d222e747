use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{lock_recover, run_cleanup};
use crate::config::RedisConfig;
use crate::error::CoordinationError;
use crate::instance::InstanceId;
use crate::lock::{CoordinationLock, lock_identifier};
use crate::service::{BoxFuture, CoordinationService};
use crate::supervisor::{heartbeat_loop, spawn_supervised};

const MUTEX_PREFIX: &str = "coordination:mutex#";
const VERSIONS_KEY: &str = "systems:versions";
const HEARTBEAT_KEY: &str = "cluster:heartbeat";

/// Delete the mutex key only if it still carries our owner token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

// ═══════════════════════════════════════════════════════════════
//  RedisCoordinationService
// ═══════════════════════════════════════════════════════════════

/// Redis-backed coordination.
///
/// - mutex: `SET coordination:mutex#<system>_<collection> <token> NX PX <expiry>`
/// - versions: `HINCRBY systems:versions <system>_<collection> 1`
/// - liveness: `HSET cluster:heartbeat <instance> <rfc3339>` every heartbeat interval
pub struct RedisCoordinationService {
    instance_id: InstanceId,
    conn: ConnectionManager,
    lock_expiry: Duration,
    instance_ttl: Duration,
    /// identifier → lock, for release on close.
    held: Mutex<HashMap<String, CoordinationLock>>,
    shutdown: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RedisCoordinationService {
    /// Connect, write the first heartbeat and start the heartbeat loop.
    pub async fn connect(instance_id: InstanceId, config: &RedisConfig) -> Result<Arc<Self>, CoordinationError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| CoordinationError::InvalidConfig(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client).await?;

        let service = Arc::new(Self {
            instance_id,
            conn,
            lock_expiry: Duration::from_secs(config.lock_expiry_secs),
            instance_ttl: Duration::from_secs(config.instance_ttl_secs),
            held: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            heartbeat: Mutex::new(None),
        });

        service.beat().await?;

        let handle = spawn_supervised(
            "redis-heartbeat",
            service.shutdown.clone(),
            Duration::from_secs(config.retry_delay_secs),
            {
                let conn = service.conn.clone();
                let instance = service.instance_id.to_string();
                let token = service.shutdown.clone();
                let interval = Duration::from_secs(config.heartbeat_interval_secs);
                let retry_delay = Duration::from_secs(config.retry_delay_secs);
                move || {
                    let conn = conn.clone();
                    let instance = instance.clone();
                    heartbeat_loop(instance.clone(), token.clone(), interval, retry_delay, move || {
                        let mut conn = conn.clone();
                        let instance = instance.clone();
                        Box::pin(async move { write_heartbeat(&mut conn, &instance).await })
                    })
                }
            },
        );
        *lock_recover(&service.heartbeat, "redis heartbeat") = Some(handle);

        tracing::info!(instance = %service.instance_id, url = %config.url, "redis coordination connected");
        Ok(service)
    }

    async fn beat(&self) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        write_heartbeat(&mut conn, self.instance_id.as_str()).await
    }

    fn ensure_open(&self) -> Result<(), CoordinationError> {
        if self.shutdown.is_cancelled() {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }

    async fn release(&self, lock: &CoordinationLock) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(format!("{MUTEX_PREFIX}{}", lock.identifier()))
            .arg(lock.token())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

async fn write_heartbeat(conn: &mut ConnectionManager, instance: &str) -> Result<(), CoordinationError> {
    let now = chrono::Utc::now().to_rfc3339();
    let _: () = conn.hset(HEARTBEAT_KEY, instance, now).await?;
    Ok(())
}

impl CoordinationService for RedisCoordinationService {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    fn try_lock<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<CoordinationLock, CoordinationError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let identifier = lock_identifier(system, collection);
            let lock = CoordinationLock::issue(identifier.clone(), self.instance_id.as_str());

            let mut conn = self.conn.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(format!("{MUTEX_PREFIX}{identifier}"))
                .arg(lock.token())
                .arg("NX")
                .arg("PX")
                .arg(self.lock_expiry.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if reply.is_none() {
                return Err(CoordinationError::AlreadyLocked { identifier });
            }
            lock_recover(&self.held, "redis held locks").insert(identifier, lock.clone());
            Ok(lock)
        })
    }

    fn unlock<'a>(&'a self, lock: &'a CoordinationLock) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !lock.mark_released() {
                tracing::debug!(lock = %lock.identifier(), "lock already released");
                return;
            }
            {
                let mut held = lock_recover(&self.held, "redis held locks");
                if held.get(lock.identifier()).is_some_and(|l| l.token() == lock.token()) {
                    held.remove(lock.identifier());
                }
            }
            match self.release(lock).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(lock = %lock.identifier(), "lock expired before release"),
                Err(e) => tracing::error!(lock = %lock.identifier(), error = %e, "failed to release lock"),
            }
        })
    }

    fn get_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut conn = self.conn.clone();
            let version: Option<i64> = conn
                .hget(VERSIONS_KEY, lock_identifier(system, collection))
                .await?;
            Ok(version.unwrap_or(0))
        })
    }

    fn increment_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut conn = self.conn.clone();
            let version: i64 = conn
                .hincr(VERSIONS_KEY, lock_identifier(system, collection), 1_i64)
                .await?;
            Ok(version)
        })
    }

    fn get_instances(&self) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut conn = self.conn.clone();
            let entries: HashMap<String, String> = conn.hgetall(HEARTBEAT_KEY).await?;
            let cutoff = chrono::Utc::now() - chrono::Duration::seconds(self.instance_ttl.as_secs() as i64);

            let mut instances: Vec<String> = entries
                .into_iter()
                .filter_map(|(instance, last_seen)| {
                    match chrono::DateTime::parse_from_rfc3339(&last_seen) {
                        Ok(ts) if ts >= cutoff => Some(instance),
                        Ok(_) => None,
                        Err(e) => {
                            tracing::debug!(%instance, %last_seen, error = %e, "unparseable heartbeat");
                            None
                        }
                    }
                })
                .collect();
            instances.sort();
            Ok(instances)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CoordinationError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            let heartbeat = lock_recover(&self.heartbeat, "redis heartbeat").take();
            if let Some(handle) = heartbeat {
                let _ = handle.await;
            }

            let held: Vec<CoordinationLock> = lock_recover(&self.held, "redis held locks")
                .drain()
                .map(|(_, lock)| lock)
                .collect();
            for lock in &held {
                if lock.mark_released() {
                    if let Err(e) = self.release(lock).await {
                        tracing::error!(lock = %lock.identifier(), error = %e, "failed to release lock on close");
                    }
                }
            }

            let mut conn = self.conn.clone();
            let deregister = async move {
                let _: () = conn.hdel(HEARTBEAT_KEY, self.instance_id.as_str()).await?;
                Ok::<(), CoordinationError>(())
            };
            run_cleanup("redis", [("remove heartbeat entry".to_string(), deregister)]).await;
            tracing::info!(instance = %self.instance_id, released = held.len(), "redis coordination closed");
            Ok(())
        })
    }
}
