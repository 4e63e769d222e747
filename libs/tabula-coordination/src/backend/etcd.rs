use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, PutOptions, Txn, TxnOp,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{lock_recover, run_cleanup};
use crate::config::EtcdConfig;
use crate::error::CoordinationError;
use crate::instance::InstanceId;
use crate::lock::{CoordinationLock, lock_identifier};
use crate::service::{BoxFuture, CoordinationService};
use crate::supervisor::{heartbeat_loop, spawn_supervised};

const LOCK_PREFIX: &str = "tabula/locks/";
const VERSION_PREFIX: &str = "tabula/versions/";
const INSTANCE_PREFIX: &str = "en_instance_";

// ═══════════════════════════════════════════════════════════════
//  EtcdCoordinationService
// ═══════════════════════════════════════════════════════════════

/// etcd-backed coordination.
///
/// Lock keys are bound to one session lease per service, kept alive by a
/// supervised task. If the process dies the lease expires and every lock it
/// held disappears with it.
pub struct EtcdCoordinationService {
    instance_id: InstanceId,
    client: Client,
    session_lease: Arc<AtomicI64>,
    heartbeat_lease: Arc<AtomicI64>,
    held: Mutex<HashMap<String, CoordinationLock>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EtcdCoordinationService {
    pub async fn connect(instance_id: InstanceId, config: &EtcdConfig) -> Result<Arc<Self>, CoordinationError> {
        if config.endpoints.is_empty() {
            return Err(CoordinationError::InvalidConfig("etcd endpoints are empty".into()));
        }
        let options = ConnectOptions::new().with_connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        let mut client = Client::connect(&config.endpoints, Some(options)).await?;

        let session = client.lease_grant(config.lock_lease_ttl_secs, None).await?;
        let service = Arc::new(Self {
            instance_id,
            client,
            session_lease: Arc::new(AtomicI64::new(session.id())),
            heartbeat_lease: Arc::new(AtomicI64::new(0)),
            held: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        write_heartbeat(
            service.client.clone(),
            service.instance_id.to_string(),
            service.heartbeat_lease.clone(),
            config.instance_ttl_secs,
        )
        .await?;

        let retry_delay = Duration::from_secs(config.retry_delay_secs);

        let keep_alive = spawn_supervised("etcd-session", service.shutdown.clone(), retry_delay, {
            let client = service.client.clone();
            let lease = service.session_lease.clone();
            let token = service.shutdown.clone();
            let ttl = config.lock_lease_ttl_secs;
            move || keep_session_alive(client.clone(), lease.clone(), ttl, token.clone())
        });

        let heartbeat = spawn_supervised("etcd-heartbeat", service.shutdown.clone(), retry_delay, {
            let client = service.client.clone();
            let instance = service.instance_id.to_string();
            let lease = service.heartbeat_lease.clone();
            let token = service.shutdown.clone();
            let interval = Duration::from_secs(config.heartbeat_interval_secs);
            let ttl = config.instance_ttl_secs;
            move || {
                let client = client.clone();
                let lease = lease.clone();
                let beat_instance = instance.clone();
                heartbeat_loop(instance.clone(), token.clone(), interval, retry_delay, move || {
                    Box::pin(write_heartbeat(client.clone(), beat_instance.clone(), lease.clone(), ttl))
                })
            }
        });

        lock_recover(&service.tasks, "etcd tasks").extend([keep_alive, heartbeat]);
        tracing::info!(
            instance = %service.instance_id,
            endpoints = ?config.endpoints,
            session_lease = session.id(),
            "etcd coordination connected"
        );
        Ok(service)
    }

    fn ensure_open(&self) -> Result<(), CoordinationError> {
        if self.shutdown.is_cancelled() {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }

    /// Delete the lock key if it still carries our token.
    async fn release(&self, lock: &CoordinationLock) -> Result<bool, CoordinationError> {
        let key = format!("{LOCK_PREFIX}{}", lock.identifier());
        let txn = Txn::new()
            .when(vec![Compare::value(key.as_str(), CompareOp::Equal, lock.token())])
            .and_then(vec![TxnOp::delete(key.as_str(), None)]);
        let mut client = self.client.clone();
        Ok(client.txn(txn).await?.succeeded())
    }
}

/// Renew the session lease every third of its TTL. Returns on any failure
/// so the supervisor can rebuild the stream. A lease that already expired is
/// replaced; locks held under it are gone.
async fn keep_session_alive(mut client: Client, lease: Arc<AtomicI64>, ttl: i64, token: CancellationToken) {
    let id = lease.load(Ordering::Acquire);
    let (mut keeper, mut stream) = match client.lease_keep_alive(id).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(lease = id, error = %e, "failed to open lease keep-alive");
            return;
        }
    };
    let period = Duration::from_secs((ttl / 3).max(1) as u64);

    loop {
        if let Err(e) = keeper.keep_alive().await {
            tracing::warn!(lease = id, error = %e, "lease keep-alive failed");
            return;
        }
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => tracing::trace!(lease = id, ttl = resp.ttl(), "lease renewed"),
            Ok(_) => {
                tracing::warn!(lease = id, "session lease expired, held locks are lost");
                match client.lease_grant(ttl, None).await {
                    Ok(fresh) => lease.store(fresh.id(), Ordering::Release),
                    Err(e) => tracing::warn!(error = %e, "failed to grant replacement session lease"),
                }
                return;
            }
            Err(e) => {
                tracing::warn!(lease = id, error = %e, "lease keep-alive stream failed");
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = token.cancelled() => return,
        }
    }
}

/// Put `en_instance_<id>` under a fresh lease, then revoke the previous one.
async fn write_heartbeat(
    mut client: Client,
    instance: String,
    lease: Arc<AtomicI64>,
    ttl: i64,
) -> Result<(), CoordinationError> {
    let fresh = client.lease_grant(ttl, None).await?.id();
    client
        .put(
            format!("{INSTANCE_PREFIX}{instance}"),
            chrono::Utc::now().to_rfc3339(),
            Some(PutOptions::new().with_lease(fresh)),
        )
        .await?;

    let previous = lease.swap(fresh, Ordering::AcqRel);
    if previous != 0 {
        if let Err(e) = client.lease_revoke(previous).await {
            tracing::debug!(lease = previous, error = %e, "failed to revoke previous heartbeat lease");
        }
    }
    Ok(())
}

impl CoordinationService for EtcdCoordinationService {
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
            let key = format!("{LOCK_PREFIX}{identifier}");
            let lease = self.session_lease.load(Ordering::Acquire);

            let txn = Txn::new()
                .when(vec![Compare::create_revision(key.as_str(), CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(
                    key.as_str(),
                    lock.token(),
                    Some(PutOptions::new().with_lease(lease)),
                )]);
            let mut client = self.client.clone();
            if !client.txn(txn).await?.succeeded() {
                return Err(CoordinationError::AlreadyLocked { identifier });
            }
            lock_recover(&self.held, "etcd held locks").insert(identifier, lock.clone());
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
                let mut held = lock_recover(&self.held, "etcd held locks");
                if held.get(lock.identifier()).is_some_and(|l| l.token() == lock.token()) {
                    held.remove(lock.identifier());
                }
            }
            match self.release(lock).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(lock = %lock.identifier(), "lock lease expired before release"),
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
            let key = format!("{VERSION_PREFIX}{}", lock_identifier(system, collection));
            let mut client = self.client.clone();
            let resp = client.get(key.as_str(), None).await?;
            match resp.kvs().first() {
                Some(kv) => parse_version(&key, kv.value_str()?),
                None => Ok(0),
            }
        })
    }

    fn increment_version<'a>(
        &'a self,
        system: &'a str,
        collection: &'a str,
    ) -> BoxFuture<'a, Result<i64, CoordinationError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let key = format!("{VERSION_PREFIX}{}", lock_identifier(system, collection));
            let mut client = self.client.clone();

            loop {
                let resp = client.get(key.as_str(), None).await?;
                let (current, guard) = match resp.kvs().first() {
                    Some(kv) => (
                        parse_version(&key, kv.value_str()?)?,
                        Compare::mod_revision(key.as_str(), CompareOp::Equal, kv.mod_revision()),
                    ),
                    None => (0, Compare::create_revision(key.as_str(), CompareOp::Equal, 0)),
                };
                let next = current + 1;
                let txn = Txn::new()
                    .when(vec![guard])
                    .and_then(vec![TxnOp::put(key.as_str(), next.to_string(), None)]);
                if client.txn(txn).await?.succeeded() {
                    return Ok(next);
                }
                tracing::trace!(%key, "version changed concurrently, retrying");
            }
        })
    }

    fn get_instances(&self) -> BoxFuture<'_, Result<Vec<String>, CoordinationError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut client = self.client.clone();
            let resp = client
                .get(INSTANCE_PREFIX, Some(GetOptions::new().with_prefix()))
                .await?;
            let mut instances = Vec::with_capacity(resp.kvs().len());
            for kv in resp.kvs() {
                if let Some(instance) = kv.key_str()?.strip_prefix(INSTANCE_PREFIX) {
                    instances.push(instance.to_string());
                }
            }
            instances.sort();
            Ok(instances)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), CoordinationError>> {
        Box::pin(async move {
            self.shutdown.cancel();
            let tasks: Vec<JoinHandle<()>> = lock_recover(&self.tasks, "etcd tasks").drain(..).collect();
            for task in tasks {
                let _ = task.await;
            }

            let held: Vec<CoordinationLock> = lock_recover(&self.held, "etcd held locks")
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

            let revokes = [
                ("session lease", self.session_lease.swap(0, Ordering::AcqRel)),
                ("heartbeat lease", self.heartbeat_lease.swap(0, Ordering::AcqRel)),
            ]
            .into_iter()
            .filter(|(_, lease)| *lease != 0)
            .map(|(what, lease)| {
                let mut client = self.client.clone();
                (format!("revoke {what} {lease}"), async move {
                    client.lease_revoke(lease).await.map(|_| ()).map_err(CoordinationError::from)
                })
            });
            run_cleanup("etcd", revokes).await;
            tracing::info!(instance = %self.instance_id, released = held.len(), "etcd coordination closed");
            Ok(())
        })
    }
}

fn parse_version(key: &str, raw: &str) -> Result<i64, CoordinationError> {
    raw.parse()
        .map_err(|e| CoordinationError::backend("etcd", format!("version at '{key}' is not an integer: {e}")))
}
