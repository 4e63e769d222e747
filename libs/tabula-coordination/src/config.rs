use std::sync::Arc;

use serde::Deserialize;

use crate::backend::MemoryCoordinationService;
use crate::error::CoordinationError;
use crate::instance::InstanceId;
use crate::service::CoordinationService;

/// `[coordination]` section of the server config.
///
/// ```toml
/// [coordination]
/// type = "redis"
/// url = "redis://127.0.0.1:6379"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationConfig {
    #[default]
    Memory,
    Etcd(EtcdConfig),
    Redis(RedisConfig),
}

impl CoordinationConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            CoordinationConfig::Memory => "memory",
            CoordinationConfig::Etcd(_) => "etcd",
            CoordinationConfig::Redis(_) => "redis",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// TTL of the session lease every lock key is bound to.
    #[serde(default = "default_lock_lease_ttl")]
    pub lock_lease_ttl_secs: i64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Lease TTL of the `en_instance_<id>` liveness key.
    #[serde(default = "default_instance_ttl_i64")]
    pub instance_ttl_secs: i64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    /// Expiry of the mutex key; bounds how long a crashed holder blocks others.
    #[serde(default = "default_lock_expiry")]
    pub lock_expiry_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeats older than this are not reported by `get_instances`.
    #[serde(default = "default_instance_ttl")]
    pub instance_ttl_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_connect_timeout() -> u64 {
    5
}
fn default_lock_lease_ttl() -> i64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    90
}
fn default_instance_ttl() -> u64 {
    120
}
fn default_instance_ttl_i64() -> i64 {
    120
}
fn default_retry_delay() -> u64 {
    10
}
fn default_lock_expiry() -> u64 {
    3 * 60 * 60
}

/// Build the configured backend. Distributed backends connect, register
/// this instance and start their heartbeat before returning.
pub async fn connect(
    config: &CoordinationConfig,
    instance_id: InstanceId,
) -> Result<Arc<dyn CoordinationService>, CoordinationError> {
    tracing::info!(backend = config.backend_name(), instance = %instance_id, "connecting coordination service");
    match config {
        CoordinationConfig::Memory => Ok(Arc::new(MemoryCoordinationService::new(instance_id))),

        #[cfg(feature = "etcd")]
        CoordinationConfig::Etcd(etcd) => {
            let service: Arc<dyn CoordinationService> =
                crate::backend::EtcdCoordinationService::connect(instance_id, etcd).await?;
            Ok(service)
        }
        #[cfg(not(feature = "etcd"))]
        CoordinationConfig::Etcd(_) => Err(CoordinationError::InvalidConfig(
            "etcd backend requested but the `etcd` feature is disabled".into(),
        )),

        #[cfg(feature = "redis")]
        CoordinationConfig::Redis(redis) => {
            let service: Arc<dyn CoordinationService> =
                crate::backend::RedisCoordinationService::connect(instance_id, redis).await?;
            Ok(service)
        }
        #[cfg(not(feature = "redis"))]
        CoordinationConfig::Redis(_) => Err(CoordinationError::InvalidConfig(
            "redis backend requested but the `redis` feature is disabled".into(),
        )),
    }
}
