//! Distributed mutual exclusion, version counters and a live-instance
//! directory shared by every server in a fleet.
//!
//! One [`CoordinationService`] is built at startup (see [`connect`]) and
//! handed to everything that issues DDL. Backends:
//! - [`MemoryCoordinationService`]: process-local, for tests and single-node deployments
//! - `RedisCoordinationService` (feature `redis`)
//! - `EtcdCoordinationService` (feature `etcd`)

pub mod backend;
pub mod config;
pub mod error;
pub mod instance;
pub mod lock;
pub mod service;
pub mod supervisor;

pub use backend::MemoryCoordinationService;
#[cfg(feature = "etcd")]
pub use backend::EtcdCoordinationService;
#[cfg(feature = "redis")]
pub use backend::RedisCoordinationService;
pub use config::{CoordinationConfig, EtcdConfig, RedisConfig, connect};
pub use error::CoordinationError;
pub use instance::InstanceId;
pub use lock::{CoordinationLock, LOCK_DEADLINE, acquire_with_retry, lock_identifier};
pub use service::{BoxFuture, CoordinationService};
