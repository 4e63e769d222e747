//! Behavioural contract every coordination backend satisfies.
//!
//! The in-memory backend always runs. Redis and etcd run with
//! `cargo test -- --ignored` once `TABULA_TEST_REDIS_URL` or
//! `TABULA_TEST_ETCD_ENDPOINTS` points at a live server.

use std::sync::Arc;
use std::time::Duration;

use tabula_coordination::{CoordinationError, CoordinationService, InstanceId, MemoryCoordinationService};

type Service = Arc<dyn CoordinationService>;

/// Unique system name so runs against a shared server don't collide.
fn system() -> String {
    format!("contract-{}", uuid::Uuid::new_v4().simple())
}

async fn try_lock_fails_fast_when_held(svc: Service) {
    //* Given
    let system = system();
    let held = svc.try_lock(&system, "events").await.expect("first try_lock");

    //* When
    let contender = tokio::spawn({
        let svc = svc.clone();
        let system = system.clone();
        async move {
            tokio::time::timeout(Duration::from_millis(500), svc.try_lock(&system, "events")).await
        }
    });
    let result = contender.await.expect("task joins");

    //* Then
    let outcome = result.expect("try_lock returned within the time budget");
    assert!(
        matches!(outcome, Err(CoordinationError::AlreadyLocked { .. })),
        "expected AlreadyLocked, got {outcome:?}"
    );
    svc.unlock(&held).await;
}

async fn lock_waits_for_release(svc: Service) {
    //* Given
    let system = system();
    let held = svc.lock(&system, "events").await.expect("first lock");

    //* When
    let waiter = tokio::spawn({
        let svc = svc.clone();
        let system = system.clone();
        async move { svc.lock(&system, "events").await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    let finished_early = waiter.is_finished();
    svc.unlock(&held).await;
    let second = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .expect("waiter acquires after release")
        .expect("task joins")
        .expect("lock succeeds");

    //* Then
    assert!(!finished_early, "lock must block while the key is held");
    assert_eq!(second.identifier(), format!("{system}_events"));
    svc.unlock(&second).await;
}

async fn version_increments_are_atomic(svc: Service, first: usize, second: usize) {
    //* Given
    let system = system();
    assert_eq!(svc.get_version(&system, "events").await.expect("get_version"), 0);

    //* When
    let spawn_writer = |n: usize| {
        let svc = svc.clone();
        let system = system.clone();
        tokio::spawn(async move {
            for _ in 0..n {
                svc.increment_version(&system, "events").await.expect("increment");
            }
        })
    };
    let a = spawn_writer(first);
    let b = spawn_writer(second);
    a.await.expect("writer a");
    b.await.expect("writer b");

    //* Then
    let version = svc.get_version(&system, "events").await.expect("get_version");
    assert_eq!(version, (first + second) as i64);
}

async fn is_locked_does_not_take_the_lock(svc: Service) {
    //* Given
    let system = system();

    //* When
    let free = svc.is_locked(&system, "events").await.expect("is_locked");
    let held = svc.try_lock(&system, "events").await.expect("try_lock after is_locked");
    let busy = svc.is_locked(&system, "events").await.expect("is_locked");
    svc.unlock(&held).await;
    let free_again = svc.is_locked(&system, "events").await.expect("is_locked");

    //* Then
    assert!(!free);
    assert!(busy);
    assert!(!free_again);
}

async fn unlock_is_idempotent_across_tasks(svc: Service) {
    //* Given
    let system = system();
    let lock = svc.try_lock(&system, "events").await.expect("try_lock");

    //* When
    let releaser = tokio::spawn({
        let svc = svc.clone();
        let lock = lock.clone();
        async move { svc.unlock(&lock).await }
    });
    releaser.await.expect("release from another task");
    svc.unlock(&lock).await;

    //* Then
    assert!(lock.is_released());
    let again = svc.try_lock(&system, "events").await.expect("key is free again");
    svc.unlock(&again).await;
}

async fn keys_are_independent(svc: Service) {
    //* Given
    let system = system();
    let events = svc.try_lock(&system, "events").await.expect("events lock");

    //* When
    let users = svc.try_lock(&system, "users").await;
    svc.increment_version(&system, "events").await.expect("increment");

    //* Then
    let users = users.expect("a different table is not blocked");
    assert_eq!(svc.get_version(&system, "users").await.expect("get_version"), 0);
    svc.unlock(&users).await;
    svc.unlock(&events).await;
}

async fn instances_include_self(svc: Service) {
    let instances = svc.get_instances().await.expect("get_instances");
    assert!(
        instances.iter().any(|i| i == svc.instance_id().as_str()),
        "{instances:?} lacks {}",
        svc.instance_id()
    );
}

async fn run_contract(svc: Service, increments: (usize, usize)) {
    try_lock_fails_fast_when_held(svc.clone()).await;
    lock_waits_for_release(svc.clone()).await;
    version_increments_are_atomic(svc.clone(), increments.0, increments.1).await;
    is_locked_does_not_take_the_lock(svc.clone()).await;
    unlock_is_idempotent_across_tasks(svc.clone()).await;
    keys_are_independent(svc.clone()).await;
    instances_include_self(svc.clone()).await;
    svc.close().await.expect("close");
}

// ═══════════════════════════════════════════════════════════════
//  In-memory
// ═══════════════════════════════════════════════════════════════

fn memory() -> Service {
    Arc::new(MemoryCoordinationService::new(
        InstanceId::new("contract-node").expect("valid id"),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_try_lock_fails_fast_when_held() {
    try_lock_fails_fast_when_held(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_lock_waits_for_release() {
    lock_waits_for_release(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_version_increments_are_atomic() {
    version_increments_are_atomic(memory(), 10_000, 4_000).await;
}

#[tokio::test]
async fn memory_is_locked_does_not_take_the_lock() {
    is_locked_does_not_take_the_lock(memory()).await;
}

#[tokio::test]
async fn memory_unlock_is_idempotent_across_tasks() {
    unlock_is_idempotent_across_tasks(memory()).await;
}

#[tokio::test]
async fn memory_keys_are_independent() {
    keys_are_independent(memory()).await;
}

#[tokio::test]
async fn memory_instances_include_self() {
    instances_include_self(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_lock_times_out_while_held() {
    //* Given
    let svc = memory();
    let held = svc.try_lock("dest", "events").await.expect("try_lock");

    //* When
    let result = tabula_coordination::acquire_with_retry(
        svc.as_ref(),
        "dest",
        "events",
        Duration::from_millis(300),
    )
    .await;

    //* Then
    assert!(matches!(result, Err(CoordinationError::LockTimeout { .. })));
    assert!(result.as_ref().is_err_and(CoordinationError::is_transient));
    svc.unlock(&held).await;
}

// ═══════════════════════════════════════════════════════════════
//  Redis
// ═══════════════════════════════════════════════════════════════

#[cfg(feature = "redis")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs a redis server in TABULA_TEST_REDIS_URL"]
async fn redis_contract() {
    let url = std::env::var("TABULA_TEST_REDIS_URL").expect("TABULA_TEST_REDIS_URL is set");
    let config: tabula_coordination::RedisConfig =
        toml::from_str(&format!("url = {url:?}")).expect("valid redis config");
    let svc = tabula_coordination::RedisCoordinationService::connect(InstanceId::random(), &config)
        .await
        .expect("redis connects");
    run_contract(svc, (500, 200)).await;
}

// ═══════════════════════════════════════════════════════════════
//  etcd
// ═══════════════════════════════════════════════════════════════

#[cfg(feature = "etcd")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "needs an etcd cluster in TABULA_TEST_ETCD_ENDPOINTS"]
async fn etcd_contract() {
    let endpoints = std::env::var("TABULA_TEST_ETCD_ENDPOINTS").expect("TABULA_TEST_ETCD_ENDPOINTS is set");
    let endpoints: Vec<String> = endpoints.split(',').map(|e| e.trim().to_string()).collect();
    let config: tabula_coordination::EtcdConfig =
        toml::from_str(&format!("endpoints = {endpoints:?}")).expect("valid etcd config");
    let svc = tabula_coordination::EtcdCoordinationService::connect(InstanceId::random(), &config)
        .await
        .expect("etcd connects");
    run_contract(svc, (200, 100)).await;
}

#[tokio::test]
async fn memory_full_contract() {
    run_contract(memory(), (100, 40)).await;
}
