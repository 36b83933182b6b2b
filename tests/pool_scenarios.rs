//! End-to-end pool scenarios (see spec §8): empty-pool spawn, capacity
//! contention, cross-group eviction, and sticky-session fairness.
//!
//! These drive the real [`Pool`]/[`Group`] admission and spawn-loop logic
//! against a [`TestSpawner`] that launches a trivial long-lived child
//! process (so `Process::os_process_exists` and friends see a real pid)
//! instead of execing an actual application server.

use apppool::{
    GroupOptions, Pool, PoolConfig, ProcessSocket, SocketProtocol, Spawner, SpawnedProcess,
};
use std::{
    fs,
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::process::Command;

/// Spawns a real (but idle) child process per call, so each `Process` has a
/// genuine pid to probe, and hands back a socket descriptor the caller
/// configured up front.
struct TestSpawner {
    concurrency: i64,
    spawned: Arc<AtomicU32>,
}

impl TestSpawner {
    fn new(concurrency: i64) -> Self {
        Self {
            concurrency,
            spawned: Arc::new(AtomicU32::new(0)),
        }
    }

    fn spawn_count(&self) -> u32 {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Spawner for TestSpawner {
    fn spawn(
        &self,
        options: &GroupOptions,
    ) -> impl Future<Output = Result<SpawnedProcess, apppool::PoolError>> + Send {
        let concurrency = self.concurrency;
        let group_name = options.app_group_name.clone();
        let spawned = Arc::clone(&self.spawned);
        async move {
            let child = Command::new("sleep")
                .arg("3600")
                .kill_on_drop(false)
                .spawn()
                .map_err(|source| apppool::PoolError::Spawn {
                    group: group_name.clone(),
                    source,
                })?;
            let pid = child.id().ok_or_else(|| apppool::PoolError::Spawn {
                group: group_name.clone(),
                source: std::io::Error::other("test child exited immediately"),
            })?;
            let sockets = vec![ProcessSocket::new(
                format!("unix:/tmp/apppool-test-{pid}.sock"),
                SocketProtocol::Session,
                concurrency,
            )];
            spawned.fetch_add(1, Ordering::SeqCst);
            Ok(SpawnedProcess::new(pid, format!("gupid-{pid}"), sockets, child))
        }
    }
}

fn options(app: &str) -> GroupOptions {
    let mut o = GroupOptions::new(app, format!("/tmp/{app}"));
    o.min_processes = 1;
    o.max_processes = 6;
    o.socket_concurrency = 1;
    o
}

/// Scenario 1: empty-pool get spawns exactly one process, then the session
/// drop leaves the group idle with one enabled, zero in-flight process.
#[tokio::test]
async fn empty_pool_get_spawns_one_process() {
    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(PoolConfig::default(), Arc::clone(&spawner));

    let session = pool.async_get(options("a")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(pool.capacity_used(), 1);

    drop(session);
    assert_eq!(pool.capacity_used(), 1, "process stays enabled after session close");
}

/// Scenario 2: capacity contention. `max=1`, group A holds its one process
/// in a session; a second concurrent `async_get` for A must queue and then
/// be served by the *same* process once the first session drops, without a
/// second spawn.
#[tokio::test]
async fn capacity_contention_reuses_process_after_release() {
    let mut config = PoolConfig::default();
    config.max = 1;
    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(config, Arc::clone(&spawner));

    let first = pool.async_get(options("a")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    let first_pid = first.address().to_string();

    let pool2 = pool.clone();
    let waiter = tokio::spawn(async move { pool2.async_get(options("a")).await });

    // give the waiter a chance to enqueue behind the single busy process
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(first);

    let second = waiter.await.unwrap().unwrap();
    assert_eq!(second.address(), first_pid, "waitlist reused the released process");
    assert_eq!(spawner.spawn_count(), 1, "no second spawn was needed");
}

/// Scenario 3: cross-group eviction. `max=2`; group A has one idle process,
/// group B has one busy process. A `get` for new group C must evict A's
/// idle process (not B's busy one) to make room, leaving B untouched.
#[tokio::test]
async fn cross_group_eviction_prefers_idle_process() {
    let mut config = PoolConfig::default();
    config.max = 2;
    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(config, Arc::clone(&spawner));

    let idle_a = pool.async_get(options("a")).await.unwrap();
    drop(idle_a); // A's process is now idle (sessions == 0) but still enabled

    let busy_b = pool.async_get(options("b")).await.unwrap();
    assert_eq!(pool.capacity_used(), 2);

    let session_c = pool.async_get(options("c")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 3, "one spawn per group, including C");

    // B's held session must be unaffected by the eviction.
    drop(busy_b);
    drop(session_c);
}

/// Scenario 4: a sticky-session waiter that cannot be routed must not block
/// a later non-sticky waiter from being served when capacity frees up.
#[tokio::test]
async fn sticky_mismatch_does_not_starve_non_sticky_waiter() {
    let mut config = PoolConfig::default();
    config.max = 10;
    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(config, Arc::clone(&spawner));

    let mut opts = options("a");
    opts.min_processes = 2;
    opts.max_processes = 2;
    opts.sticky_sessions = true;
    let first = pool.async_get(opts.clone()).await.unwrap();

    let pool2 = pool.clone();
    let opts2 = opts.clone();
    let second_handle = tokio::spawn(async move { pool2.async_get(opts2).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = second_handle.await.unwrap().unwrap();
    assert_eq!(spawner.spawn_count(), 2, "group grew to min_processes=2");

    // Both processes are now busy (concurrency=1 each). Queue a sticky
    // waiter bound to `second`'s process specifically (found, but not
    // routable while busy), followed by a plain non-sticky waiter.
    let pool3 = pool.clone();
    let mut sticky_opts = opts.clone();
    sticky_opts.sticky_session_id = second.sticky_session_id();
    assert_ne!(sticky_opts.sticky_session_id, 0, "sticky_sessions assigns a nonzero id");
    let sticky_handle = tokio::spawn(async move { pool3.async_get(sticky_opts).await });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let pool4 = pool.clone();
    let plain_handle = tokio::spawn(async move { pool4.async_get(opts).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Releasing one busy process should serve the non-sticky waiter, not
    // the still-unroutable sticky one.
    drop(first);
    let plain_result = tokio::time::timeout(Duration::from_secs(2), plain_handle)
        .await
        .expect("non-sticky waiter must not starve behind the sticky one")
        .unwrap();
    assert!(plain_result.is_ok());

    // Clean up: release the remaining session so nothing is left dangling.
    drop(second);
    sticky_handle.abort();
}

/// OOBW: a process that requests out-of-band work is pulled out of routing
/// once its session drains, and restored to `enabled` once the work finishes.
#[tokio::test]
async fn oobw_drains_then_restores_the_process() {
    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(PoolConfig::default(), Arc::clone(&spawner));

    let session = pool.async_get(options("a")).await.unwrap();
    let pid: u32 = session
        .address()
        .rsplit('-')
        .next()
        .unwrap()
        .trim_end_matches(".sock")
        .parse()
        .unwrap();

    pool.request_oobw("a", pid);
    // Still mid-session: the OOBW tick must not pull a busy process.
    assert!(pool.oobw_tick().is_empty());

    drop(session);
    let ready = pool.oobw_tick();
    assert_eq!(ready, vec![("a".to_string(), pid)]);
    // A second tick is a no-op: the process is already `InProgress`, not `Requested`.
    assert!(pool.oobw_tick().is_empty());

    pool.finish_oobw("a", pid);
    let routed = pool.async_get(options("a")).await.unwrap();
    assert_eq!(routed.address(), format!("unix:/tmp/apppool-test-{pid}.sock"));
    assert_eq!(spawner.spawn_count(), 1, "the same process was reused after OOBW");
}

/// `detach_process`/`detach_group_by_name` (admin-style operations): detaching
/// a pid removes it from routing immediately; detaching a whole group drops
/// it from the pool's map without losing track of capacity.
#[tokio::test]
async fn detach_process_and_detach_group_by_name() {
    let mut config = PoolConfig::default();
    config.max = 4;
    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(config, Arc::clone(&spawner));

    let session = pool.async_get(options("a")).await.unwrap();
    let pid: u32 = session
        .address()
        .rsplit('-')
        .next()
        .unwrap()
        .trim_end_matches(".sock")
        .parse()
        .unwrap();
    drop(session);
    assert_eq!(pool.capacity_used(), 1);

    pool.detach_process("a", pid);
    assert_eq!(pool.capacity_used(), 0, "detached process no longer counts toward capacity");

    let _second = pool.async_get(options("a")).await.unwrap();
    assert_eq!(spawner.spawn_count(), 2, "a fresh process was spawned after detach");
    assert_eq!(pool.capacity_used(), 1);

    pool.detach_group_by_name("a");
    assert_eq!(pool.capacity_used(), 0, "the whole group was removed");
}

/// Scenario 6: restart via file. Touching `tmp/restart.txt` under the app
/// root must detach the current generation's process(es) and cause the next
/// `async_get` to spawn a fresh one, without carrying over the old pid.
#[tokio::test]
async fn restart_file_rolls_over_to_a_new_generation() {
    let app_root = tempfile::tempdir().unwrap();
    let tmp_dir = app_root.path().join("tmp");
    fs::create_dir_all(&tmp_dir).unwrap();

    let mut opts = GroupOptions::new("a", app_root.path().display().to_string());
    opts.min_processes = 1;
    opts.max_processes = 1;
    opts.socket_concurrency = 1;
    opts.stat_throttle_rate = Duration::ZERO;

    let spawner = Arc::new(TestSpawner::new(1));
    let pool = Pool::new(PoolConfig::default(), Arc::clone(&spawner));

    let first = pool.async_get(opts.clone()).await.unwrap();
    assert_eq!(spawner.spawn_count(), 1);
    let first_address = first.address().to_string();
    drop(first);
    assert_eq!(pool.capacity_used(), 1, "first generation's process stays enabled while idle");

    // Touching restart.txt bumps its mtime past the `None` baseline recorded
    // by the first `get()` above, so the next `get()` sees a change.
    fs::write(tmp_dir.join("restart.txt"), b"").unwrap();

    let second = pool.async_get(opts).await.unwrap();
    assert_eq!(spawner.spawn_count(), 2, "restart spawned a fresh process");
    assert_ne!(second.address(), first_address, "the new generation is a different process");
    assert_eq!(
        pool.capacity_used(),
        1,
        "the detached first-generation process no longer counts toward capacity"
    );
}
