//! Global process-pool: all groups, capacity accounting, cross-group
//! eviction, the pool-wide waitlist, and shutdown.

use crate::{
    config::{GroupOptions, PoolConfig},
    error::PoolError,
    group::{GetOutcome, Group, GroupLife, Waiter},
    process::ProcessId,
    session::Session,
    spawner::Spawner,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLife {
    Alive,
    PreparedForShutdown,
    ShuttingDown,
    ShutDown,
}

/// State protected by the pool-global lock. Deliberately a plain
/// `std::sync::Mutex`, not an async one: its guard cannot cross an `.await`
/// point, which makes "never block while holding the lock" a compile-time
/// property rather than a convention.
pub struct PoolInner<Sp: Spawner> {
    pub(crate) groups: HashMap<String, Group<Sp>>,
    config: PoolConfig,
    pub(crate) get_waitlist: VecDeque<Waiter>,
    pub life: PoolLife,
    default_spawner: Arc<Sp>,
}

impl<Sp: Spawner> PoolInner<Sp> {
    fn capacity_used(&self) -> usize {
        self.groups.values().map(Group::capacity_used).sum()
    }

    fn at_full_capacity(&self) -> bool {
        self.capacity_used() >= self.config.max
    }

    /// Finds the oldest idle process (smallest `last_used`, `sessions==0`)
    /// in any group other than `exclude`, detaches it, and returns its
    /// `(group, id)` so the caller can notify whichever slot it freed for.
    fn force_free_capacity(&mut self, exclude: Option<&str>) -> Option<(String, ProcessId)> {
        let mut best: Option<(String, ProcessId, Instant)> = None;

        for (name, group) in self.groups.iter() {
            if Some(name.as_str()) == exclude {
                continue;
            }
            for &id in group.enabled_ids() {
                if let Some(process) = group.process(id) {
                    if process.sessions == 0 {
                        let is_older = match &best {
                            Some((_, _, t)) => process.last_used < *t,
                            None => true,
                        };
                        if is_older {
                            best = Some((name.clone(), id, process.last_used));
                        }
                    }
                }
            }
        }

        let (name, id, _) = best?;
        if let Some(group) = self.groups.get_mut(&name) {
            group.detach(id);
        }
        Some((name, id))
    }

    /// Returns the `(group_name, restarts_initiated_snapshot)` pairs that
    /// need their spawn loop driven, for the caller to hand to
    /// [`drive_spawn_loop`] after releasing the pool lock.
    pub(crate) fn session_closed(
        &mut self,
        group_name: &str,
        process_id: ProcessId,
        socket_index: usize,
    ) -> Vec<(String, u32)> {
        if let Some(group) = self.groups.get_mut(group_name) {
            group.session_closed(process_id, socket_index);
        }
        self.drain_global_waitlist()
    }

    /// Migrates eligible pool-wide waiters into groups (creating groups as
    /// needed), then reserves a spawn slot for any group that came out of
    /// `group.get()` needing one. Per spec §4.4 "Progress on free capacity":
    /// migrate first, *then* spawn — the returned snapshots are what's left
    /// to actually drive, since launching a subprocess is I/O and must never
    /// happen while this (synchronous, non-async) lock is held.
    fn drain_global_waitlist(&mut self) -> Vec<(String, u32)> {
        let mut to_spawn = Vec::new();
        while let Some(waiter) = self.get_waitlist.pop_front() {
            if self.at_full_capacity() {
                self.get_waitlist.push_front(waiter);
                break;
            }
            let name = waiter.options.app_group_name.clone();
            let spawner = Arc::clone(&self.default_spawner);
            let group = self
                .groups
                .entry(name.clone())
                .or_insert_with(|| Group::new(waiter.options.clone(), spawner));
            let (_outcome, needs_spawn) = group.get(waiter.options, waiter.responder);
            if needs_spawn {
                if let Some(snapshot) = group.begin_spawn() {
                    to_spawn.push((name, snapshot));
                }
            }
        }
        to_spawn
    }
}

/// The global process pool. Clone to share a handle; all clones refer to the
/// same underlying state behind [`PoolInner`]'s mutex.
pub struct Pool<Sp: Spawner + Send + Sync + 'static> {
    inner: Arc<std::sync::Mutex<PoolInner<Sp>>>,
}

impl<Sp: Spawner + Send + Sync + 'static> Clone for Pool<Sp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Sp: Spawner + Send + Sync + 'static> Pool<Sp> {
    pub fn new(config: PoolConfig, default_spawner: Arc<Sp>) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(PoolInner {
                groups: HashMap::new(),
                config,
                get_waitlist: VecDeque::new(),
                life: PoolLife::Alive,
                default_spawner,
            })),
        }
    }

    /// Finds or creates the named group, then routes/enqueues/spawns per
    /// the group admission protocol (§4.3.1 of the design). Spawning (an
    /// actual subprocess exec) always happens *after* the lock is released.
    pub async fn async_get(&self, options: GroupOptions) -> Result<Session<Sp>, PoolError> {
        options
            .validate()
            .map_err(PoolError::Config)?;

        let (tx, rx) = oneshot::channel();
        let group_name = options.app_group_name.clone();
        let needs_spawn = self.route_or_enqueue(options, tx)?;

        if let Some(snapshot) = needs_spawn {
            drive_spawn_loop(Arc::clone(&self.inner), group_name.clone(), snapshot).await;
        }

        let ticket = rx.await.map_err(|_| PoolError::Spawn {
            group: group_name.clone(),
            source: std::io::Error::other("group was torn down while request was queued"),
        })??;

        Ok(Session::new(
            Arc::clone(&self.inner),
            group_name,
            ticket.process_id,
            ticket.socket_index,
            &ticket.socket,
            ticket.sticky_session_id,
        ))
    }

    fn route_or_enqueue(
        &self,
        options: GroupOptions,
        responder: oneshot::Sender<Result<crate::group::SessionTicket, PoolError>>,
    ) -> Result<Option<u32>, PoolError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let name = options.app_group_name.clone();

        if !inner.groups.contains_key(&name) {
            if inner.at_full_capacity() {
                if inner.force_free_capacity(None).is_none() {
                    if inner.get_waitlist.len() >= inner.config.max_request_queue_size {
                        let err = PoolError::RequestQueueFull {
                            group: name.clone(),
                            size: inner.get_waitlist.len(),
                        };
                        let _ = responder.send(Err(PoolError::RequestQueueFull {
                            group: name,
                            size: inner.get_waitlist.len(),
                        }));
                        return Err(err);
                    }
                    inner.get_waitlist.push_back(Waiter { options, responder });
                    return Ok(None);
                }
            }
            let spawner = Arc::clone(&inner.default_spawner);
            inner
                .groups
                .insert(name.clone(), Group::new(options.clone(), spawner));
        }

        let pool_at_capacity = inner.at_full_capacity();

        let group = inner.groups.get_mut(&name).expect("just inserted");
        let (outcome, needs_spawn) = group.get(options, responder);

        // `Group::begin_spawn` only enforces the group's own `max_processes`;
        // the pool-wide cap has to be checked here, since `Group` has no
        // handle back to `PoolInner`. Mirrors spawn()'s ERR_POOL_AT_FULL_CAPACITY
        // precondition (see original_source Pool.h 4.3.2): if there's zero
        // enabled processes in this group, try to steal a slot from an idle
        // process elsewhere; otherwise just let the request keep waiting
        // (it's already been enqueued by `group.get()` above).
        let snapshot = if needs_spawn && pool_at_capacity {
            if group.enabled_count() == 0 {
                if inner.force_free_capacity(Some(&name)).is_some() {
                    inner.groups.get_mut(&name).expect("still present").begin_spawn()
                } else {
                    None
                }
            } else {
                None
            }
        } else if needs_spawn {
            group.begin_spawn()
        } else {
            None
        };

        match outcome {
            GetOutcome::Error(err) => Err(err),
            GetOutcome::Ready(_) | GetOutcome::Enqueued => Ok(snapshot),
        }
    }

    pub fn set_max(&self, new_max: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.config.max = new_max;
        let to_spawn = inner.drain_global_waitlist();
        drop(inner);
        spawn_pending(&self.inner, to_spawn);
    }

    pub fn prepare_for_shutdown(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.life = PoolLife::PreparedForShutdown;
        for group in inner.groups.values_mut() {
            group.life = crate::group::GroupLife::ShuttingDown;
        }
    }

    pub fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.life = PoolLife::ShuttingDown;
        let ids: Vec<String> = inner.groups.keys().cloned().collect();
        for name in ids {
            if let Some(group) = inner.groups.get_mut(&name) {
                group.life = GroupLife::ShuttingDown;
                let enabled: Vec<_> = group.enabled_ids().to_vec();
                for id in enabled {
                    group.detach(id);
                }
                group.life = GroupLife::ShutDown;
            }
        }
        inner.life = PoolLife::ShutDown;
    }

    /// Detaches a single process by pid, identified by the owning group's
    /// name (the pool has no global pid index, so the caller — typically an
    /// admin API handler that already knows which group a pid belongs to —
    /// supplies it). Drains the group's and the pool's global waitlists
    /// afterward, since detaching can free a routing slot. No-op if the pid
    /// isn't found in that group.
    pub fn detach_process(&self, group_name: &str, pid: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = inner.groups.get_mut(group_name) else {
            return;
        };
        let Some(id) = group.find_by_pid(pid) else {
            return;
        };
        group.detach(id);
        let to_spawn = inner.drain_global_waitlist();
        drop(inner);
        spawn_pending(&self.inner, to_spawn);
    }

    /// Removes a group from the pool entirely. Any requests still waiting on
    /// it are migrated to the pool's global waitlist rather than dropped, so
    /// they get a chance to land in whatever group gets created under the
    /// same name next (or fail on `max_request_queue_size` like any other
    /// global waiter).
    pub fn detach_group_by_name(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut group) = inner.groups.remove(name) else {
            return;
        };
        while let Some(waiter) = group.get_waitlist.pop_front() {
            inner.get_waitlist.push_back(waiter);
        }
        let to_spawn = inner.drain_global_waitlist();
        drop(inner);
        spawn_pending(&self.inner, to_spawn);
    }

    /// Runs one tick of the detached-process reaper across every group.
    /// Call this periodically (e.g. every `process_detach_check_interval`)
    /// from a `tokio::time::interval` loop owned by the embedding binary.
    pub fn reap_tick(&self, shutdown_timeout: std::time::Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for group in inner.groups.values_mut() {
            group.reap_detached(shutdown_timeout);
        }
    }

    /// Requests OOBW for the named process; it actually moves to `disabling`
    /// once its sessions drain, on the next [`Self::oobw_tick`].
    pub fn request_oobw(&self, group_name: &str, pid: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = inner.groups.get_mut(group_name) else {
            return;
        };
        if let Some(id) = group.find_by_pid(pid) {
            group.request_oobw(id);
        }
    }

    /// One tick of the OOBW scheduler across every group: pulls any process
    /// that requested OOBW and has drained to zero sessions into `disabling`,
    /// returning `(group_name, pid)` pairs the caller should actually trigger
    /// OOBW on (asking the worker to run its maintenance hook is an external
    /// concern — see [`Spawner`] — this just performs the routing-state
    /// transition). Call [`Self::finish_oobw`] once that external call
    /// returns.
    pub fn oobw_tick(&self) -> Vec<(String, u32)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut ready = Vec::new();
        for (name, group) in inner.groups.iter_mut() {
            for id in group.processes_ready_for_oobw() {
                if let Some(process) = group.process(id) {
                    ready.push((name.clone(), process.pid));
                }
            }
        }
        ready
    }

    /// Completes OOBW for the named process, moving it back to `enabled` and
    /// draining its group's waitlist.
    pub fn finish_oobw(&self, group_name: &str, pid: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = inner.groups.get_mut(group_name) else {
            return;
        };
        if let Some(id) = group.find_by_pid(pid) {
            group.finish_oobw(id);
        }
    }

    pub fn capacity_used(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).capacity_used()
    }
}

/// Drives a group's spawn loop to completion: repeatedly spawns a process,
/// reserving the next slot under the pool lock between spawns, until the
/// group's `reserve_next_spawn` says it has enough (or the pool is at
/// capacity). Free function (rather than a `Pool` method) so it can be
/// launched with `tokio::spawn` from any post-lock-actions site — `async_get`
/// awaits it directly since the caller is already blocked on this group, but
/// waiters migrated off the pool-wide waitlist (`set_max`, `detach_process`,
/// `detach_group_by_name`, `session_closed`) fire it off in the background
/// instead of blocking the call that triggered the migration.
pub(crate) async fn drive_spawn_loop<Sp: Spawner + Send + Sync + 'static>(
    inner: Arc<std::sync::Mutex<PoolInner<Sp>>>,
    group_name: String,
    snapshot: u32,
) {
    // The first spawn's slot was already reserved by `begin_spawn` under the
    // same lock that admitted this get(). Every later iteration must
    // re-check and re-reserve against *current* pool-wide usage: the
    // per-group `should_continue_spawn_loop` alone can't see other groups'
    // in-flight spawns.
    let mut first_iteration = true;

    loop {
        let (spawner, options) = {
            let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
            let can_continue = if first_iteration {
                guard
                    .groups
                    .get(&group_name)
                    .is_some_and(|group| group.should_continue_spawn_loop(snapshot))
            } else {
                let pool_at_capacity = guard.at_full_capacity();
                guard
                    .groups
                    .get_mut(&group_name)
                    .is_some_and(|group| group.reserve_next_spawn(snapshot, pool_at_capacity))
            };
            first_iteration = false;

            if !can_continue {
                if let Some(group) = guard.groups.get_mut(&group_name) {
                    group.end_spawn_loop();
                }
                return;
            }

            let Some(group) = guard.groups.get(&group_name) else {
                return;
            };
            (group.spawner(), group.options.clone())
        };

        match spawner.spawn(&options).await {
            Ok(spawned) => {
                let (process, _child) = spawned.into_process();
                let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(group) = guard.groups.get_mut(&group_name) {
                    group.attach_spawned(process);
                }
                let to_spawn = guard.drain_global_waitlist();
                drop(guard);
                // Any pair for `group_name` itself is impossible here:
                // `begin_spawn` on a group already mid-spawn-loop returns
                // `None` (the `spawning` guard), so only *other* groups can
                // come back needing a loop driven, which is why those go to
                // the background instead of being awaited inline.
                spawn_pending(&inner, to_spawn);
            }
            Err(err) => {
                let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
                match guard.groups.get_mut(&group_name) {
                    Some(group) => group.spawn_failed(&err),
                    None => return,
                }
                // fall through to the top of the loop, which re-checks
                // `reserve_next_spawn` and ends the loop itself if the group
                // has nothing left to grow toward.
            }
        }
    }
}

/// Fires a background [`drive_spawn_loop`] task per `(group_name, snapshot)`
/// pair returned by a post-lock drain. Used by every call site that migrates
/// pool-global waiters outside of `async_get`'s own request: the caller
/// already released the lock and has no reason to block on a spawn loop for
/// a group it didn't ask about.
fn spawn_pending<Sp: Spawner + Send + Sync + 'static>(
    inner: &Arc<std::sync::Mutex<PoolInner<Sp>>>,
    to_spawn: Vec<(String, u32)>,
) {
    for (group_name, snapshot) in to_spawn {
        tokio::spawn(drive_spawn_loop(Arc::clone(inner), group_name, snapshot));
    }
}
