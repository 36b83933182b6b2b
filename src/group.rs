//! Per-application-group scheduler: process lists, spawn loop, restart state
//! machine, OOBW, and the detached-process reaper.

use crate::{
    config::GroupOptions,
    error::PoolError,
    process::{EnabledStatus, Process, ProcessId, ProcessSocket},
    spawner::Spawner,
};
use std::{
    collections::VecDeque,
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::oneshot;

/// Everything the caller needs to build a [`Session`](crate::session::Session)
/// once routing has picked a process. Kept separate from `Session` itself so
/// `Group` never has to hold the pool-level `Arc` that `Session` needs for its
/// `Drop` callback.
#[derive(Debug, Clone)]
pub(crate) struct SessionTicket {
    pub process_id: ProcessId,
    pub socket_index: usize,
    pub socket: ProcessSocket,
    /// The process's sticky-session id, if `options.sticky_sessions` is on.
    /// The `Controller` surfaces this to the client (e.g. as a cookie) so a
    /// later request can ask to land back on the same process.
    pub sticky_session_id: u64,
}

struct ProcessSlot {
    generation: u32,
    process: Option<Process>,
}

pub(crate) struct Waiter {
    pub(crate) options: GroupOptions,
    pub(crate) responder: oneshot::Sender<Result<SessionTicket, PoolError>>,
}

pub enum DisableOutcome {
    Completed,
    Canceled,
}

struct DisableWaiter {
    process_id: ProcessId,
    responder: oneshot::Sender<DisableOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLife {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// Outcome of a routing/admission pass, returned to the caller (the
/// `Pool`/`PoolInner`) so it knows whether to launch a spawn task after
/// releasing the lock.
pub(crate) enum GetOutcome {
    Ready(SessionTicket),
    Enqueued,
    Error(PoolError),
}

/// A per-application-group process scheduler, parameterized over the
/// [`Spawner`] used to create its workers.
pub struct Group<Sp: Spawner> {
    pub name: String,
    pub options: GroupOptions,
    spawner: std::sync::Arc<Sp>,

    arena: Vec<ProcessSlot>,
    free_list: Vec<usize>,

    enabled: Vec<ProcessId>,
    disabling: Vec<ProcessId>,
    disabled: Vec<ProcessId>,
    detached: Vec<ProcessId>,

    pub(crate) get_waitlist: VecDeque<Waiter>,
    disable_waitlist: VecDeque<DisableWaiter>,

    pub(crate) processes_being_spawned: usize,
    pub(crate) spawning: bool,
    pub(crate) restarting: bool,
    pub(crate) restarts_initiated: u32,

    pub life: GroupLife,

    last_restart_file_mtime: Option<SystemTime>,
    last_restart_file_check_time: Option<Instant>,
    always_restart_file_exists: bool,

    /// Source of fresh sticky-session ids; `0` is reserved for "none", so
    /// this always starts at and increments from `1`.
    next_sticky_session_id: u64,
}

impl<Sp: Spawner> Group<Sp> {
    pub fn new(options: GroupOptions, spawner: std::sync::Arc<Sp>) -> Self {
        Self {
            name: options.app_group_name.clone(),
            options,
            spawner,
            arena: Vec::new(),
            free_list: Vec::new(),
            enabled: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            detached: Vec::new(),
            get_waitlist: VecDeque::new(),
            disable_waitlist: VecDeque::new(),
            processes_being_spawned: 0,
            spawning: false,
            restarting: false,
            restarts_initiated: 0,
            life: GroupLife::Alive,
            last_restart_file_mtime: None,
            last_restart_file_check_time: None,
            always_restart_file_exists: false,
            next_sticky_session_id: 1,
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    pub fn disabling_count(&self) -> usize {
        self.disabling.len()
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.len()
    }

    /// `Σ (enabled + disabling + disabled + being_spawned)` — this group's
    /// contribution to `Pool::capacity_used`.
    pub fn capacity_used(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.disabled.len() + self.processes_being_spawned
    }

    pub(crate) fn enabled_ids(&self) -> &[ProcessId] {
        &self.enabled
    }

    /// Finds the id of whichever tracked process (in any of `enabled`,
    /// `disabling`, `disabled`, or `detached`) has this pid.
    pub(crate) fn find_by_pid(&self, pid: u32) -> Option<ProcessId> {
        self.enabled
            .iter()
            .chain(&self.disabling)
            .chain(&self.disabled)
            .chain(&self.detached)
            .find(|&&id| self.get_process(id).is_some_and(|p| p.pid == pid))
            .copied()
    }

    pub(crate) fn process(&self, id: ProcessId) -> Option<&Process> {
        self.get_process(id)
    }

    pub(crate) fn spawner_ref(&self) -> &std::sync::Arc<Sp> {
        &self.spawner
    }

    fn get_process(&self, id: ProcessId) -> Option<&Process> {
        self.arena
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.process.as_ref())
    }

    fn get_process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        self.arena
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.process.as_mut())
    }

    fn insert_process(&mut self, process: Process) -> ProcessId {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.arena[index];
            slot.process = Some(process);
            ProcessId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.arena.len();
            self.arena.push(ProcessSlot {
                generation: 0,
                process: Some(process),
            });
            ProcessId {
                index,
                generation: 0,
            }
        }
    }

    fn remove_process(&mut self, id: ProcessId) -> Option<Process> {
        let slot = self.arena.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let process = slot.process.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(id.index);
        process
    }

    // ----- routing -------------------------------------------------------

    /// `route(options)`: picks a process from `enabled`, falling back to
    /// `disabling`. Returns `(Some(id), finished)` or `(None, finished)`.
    /// `finished == false` means "try the next waiter instead of stopping
    /// this drain pass", used to keep a sticky-session miss from starving
    /// later non-sticky waiters.
    fn route(&self, options: &GroupOptions) -> (Option<ProcessId>, bool) {
        if let Some(id) = self.route_within(&self.enabled, options) {
            return id;
        }
        if let Some(id) = self.route_within(&self.disabling, options) {
            return id;
        }
        (None, true)
    }

    fn route_within(
        &self,
        list: &[ProcessId],
        options: &GroupOptions,
    ) -> Option<(Option<ProcessId>, bool)> {
        if list.is_empty() {
            return None;
        }

        if options.sticky_session_id != 0 {
            if let Some(&id) = list
                .iter()
                .find(|&&id| self.get_process(id).map(|p| p.sticky_session_id) == Some(options.sticky_session_id))
            {
                let routable = self.get_process(id).is_some_and(Process::can_be_routed_to);
                return Some(if routable {
                    (Some(id), true)
                } else {
                    (None, false)
                });
            }
            // not found at all: fall through to lowest-busyness search below
        }

        let best = list
            .iter()
            .filter_map(|&id| self.get_process(id).map(|p| (id, p)))
            .min_by_key(|(_, p)| (p.busyness(), p.last_used));

        match best {
            Some((id, p)) if p.can_be_routed_to() => Some((Some(id), true)),
            Some(_) => Some((None, true)),
            None => Some((None, true)),
        }
    }

    fn should_spawn_for_get_action(&self) -> bool {
        !self.spawning
            && !self.restarting
            && self.capacity_used() < self.options.max_processes
            && (self.enabled.is_empty() || self.enabled.iter().all(|&id| {
                self.get_process(id).is_some_and(|p| !p.can_be_routed_to())
            }))
    }

    /// Synchronous admission/routing pass. Does not perform any I/O; if a
    /// spawn is warranted, sets `needs_spawn` so the caller (holding the
    /// pool lock) can launch the async spawn task after unlocking.
    pub(crate) fn get(
        &mut self,
        mut options: GroupOptions,
        responder: oneshot::Sender<Result<SessionTicket, PoolError>>,
    ) -> (GetOutcome, bool) {
        if !self.restarting {
            self.maybe_trigger_restart_from_file();
        }
        options.app_group_name = self.name.clone();

        let needs_spawn = self.should_spawn_for_get_action();

        if options.noop {
            let ticket = ticket_placeholder();
            let _ = responder.send(Ok(ticket.clone()));
            return (GetOutcome::Ready(ticket), needs_spawn);
        }

        if self.enabled.is_empty() {
            if let Some((Some(id), true)) = self.route_within(&self.disabling, &options) {
                if let Some(ticket) = self.try_build_ticket(id) {
                    let result = ticket.clone();
                    let _ = responder.send(Ok(ticket));
                    return (GetOutcome::Ready(result), needs_spawn);
                }
            }
            self.get_waitlist.push_back(Waiter { options, responder });
            return (GetOutcome::Enqueued, needs_spawn);
        }

        let (routed, _finished) = self.route(&options);
        match routed.and_then(|id| self.try_build_ticket(id)) {
            Some(ticket) => {
                let result = ticket.clone();
                let _ = responder.send(Ok(ticket));
                (GetOutcome::Ready(result), needs_spawn)
            }
            None => {
                self.get_waitlist.push_back(Waiter { options, responder });
                (GetOutcome::Enqueued, needs_spawn)
            }
        }
    }

    /// Builds a ticket for `id` if it still has a free socket, bumping its
    /// session counters. Returns `None` (without side effects) if the
    /// process turned out not to be routable after all.
    fn try_build_ticket(&mut self, id: ProcessId) -> Option<SessionTicket> {
        let now = Instant::now();
        let (socket_index, socket) = {
            let process = self.get_process(id)?;
            let socket_index = process.pick_socket(now)?;
            (socket_index, process.sockets[socket_index].clone())
        };

        if self.options.sticky_sessions && self.get_process(id)?.sticky_session_id == 0 {
            let fresh_id = self.next_sticky_session_id;
            self.next_sticky_session_id += 1;
            if let Some(process) = self.get_process_mut(id) {
                process.sticky_session_id = fresh_id;
            }
        }

        let process = self.get_process_mut(id)?;
        process.session_opened(socket_index, now);
        let sticky_session_id = process.sticky_session_id;

        Some(SessionTicket {
            process_id: id,
            socket_index,
            socket,
            sticky_session_id,
        })
    }

    /// Drains `get_waitlist` after a process becomes available (new spawn,
    /// or a session closing on a previously-totally-busy process).
    ///
    /// Bounded to the queue length observed at entry: a sticky waiter whose
    /// target process is busy routes as `(None, false)` and gets requeued at
    /// the back so it doesn't starve later non-sticky waiters (see
    /// `route_within`), but with two or more such misses queued, the queue's
    /// `len()` never drops to 1 on its own — looping until it did span an
    /// unbounded spin while holding the pool lock. Each waiter gets at most
    /// one routing attempt per call; anyone still stuck after that stays
    /// queued for the next trigger (a future spawn or session close).
    pub(crate) fn drain_waitlist(&mut self) {
        let mut remaining = self.get_waitlist.len();
        while remaining > 0 {
            remaining -= 1;
            let Some(waiter) = self.get_waitlist.pop_front() else {
                break;
            };
            let (routed, finished) = self.route(&waiter.options);
            match routed.and_then(|id| self.try_build_ticket(id)) {
                Some(ticket) => {
                    let _ = waiter.responder.send(Ok(ticket));
                }
                None if finished => {
                    self.get_waitlist.push_front(waiter);
                    break;
                }
                None => {
                    // sticky waiter not routable this pass; requeue at the
                    // back so later non-sticky waiters aren't starved, and
                    // keep examining the rest of the waiters seen at entry.
                    self.get_waitlist.push_back(waiter);
                }
            }
        }
    }

    // ----- session completion --------------------------------------------

    pub(crate) fn session_closed(&mut self, process_id: ProcessId, socket_index: usize) {
        if process_id == ProcessId::NOOP {
            return;
        }
        if let Some(process) = self.get_process_mut(process_id) {
            process.session_closed(socket_index);
        }
        self.drain_waitlist();
    }

    // ----- spawning --------------------------------------------------------

    /// Call while holding the pool lock; marks the group as spawning and
    /// returns the snapshot the async spawn task must compare against to
    /// detect a concurrent restart.
    pub(crate) fn begin_spawn(&mut self) -> Option<u32> {
        if self.spawning || self.restarting {
            return None;
        }
        if self.capacity_used() >= self.options.max_processes {
            return None;
        }
        self.spawning = true;
        self.processes_being_spawned += 1;
        Some(self.restarts_initiated)
    }

    /// Reserves a slot for a second-or-later spawn within the same spawn
    /// loop iteration (the first spawn's slot is already reserved by
    /// [`Self::begin_spawn`]). Unlike `begin_spawn`, this also honors the
    /// pool-wide capacity the caller observed under the same lock, since the
    /// per-group check alone can't see other groups' usage.
    pub(crate) fn reserve_next_spawn(&mut self, snapshot: u32, pool_at_full_capacity: bool) -> bool {
        if self.restarts_initiated != snapshot || !self.should_spawn_another() {
            return false;
        }
        if pool_at_full_capacity || self.capacity_used() >= self.options.max_processes {
            return false;
        }
        self.processes_being_spawned += 1;
        true
    }

    fn should_spawn_another(&self) -> bool {
        self.capacity_used() < self.options.min_processes.max(1)
            || (self.get_waitlist.len() > self.enabled.len() && self.capacity_used() < self.options.max_processes)
    }

    /// Attaches a freshly spawned process (called by the async spawn task
    /// after it reacquires the pool lock) and drains waiters against it.
    pub(crate) fn attach_spawned(&mut self, process: Process) -> ProcessId {
        self.processes_being_spawned = self.processes_being_spawned.saturating_sub(1);
        let id = self.insert_process(process);
        self.enabled.push(id);
        self.drain_waitlist();
        id
    }

    pub(crate) fn spawn_failed(&mut self, err: &PoolError) {
        self.processes_being_spawned = self.processes_being_spawned.saturating_sub(1);
        if self.enabled.is_empty() {
            while let Some(waiter) = self.get_waitlist.pop_front() {
                let _ = waiter.responder.send(Err(PoolError::Spawn {
                    group: self.name.clone(),
                    source: std::io::Error::other(err.to_string()),
                }));
            }
        }
    }

    pub(crate) fn end_spawn_loop(&mut self) {
        self.spawning = false;
    }

    pub fn spawner(&self) -> std::sync::Arc<Sp> {
        std::sync::Arc::clone(&self.spawner)
    }

    pub(crate) fn should_continue_spawn_loop(&self, snapshot: u32) -> bool {
        self.restarts_initiated == snapshot && self.should_spawn_another()
    }

    // ----- restart -----------------------------------------------------

    pub fn request_restart(&mut self) {
        self.restarting = true;
        self.restarts_initiated = self.restarts_initiated.wrapping_add(1);
        for &id in &self.enabled.clone() {
            self.detach(id);
        }
        self.spawning = false;
        // Detaching the old generation above is the entire synchronous part
        // of a restart (the actual process shutdown happens later, off the
        // detached list, via `reap_detached`). Once it's done, the new
        // generation is free to start spawning immediately.
        self.finish_restart();
    }

    pub(crate) fn finish_restart(&mut self) {
        self.restarting = false;
    }

    fn maybe_trigger_restart_from_file(&mut self) {
        let throttle = self.options.stat_throttle_rate;
        if let Some(last_check) = self.last_restart_file_check_time {
            if last_check.elapsed() < throttle {
                return;
            }
        }
        self.last_restart_file_check_time = Some(Instant::now());

        let restart_path = format!("{}/tmp/restart.txt", self.options.app_root);
        let always_path = format!("{}/tmp/always_restart.txt", self.options.app_root);

        let always_exists = std::path::Path::new(&always_path).exists();
        let mtime = std::fs::metadata(&restart_path).and_then(|m| m.modified()).ok();

        let changed = mtime != self.last_restart_file_mtime && mtime.is_some();
        self.last_restart_file_mtime = mtime;
        self.always_restart_file_exists = always_exists;

        if changed || always_exists {
            self.request_restart();
        }
    }

    // ----- detach / reaper ------------------------------------------------

    pub fn detach(&mut self, id: ProcessId) {
        self.enabled.retain(|&x| x != id);
        self.disabling.retain(|&x| x != id);
        self.disabled.retain(|&x| x != id);
        if !self.detached.contains(&id) {
            self.detached.push(id);
        }
        if let Some(process) = self.get_process_mut(id) {
            process.enabled = EnabledStatus::Detached;
            if process.sessions == 0 && process.life() == crate::process::LifeStatus::Alive {
                process.trigger_shutdown();
            }
        }
    }

    /// One tick of the detached-process reaper; call periodically
    /// (`PROCESS_DETACH_CHECK_INTERVAL`).
    pub fn reap_detached(&mut self, shutdown_timeout: Duration) {
        let ids: Vec<ProcessId> = self.detached.clone();
        for id in ids {
            let Some(process) = self.get_process_mut(id) else {
                continue;
            };
            if process.sessions == 0 && process.life() == crate::process::LifeStatus::Alive {
                process.trigger_shutdown();
            }
            if process.life() == crate::process::LifeStatus::ShutdownTriggered {
                if !process.os_process_exists() {
                    process.cleanup();
                } else if process.shutdown_timeout_expired(shutdown_timeout) {
                    unsafe {
                        libc::kill(process.pid as libc::pid_t, libc::SIGKILL);
                    }
                }
            }
            if process.life() == crate::process::LifeStatus::Dead {
                self.detached.retain(|&x| x != id);
                self.remove_process(id);
            }
        }
    }

    // ----- disable / enable ------------------------------------------------

    pub fn disable(&mut self, id: ProcessId, responder: oneshot::Sender<DisableOutcome>) {
        self.enabled.retain(|&x| x != id);
        if !self.disabling.contains(&id) {
            self.disabling.push(id);
        }
        if let Some(process) = self.get_process_mut(id) {
            process.enabled = EnabledStatus::Disabling;
        }
        self.disable_waitlist.push_back(DisableWaiter {
            process_id: id,
            responder,
        });
        self.maybe_complete_disable(id);
    }

    fn maybe_complete_disable(&mut self, id: ProcessId) {
        let drained = self.get_process(id).is_some_and(|p| p.sessions == 0);
        if !drained {
            return;
        }
        self.disabling.retain(|&x| x != id);
        self.disabled.push(id);
        if let Some(process) = self.get_process_mut(id) {
            process.enabled = EnabledStatus::Disabled;
        }
        let mut remaining = VecDeque::new();
        while let Some(w) = self.disable_waitlist.pop_front() {
            if w.process_id == id {
                let _ = w.responder.send(DisableOutcome::Completed);
            } else {
                remaining.push_back(w);
            }
        }
        self.disable_waitlist = remaining;
    }

    // ----- out-of-band work ------------------------------------------------

    /// Marks `id` as wanting OOBW (`NOT_ACTIVE -> REQUESTED`). The actual move
    /// to `disabling` happens later, in [`Self::processes_ready_for_oobw`],
    /// once its sessions have drained to zero — a process mid-request can't
    /// be pulled out from under its caller just because it asked for OOBW.
    pub fn request_oobw(&mut self, id: ProcessId) {
        if let Some(process) = self.get_process_mut(id) {
            if process.oobw == crate::process::OobwStatus::NotActive {
                process.oobw = crate::process::OobwStatus::Requested;
            }
        }
    }

    /// One tick of the OOBW scheduler: any enabled process that requested
    /// OOBW and has drained to zero sessions is pulled into `disabling`.
    /// The caller (see [`Pool::oobw_tick`](crate::pool::Pool::oobw_tick)) is
    /// responsible for actually asking the worker to run its maintenance
    /// hook, then calling [`Self::finish_oobw`] once that's done.
    pub(crate) fn processes_ready_for_oobw(&mut self) -> Vec<ProcessId> {
        let mut ready = Vec::new();
        for &id in &self.enabled.clone() {
            let is_ready = self.get_process(id).is_some_and(|p| {
                p.oobw == crate::process::OobwStatus::Requested && p.sessions == 0
            });
            if !is_ready {
                continue;
            }
            self.enabled.retain(|&x| x != id);
            self.disabling.push(id);
            if let Some(process) = self.get_process_mut(id) {
                process.enabled = EnabledStatus::Disabling;
                process.oobw = crate::process::OobwStatus::InProgress;
            }
            ready.push(id);
        }
        ready
    }

    /// Called once a process's OOBW has finished running: moves it back to
    /// `enabled` and drains the waitlist against it.
    pub fn finish_oobw(&mut self, id: ProcessId) {
        self.disabling.retain(|&x| x != id);
        if !self.enabled.contains(&id) {
            self.enabled.push(id);
        }
        if let Some(process) = self.get_process_mut(id) {
            process.enabled = EnabledStatus::Enabled;
            process.oobw = crate::process::OobwStatus::NotActive;
        }
        self.drain_waitlist();
    }

    // ----- disable / enable (continued) ------------------------------------

    /// Resolved race (Open Question): `enable` on a process with a pending
    /// disable resolves that disable immediately as `CANCELED`.
    pub fn enable(&mut self, id: ProcessId) {
        self.disabling.retain(|&x| x != id);
        self.disabled.retain(|&x| x != id);
        if !self.enabled.contains(&id) {
            self.enabled.push(id);
        }
        if let Some(process) = self.get_process_mut(id) {
            process.enabled = EnabledStatus::Enabled;
        }

        let mut remaining = VecDeque::new();
        while let Some(w) = self.disable_waitlist.pop_front() {
            if w.process_id == id {
                let _ = w.responder.send(DisableOutcome::Canceled);
            } else {
                remaining.push_back(w);
            }
        }
        self.disable_waitlist = remaining;
        self.drain_waitlist();
    }
}

/// `GetOutcome::Ready` needs an owned `SessionTicket`, but the `noop` path
/// sends its ticket through the responder directly; this returns a cheap
/// placeholder carrying the same sentinel id for the caller's bookkeeping.
fn ticket_placeholder() -> SessionTicket {
    SessionTicket {
        process_id: ProcessId::NOOP,
        socket_index: 0,
        socket: ProcessSocket::new("", crate::process::SocketProtocol::Session, 0),
        sticky_session_id: 0,
    }
}
