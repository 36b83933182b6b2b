//! One worker: its pid, sockets, busyness accounting, and liveness probe.

use std::{
    sync::atomic::{AtomicU8, Ordering},
    time::{Duration, Instant},
};

/// A generational reference to a [`Process`] stored in a [`Group`](crate::group::Group)'s
/// arena. The Rust equivalent of a `weak_ptr` back-reference: valid only while
/// the generation still matches, i.e. while the slot hasn't been recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl ProcessId {
    /// Sentinel id bound to nothing, used for no-op sessions.
    pub const NOOP: Self = Self {
        index: usize::MAX,
        generation: 0,
    };
}

/// A worker's advertised listen socket.
#[derive(Debug, Clone)]
pub struct ProcessSocket {
    /// `unix:<path>` or `tcp://<host>:<port>`.
    pub address: String,
    /// `session` or `http`; chosen by the [`Controller`](crate::controller::Controller)
    /// to pick a wire format.
    pub protocol: SocketProtocol,
    /// `>0` hard cap, `0` unlimited, `<0` unknown.
    pub concurrency: i64,
    pub accepting_http_requests: bool,
    pub(crate) sessions: u32,
}

impl ProcessSocket {
    pub fn new(address: impl Into<String>, protocol: SocketProtocol, concurrency: i64) -> Self {
        Self {
            address: address.into(),
            protocol,
            concurrency,
            accepting_http_requests: true,
            sessions: 0,
        }
    }

    #[inline(always)]
    fn is_totally_busy(&self) -> bool {
        self.concurrency > 0 && self.sessions as i64 >= self.concurrency
    }
}

/// Wire format a [`ProcessSocket`] speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    /// Length-prefixed NUL-terminated key/value block.
    Session,
    /// Plain HTTP/1.1 with `!~Passenger-*` headers.
    Http,
}

/// Monotonic lifecycle state of a [`Process`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifeStatus {
    Alive = 0,
    ShutdownTriggered = 1,
    Dead = 2,
}

impl LifeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Alive,
            1 => Self::ShutdownTriggered,
            _ => Self::Dead,
        }
    }
}

/// Whether a [`Process`] currently participates in routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledStatus {
    Enabled,
    Disabling,
    Disabled,
    Detached,
}

/// Out-of-band-work state of a [`Process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobwStatus {
    NotActive,
    Requested,
    InProgress,
}

/// One OS worker: pid, sockets, and the counters [`Group`](crate::group::Group)
/// uses to route to it.
#[derive(Debug)]
pub struct Process {
    pub pid: u32,
    pub gupid: String,
    pub sticky_session_id: u64,
    pub sockets: Vec<ProcessSocket>,

    pub(crate) sessions: u32,
    pub(crate) processed: u64,
    pub(crate) last_used: Instant,

    pub enabled: EnabledStatus,
    pub oobw: OobwStatus,

    life: AtomicU8,
    pub(crate) shutdown_start_time: Option<Instant>,
    /// Cached negative result of [`Self::os_process_exists`] so a recycled pid
    /// is never mistaken for this process once it is known gone.
    known_dead: bool,
}

const INT_MAX: u64 = i32::MAX as u64;

impl Process {
    pub fn new(pid: u32, gupid: String, sockets: Vec<ProcessSocket>) -> Self {
        Self {
            pid,
            gupid,
            sticky_session_id: 0,
            sockets,
            sessions: 0,
            processed: 0,
            last_used: Instant::now(),
            enabled: EnabledStatus::Enabled,
            oobw: OobwStatus::NotActive,
            life: AtomicU8::new(LifeStatus::Alive as u8),
            shutdown_start_time: None,
            known_dead: false,
        }
    }

    #[inline]
    pub fn life(&self) -> LifeStatus {
        LifeStatus::from_u8(self.life.load(Ordering::Acquire))
    }

    fn set_life(&self, status: LifeStatus) {
        self.life.store(status as u8, Ordering::Release);
    }

    /// Picks the socket with lowest in-flight sessions among those accepting
    /// requests; returns `None` if it's at capacity. Caller is expected to
    /// bump `self.sessions`/`socket.sessions` and build a
    /// [`Session`](crate::session::Session) from the returned index.
    pub(crate) fn pick_socket(&self, now: Instant) -> Option<usize> {
        let _ = now;
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, s)| s.accepting_http_requests && !s.is_totally_busy())
            .min_by_key(|(_, s)| s.sessions)
            .map(|(i, _)| i)
    }

    pub(crate) fn session_opened(&mut self, socket_index: usize, now: Instant) {
        self.sockets[socket_index].sessions += 1;
        self.sessions += 1;
        self.last_used = now;
    }

    /// Idempotent: a second call for the same slot is a no-op, since
    /// [`Session::drop`](crate::session::Session) guards against double-fire.
    pub(crate) fn session_closed(&mut self, socket_index: usize) {
        if let Some(socket) = self.sockets.get_mut(socket_index) {
            socket.sessions = socket.sessions.saturating_sub(1);
        }
        self.sessions = self.sessions.saturating_sub(1);
        self.processed += 1;
    }

    #[inline]
    pub fn is_totally_busy(&self) -> bool {
        self.sockets
            .iter()
            .filter(|s| s.accepting_http_requests)
            .any(ProcessSocket::is_totally_busy)
    }

    #[inline]
    pub fn can_be_routed_to(&self) -> bool {
        !self.is_totally_busy()
    }

    /// Scalar used to pick among routable candidates; lower is preferred.
    /// Unlimited-concurrency processes always rank below any bounded one
    /// that has work, since the aggregate concurrency is then `<= 0`.
    pub fn busyness(&self) -> u64 {
        let aggregate_concurrency: i64 = self
            .sockets
            .iter()
            .filter(|s| s.accepting_http_requests)
            .map(|s| s.concurrency)
            .sum();

        if aggregate_concurrency <= 0 {
            self.sessions as u64
        } else {
            (self.sessions as u64).saturating_mul(INT_MAX) / aggregate_concurrency as u64
        }
    }

    /// Sends signal 0 to probe liveness, then checks `/proc/<pid>/status` for
    /// zombie state on Linux. Caches a negative result.
    pub fn os_process_exists(&mut self) -> bool {
        if self.known_dead {
            return false;
        }

        let alive = unsafe { libc::kill(self.pid as libc::pid_t, 0) == 0 };
        let alive = alive && !self.is_zombie();

        if !alive {
            self.known_dead = true;
        }
        alive
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(&self) -> bool {
        let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", self.pid)) else {
            return true;
        };
        status
            .lines()
            .find(|l| l.starts_with("State:"))
            .map(|l| l.contains('Z'))
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    fn is_zombie(&self) -> bool {
        false
    }

    /// Precondition: `life == ALIVE && sessions == 0`.
    pub fn trigger_shutdown(&mut self) {
        debug_assert_eq!(self.life(), LifeStatus::Alive);
        debug_assert_eq!(self.sessions, 0);
        self.set_life(LifeStatus::ShutdownTriggered);
        self.shutdown_start_time = Some(Instant::now());
        tracing::debug!(pid = self.pid, gupid = %self.gupid, "shutdown triggered");
    }

    pub fn shutdown_timeout_expired(&self, timeout: Duration) -> bool {
        self.shutdown_start_time
            .is_some_and(|t| t.elapsed() >= timeout)
    }

    /// Precondition: `life == SHUTDOWN_TRIGGERED && !os_process_exists()`.
    pub fn cleanup(&mut self) {
        debug_assert_eq!(self.life(), LifeStatus::ShutdownTriggered);
        for socket in &self.sockets {
            if let Some(path) = socket.address.strip_prefix("unix:") {
                let _ = std::fs::remove_file(path);
            }
        }
        self.set_life(LifeStatus::Dead);
        tracing::debug!(pid = self.pid, gupid = %self.gupid, "process cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_with(concurrency: i64) -> Process {
        Process::new(
            1,
            "g1".into(),
            vec![ProcessSocket::new(
                "unix:/tmp/a.sock",
                SocketProtocol::Session,
                concurrency,
            )],
        )
    }

    #[test]
    fn unlimited_concurrency_never_totally_busy() {
        let mut p = process_with(0);
        p.session_opened(0, Instant::now());
        assert!(!p.is_totally_busy());
        assert!(p.can_be_routed_to());
    }

    #[test]
    fn bounded_concurrency_becomes_totally_busy() {
        let mut p = process_with(1);
        p.session_opened(0, Instant::now());
        assert!(p.is_totally_busy());
        assert!(!p.can_be_routed_to());
    }

    #[test]
    fn busyness_prefers_unlimited_over_busy_bounded() {
        let mut bounded = process_with(1);
        bounded.session_opened(0, Instant::now());
        let unlimited = process_with(0);
        assert!(unlimited.busyness() < bounded.busyness());
    }

    #[test]
    fn session_closed_is_saturating() {
        let mut p = process_with(1);
        p.session_closed(0);
        p.session_closed(0);
        assert_eq!(p.sessions, 0);
        assert_eq!(p.sockets[0].sessions, 0);
    }
}
