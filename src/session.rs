//! One in-flight attachment of a client request to a process's socket.

use crate::pool::{drive_spawn_loop, PoolInner};
use crate::process::{ProcessId, ProcessSocket, SocketProtocol};
use crate::spawner::Spawner;
use std::sync::{Arc, Mutex};

/// A handle `{process, socket}` held for the lifetime of one request.
///
/// Dropping a `Session` calls back into the owning
/// [`Process::session_closed`](crate::process::Process) exactly once, which
/// frees the routing slot and may wake a waiter. The handle is a generational
/// index, not an `Arc`: a `Session` must not keep its `Process` alive past
/// pool shutdown.
pub struct Session<Sp: Spawner + Send + Sync + 'static> {
    pool: Arc<Mutex<PoolInner<Sp>>>,
    group_name: String,
    process_id: ProcessId,
    socket_index: usize,
    address: String,
    protocol: SocketProtocol,
    sticky_session_id: u64,
    closed: bool,
}

impl<Sp: Spawner + Send + Sync + 'static> Session<Sp> {
    pub(crate) fn new(
        pool: Arc<Mutex<PoolInner<Sp>>>,
        group_name: String,
        process_id: ProcessId,
        socket_index: usize,
        socket: &ProcessSocket,
        sticky_session_id: u64,
    ) -> Self {
        Self {
            pool,
            group_name,
            process_id,
            socket_index,
            address: socket.address.clone(),
            protocol: socket.protocol,
            sticky_session_id,
            closed: false,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> SocketProtocol {
        self.protocol
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// The process's sticky-session id, nonzero only when
    /// [`GroupOptions::sticky_sessions`](crate::config::GroupOptions::sticky_sessions)
    /// is enabled. A caller that wants sticky routing surfaces this to the
    /// client (e.g. as a cookie) and echoes it back via
    /// [`GroupOptions::sticky_session_id`] on the next request.
    pub fn sticky_session_id(&self) -> u64 {
        self.sticky_session_id
    }

    fn close_inner(&mut self) {
        if self.closed || self.process_id == ProcessId::NOOP {
            self.closed = true;
            return;
        }
        self.closed = true;

        let mut inner = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        let to_spawn = inner.session_closed(&self.group_name, self.process_id, self.socket_index);
        drop(inner);

        // Spawning is I/O and must happen after the lock is released; a
        // closing session has no request of its own to block on, so any
        // group that needs its spawn loop driven gets one in the background.
        for (group_name, snapshot) in to_spawn {
            tokio::spawn(drive_spawn_loop(Arc::clone(&self.pool), group_name, snapshot));
        }
    }
}

impl<Sp: Spawner + Send + Sync + 'static> Drop for Session<Sp> {
    fn drop(&mut self) {
        self.close_inner();
    }
}
