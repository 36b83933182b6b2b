//! Launches worker processes and speaks their socket-advertisement handshake.

use crate::{
    config::GroupOptions,
    error::PoolError,
    gupid,
    process::{Process, ProcessSocket, SocketProtocol},
};
use std::{future::Future, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time::timeout,
};

/// A freshly spawned worker, before it's attached to a [`Group`](crate::group::Group).
pub struct SpawnedProcess {
    pub pid: u32,
    pub gupid: String,
    pub sockets: Vec<ProcessSocket>,
    child: Child,
}

impl SpawnedProcess {
    /// Builds a descriptor for a worker a custom [`Spawner`] impl already
    /// launched. `child` is kept only long enough for the pool to hand the
    /// pid off to a [`Process`]; it is dropped (without killing anything,
    /// see the note in [`CommandSpawner::spawn`]) once attached.
    pub fn new(pid: u32, gupid: impl Into<String>, sockets: Vec<ProcessSocket>, child: Child) -> Self {
        Self {
            pid,
            gupid: gupid.into(),
            sockets,
            child,
        }
    }

    pub(crate) fn into_process(self) -> (Process, Child) {
        (Process::new(self.pid, self.gupid, self.sockets), self.child)
    }
}

/// Launches a worker given per-group options and returns its process descriptor.
///
/// Implement this to plug in a container-based, remote, or language-specific
/// spawner; the crate ships [`CommandSpawner`] as the reference implementation.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        options: &GroupOptions,
    ) -> impl Future<Output = Result<SpawnedProcess, PoolError>> + Send;
}

/// Execs `options.start_command` and reads its socket-advertisement handshake
/// off stdout: one `key: value` line per fact, terminated by a blank line,
/// e.g. `socket: session unix:/tmp/app.sock 1\n\n`. Anything after the blank
/// line is ordinary log output and is not parsed.
pub struct CommandSpawner {
    pub connect_password: String,
    pub start_timeout: Duration,
}

impl CommandSpawner {
    pub fn new(connect_password: impl Into<String>, start_timeout: Duration) -> Self {
        Self {
            connect_password: connect_password.into(),
            start_timeout,
        }
    }
}

impl Spawner for CommandSpawner {
    fn spawn(
        &self,
        options: &GroupOptions,
    ) -> impl Future<Output = Result<SpawnedProcess, PoolError>> + Send {
        async move {
            let Some((program, args)) = options.start_command.split_first() else {
                return Err(PoolError::Spawn {
                    group: options.app_group_name.clone(),
                    source: std::io::Error::other("GroupOptions::start_command is empty"),
                });
            };

            // No `kill_on_drop`: once attached, the worker's lifetime is
            // owned by `Process` via its pid (signal-0 probing, SIGTERM/
            // SIGKILL through `trigger_shutdown`/the detached-process
            // reaper), not by this `Child` handle, which `drive_spawn_loop`
            // drops right after attaching. Tokio's orphan queue still reaps
            // the exit status in the background; it just won't kill it.
            let mut child = Command::new(program)
                .args(args)
                .current_dir(&options.app_root)
                .env("PASSENGER_CONNECT_PASSWORD", &self.connect_password)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|source| PoolError::Spawn {
                    group: options.app_group_name.clone(),
                    source,
                })?;

            let pid = child.id().ok_or_else(|| PoolError::Spawn {
                group: options.app_group_name.clone(),
                source: std::io::Error::other("child exited before reporting a pid"),
            })?;

            let stdout = child.stdout.take().expect("stdout was piped");
            let sockets = timeout(self.start_timeout, read_handshake(stdout))
                .await
                .map_err(|_| PoolError::Spawn {
                    group: options.app_group_name.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "worker did not complete handshake in time",
                    ),
                })?
                .map_err(|source| PoolError::Spawn {
                    group: options.app_group_name.clone(),
                    source,
                })?;

            if sockets.is_empty() {
                return Err(PoolError::Spawn {
                    group: options.app_group_name.clone(),
                    source: std::io::Error::other("worker advertised no sockets"),
                });
            }

            Ok(SpawnedProcess {
                pid,
                gupid: gupid::generate(),
                sockets,
                child,
            })
        }
    }
}

async fn read_handshake(
    stdout: tokio::process::ChildStdout,
) -> std::io::Result<Vec<ProcessSocket>> {
    let mut lines = BufReader::new(stdout).lines();
    let mut sockets = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim() == "socket" {
            if let Some(socket) = parse_socket_fact(value.trim()) {
                sockets.push(socket);
            }
        }
    }

    Ok(sockets)
}

/// Parses `"<protocol> <address> <concurrency>"`, e.g. `"session unix:/tmp/app.sock 1"`.
fn parse_socket_fact(fact: &str) -> Option<ProcessSocket> {
    let mut parts = fact.split_whitespace();
    let protocol = match parts.next()? {
        "session" => SocketProtocol::Session,
        "http" => SocketProtocol::Http,
        _ => return None,
    };
    let address = parts.next()?.to_string();
    let concurrency = parts.next()?.parse().ok()?;
    Some(ProcessSocket::new(address, protocol, concurrency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_socket_fact() {
        let s = parse_socket_fact("session unix:/tmp/app.sock 1").unwrap();
        assert_eq!(s.address, "unix:/tmp/app.sock");
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.protocol, SocketProtocol::Session);
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(parse_socket_fact("carrier-pigeon unix:/tmp/a 1").is_none());
    }
}
