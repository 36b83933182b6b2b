//! Crate-wide error hierarchy.
//!
//! [`PoolError`] is the only error type returned across the public API. Internal
//! helper errors ([`ChannelError`], [`ConfigError`]) convert into it via `From`.

use crate::controller::Version;
use std::io;
use thiserror::Error;

/// Errors produced by the pool, a group, a process, or the channel/controller
/// machinery they depend on.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool is at `max` capacity and no idle process could be reclaimed.
    /// Deferrable: the caller is expected to enqueue rather than fail immediately.
    #[error("pool is at full capacity ({used}/{max})")]
    PoolAtFullCapacity { used: usize, max: usize },

    /// A group hit its own `max_processes` limit.
    #[error("group '{group}' reached its upper process limit ({max})")]
    GroupUpperLimitReached { group: String, max: usize },

    /// `get_waitlist` (or the pool's global waitlist) was already at
    /// `max_request_queue_size` when a new request arrived.
    #[error("request queue full for '{group}' ({size} waiting)")]
    RequestQueueFull { group: String, size: usize },

    /// Spawning a worker failed. Terminal only when the owning group has zero
    /// processes left; otherwise the spawn loop just logs and continues.
    #[error("failed to spawn worker for '{group}': {source}")]
    Spawn {
        group: String,
        #[source]
        source: io::Error,
    },

    /// Writing to a worker's socket failed mid-request.
    #[error("write to worker socket failed (pid {pid}): {source}")]
    AppSocketWrite {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// Reading from a worker's socket failed mid-request.
    #[error("read from worker socket failed (pid {pid}): {source}")]
    AppSocketRead {
        pid: u32,
        #[source]
        source: io::Error,
    },

    /// The client connection broke or was closed before a response completed.
    #[error("client socket error: {source}")]
    ClientSocket {
        #[source]
        source: io::Error,
    },

    /// A connect/start/read timeout elapsed.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The spawn loop noticed `restarts_initiated` changed underneath it.
    /// Never surfaced past the group boundary; logged at `debug` and swallowed.
    #[error("spawn aborted by a concurrent restart")]
    RestartAbortedSpawn,

    /// A [`FileBufferedChannel`](crate::channel::FileBufferedChannel) I/O failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A [`PoolConfig`](crate::config::PoolConfig)/[`GroupOptions`](crate::config::GroupOptions)
    /// validation failure. Always raised at construction time, never mid-flight.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors internal to [`FileBufferedChannel`](crate::channel::FileBufferedChannel).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A `feed()` call would push `bytes_buffered` past the 32 MiB hard cap.
    #[error("channel capacity exceeded (would reach {attempted} bytes, cap is {cap})")]
    CapacityExceeded { attempted: usize, cap: usize },

    /// A read or write syscall on the spill file failed.
    #[error("spill file I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while building or loading [`PoolConfig`](crate::config::PoolConfig)
/// or [`GroupOptions`](crate::config::GroupOptions).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("'{field}' must be at least {min}, got {got}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        got: u64,
    },

    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for env var '{var}': {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Malformed-client-input kinds the controller can reject a request for,
/// each carrying its own pre-rendered HTTP/1.1 and HTTP/1.0 response.
macro_rules! http_errors {
    ($($variant:ident => $status:expr, $reason:expr, $body:expr;)*) => {
        #[derive(Debug)]
        pub enum HttpErrorKind {
            $($variant,)*
            Io(io::Error),
        }

        impl HttpErrorKind {
            /// Renders this error as a full HTTP response for `version`.
            /// `Io` has no fixed wire form of its own: the controller just
            /// drops the connection instead of rendering a response for it.
            pub fn render(&self, version: Version) -> Option<Vec<u8>> {
                let (status, reason, body): (u16, &str, &str) = match self {
                    $(Self::$variant => ($status, $reason, $body),)*
                    Self::Io(_) => return None,
                };
                let proto = match version {
                    Version::Http11 => "HTTP/1.1",
                    Version::Http10 => "HTTP/1.0",
                };
                Some(
                    format!(
                        "{proto} {status} {reason}\r\n\
                         Content-Type: text/plain\r\n\
                         Content-Length: {}\r\n\
                         Connection: close\r\n\r\n{body}",
                        body.len()
                    )
                    .into_bytes(),
                )
            }
        }
    };
}

http_errors! {
    InvalidMethod => 400, "Bad Request", "invalid request method";
    InvalidUrl => 400, "Bad Request", "invalid request target";
    UnsupportedVersion => 505, "HTTP Version Not Supported", "unsupported HTTP version";
    InvalidHeader => 400, "Bad Request", "malformed header";
    TooManyHeaders => 431, "Request Header Fields Too Large", "too many headers";
    InvalidContentLength => 400, "Bad Request", "invalid Content-Length";
    BodyTooLarge => 413, "Payload Too Large", "request body too large";
    ServiceUnavailable => 503, "Service Unavailable", "no worker process available";
}

impl std::fmt::Display for HttpErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for HttpErrorKind {}

impl From<io::Error> for HttpErrorKind {
    fn from(source: io::Error) -> Self {
        Self::Io(source)
    }
}
