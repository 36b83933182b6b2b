//! Layered pool and group configuration.
//!
//! Mirrors the teacher's `ServerLimits`/`ConnLimits` shape: plain documented
//! public fields, a `Default` impl, and a reserved `_priv` field for
//! forward-compatible construction. `PoolConfig` additionally loads from an
//! optional TOML file and from environment variables; merge order is
//! file < env < explicit struct overrides (highest wins).

use crate::error::ConfigError;
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

/// Crate-wide defaults shared by every [`Group`](crate::group::Group).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on `Σ group.capacity_used` (default: `100`).
    pub max: usize,

    /// How long an idle process may sit before it is eligible for GC
    /// (default: `5 minutes`).
    pub max_idle_time: Duration,

    /// Cap on entries in a single group's `get_waitlist` before
    /// [`PoolError::RequestQueueFull`](crate::error::PoolError::RequestQueueFull)
    /// (default: `100`).
    pub max_request_queue_size: usize,

    /// Time allowed to dial a freshly spawned worker's socket (default: `5s`).
    pub connect_timeout: Duration,

    /// Time allowed for a spawned worker to become responsive (default: `10s`).
    pub start_timeout: Duration,

    /// Grace period after `trigger_shutdown` before a process is SIGKILLed
    /// (default: `5s`).
    pub process_shutdown_timeout: Duration,

    /// Poll interval for the detached-process reaper (default: `500ms`).
    pub process_detach_check_interval: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 100,
            max_idle_time: Duration::from_secs(5 * 60),
            max_request_queue_size: 100,
            connect_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(10),
            process_shutdown_timeout: Duration::from_secs(5),
            process_detach_check_interval: Duration::from_millis(500),
            _priv: (),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PoolConfigFile {
    max: Option<usize>,
    max_idle_time_secs: Option<u64>,
    max_request_queue_size: Option<usize>,
    connect_timeout_secs: Option<u64>,
    start_timeout_secs: Option<u64>,
    process_shutdown_timeout_secs: Option<u64>,
    process_detach_check_interval_ms: Option<u64>,
}

impl PoolConfig {
    /// Loads a TOML file, falling back to [`Default`] for any field it omits.
    /// Does not consult environment variables; use [`Self::from_env`] on top
    /// of the result to apply the full file < env layering.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: PoolConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::default();
        if let Some(v) = file.max {
            config.max = v;
        }
        if let Some(v) = file.max_idle_time_secs {
            config.max_idle_time = Duration::from_secs(v);
        }
        if let Some(v) = file.max_request_queue_size {
            config.max_request_queue_size = v;
        }
        if let Some(v) = file.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.start_timeout_secs {
            config.start_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.process_shutdown_timeout_secs {
            config.process_shutdown_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.process_detach_check_interval_ms {
            config.process_detach_check_interval = Duration::from_millis(v);
        }
        config.validate()?;
        Ok(config)
    }

    /// Overlays `PASSENGER_POOL_*` environment variables onto `self`, in place.
    ///
    /// Recognized vars: `PASSENGER_POOL_MAX`, `PASSENGER_POOL_MAX_IDLE_TIME_SECS`,
    /// `PASSENGER_POOL_MAX_REQUEST_QUEUE_SIZE`, `PASSENGER_POOL_CONNECT_TIMEOUT_SECS`,
    /// `PASSENGER_POOL_START_TIMEOUT_SECS`.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_usize("PASSENGER_POOL_MAX")? {
            self.max = v;
        }
        if let Some(v) = env_u64("PASSENGER_POOL_MAX_IDLE_TIME_SECS")? {
            self.max_idle_time = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("PASSENGER_POOL_MAX_REQUEST_QUEUE_SIZE")? {
            self.max_request_queue_size = v;
        }
        if let Some(v) = env_u64("PASSENGER_POOL_CONNECT_TIMEOUT_SECS")? {
            self.connect_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("PASSENGER_POOL_START_TIMEOUT_SECS")? {
            self.start_timeout = Duration::from_secs(v);
        }
        self.validate()?;
        Ok(self)
    }

    /// Builds a config purely from the environment, starting from [`Default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max",
                min: 1,
                got: 0,
            });
        }
        Ok(())
    }
}

fn env_usize(var: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnv {
            var,
            value: "<non-utf8>".into(),
        }),
    }
}

fn env_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnv {
            var,
            value: "<non-utf8>".into(),
        }),
    }
}

/// Per-group spawn configuration, layered on top of [`PoolConfig`] defaults.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Application group name; derived by the controller, or supplied directly.
    pub app_group_name: String,

    /// Filesystem root of the application (passed to the spawner).
    pub app_root: String,

    /// Command line used to start one worker process.
    pub start_command: Vec<String>,

    /// Never spawn below this many processes (restart always respawns at
    /// least this many before declaring the group usable again).
    pub min_processes: usize,

    /// Never spawn above this many processes for this group (default: `6`).
    pub max_processes: usize,

    /// Per-socket concurrency cap passed to the spawned worker
    /// (`0` = unlimited, default: `1`).
    pub socket_concurrency: i64,

    /// Whether sticky sessions are honored for this group (default: `false`).
    pub sticky_sessions: bool,

    /// How often `needs_restart()` may stat `restart.txt` (default: `1s`).
    pub stat_throttle_rate: Duration,

    /// If true, `Group::get` returns a no-op Session bound to a sentinel
    /// process, used only to ensure the group exists (default: `false`).
    pub noop: bool,

    /// Sticky-session id carried by this particular request, `0` = none.
    pub sticky_session_id: u64,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl GroupOptions {
    /// Builds options for `app_group_name`/`app_root` with every other field
    /// at its documented default.
    pub fn new(app_group_name: impl Into<String>, app_root: impl Into<String>) -> Self {
        Self {
            app_group_name: app_group_name.into(),
            app_root: app_root.into(),
            start_command: Vec::new(),
            min_processes: 1,
            max_processes: 6,
            socket_concurrency: 1,
            sticky_sessions: false,
            stat_throttle_rate: Duration::from_secs(1),
            noop: false,
            sticky_session_id: 0,
            _priv: (),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.min_processes > self.max_processes {
            return Err(ConfigError::OutOfRange {
                field: "min_processes",
                min: 0,
                got: self.min_processes as u64,
            });
        }
        if self.max_processes == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_processes",
                min: 1,
                got: 0,
            });
        }
        Ok(())
    }
}
