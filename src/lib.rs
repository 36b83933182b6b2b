//! apppool - process-pool engine for an application-server proxy.
//!
//! Spawns, routes to, and recycles long-running worker processes behind a
//! buffered HTTP front end. A [`Pool`] holds one [`Group`] per application,
//! each managing its own set of [`Process`]es; [`Pool::async_get`] checks
//! out a [`Session`] bound to a process's socket, spawning a new worker on
//! demand when none is free. [`Controller`](controller) drives the
//! per-connection HTTP state machine on top of that.
//!
//! # Quick start
//!
//! ```no_run
//! use apppool::{Pool, PoolConfig, GroupOptions, CommandSpawner};
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() {
//!     let spawner = Arc::new(CommandSpawner::new("secret", Duration::from_secs(10)));
//!     let pool = Pool::new(PoolConfig::default(), spawner);
//!
//!     let mut options = GroupOptions::new("myapp", "/var/www/myapp");
//!     options.start_command = vec!["myapp-server".into()];
//!
//!     let session = pool.async_get(options).await.unwrap();
//!     println!("routed to {}", session.address());
//! }
//! ```
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod group;
pub mod logging;
pub mod pool;
pub mod process;
pub mod session;
pub mod spawner;

pub(crate) mod gupid;

pub use crate::{
    channel::{FileBufferedChannel, Mode, SinkResult},
    config::{GroupOptions, PoolConfig},
    controller::{serve_one_request, HalfClosePolicy, ParsedRequest, Version},
    error::{ChannelError, ConfigError, HttpErrorKind, PoolError},
    group::{DisableOutcome, Group, GroupLife},
    pool::Pool,
    process::{EnabledStatus, LifeStatus, OobwStatus, Process, ProcessId, ProcessSocket, SocketProtocol},
    session::Session,
    spawner::{CommandSpawner, SpawnedProcess, Spawner},
};
