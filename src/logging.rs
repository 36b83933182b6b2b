//! Optional `tracing-subscriber` bootstrap for binaries embedding this crate.
//!
//! The library itself only ever emits `tracing` events; nothing in `src/`
//! other than this module touches a subscriber. Call [`init`] once from a
//! `main()`, or install your own subscriber instead.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber reading its filter from `RUST_LOG`, falling
/// back to `info` when unset.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
