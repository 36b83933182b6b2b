//! Globally-unique process identifiers.
//!
//! A gupid identifies a [`Process`](crate::process::Process) uniquely across the
//! pool's lifetime, so log lines and sticky-session bookkeeping never confuse a
//! recycled pid with the worker that previously held it.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates a fresh gupid: microseconds since the epoch, base64url-encoded,
/// followed by an 8-byte random suffix for uniqueness within the same tick.
pub(crate) fn generate() -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);

    let mut suffix = [0u8; 8];
    rand::rng().fill_bytes(&mut suffix);

    let mut buf = Vec::with_capacity(8 + 8);
    buf.extend_from_slice(&micros.to_be_bytes());
    buf.extend_from_slice(&suffix);

    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_unique_ids() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
