//! SHA-512 digest over the composite key.
//!
//! Watch subscriptions are keyed by this digest rather than by the
//! composite key itself, so its exact construction is part of the wire
//! contract: `subsystem` and `key` each followed by a NUL byte, with the
//! raw 32 peer-identity bytes in between. The NUL terminators keep
//! `("ab", p, "c")` and `("a", p, "bc")` from colliding and must not be
//! dropped.

use std::fmt;

use sha2::{Digest, Sha512};

use crate::identity::PeerId;

/// 512-bit digest of a `(subsystem, peer, key)` composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyHash([u8; Self::LEN]);

impl KeyHash {
    /// Size of the digest in bytes.
    pub const LEN: usize = 64;

    /// Digests a composite key.
    #[must_use]
    pub fn of(subsystem: &str, peer: &PeerId, key: &str) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(subsystem.as_bytes());
        hasher.update([0u8]);
        hasher.update(peer.as_bytes());
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        Self(hasher.finalize().into())
    }

    /// Wraps raw digest bytes (e.g. from a `WATCH` payload).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for KeyHash {
    /// Abbreviated hex form for log lines; the full digest is 128 chars.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}
