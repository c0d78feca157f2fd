//! Fixed-size peer identity type.
//!
//! A [`PeerId`] names a node in the overlay. It is an opaque 32-byte value
//! generated elsewhere; this crate only transports, stores, and hashes it.

use std::fmt;
use std::str::FromStr;

/// Error returned when parsing a [`PeerId`] from its hex representation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer identity must be {} hex characters", PeerId::LEN * 2)]
pub struct InvalidPeerId;

/// A fixed 32-byte identifier of a node in the overlay.
///
/// Ordering is lexicographic byte order, which makes `PeerId` usable as a
/// map key. The `Display`/`FromStr` pair round-trips through lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; Self::LEN]);

impl PeerId {
    /// Size of a peer identity in bytes.
    pub const LEN: usize = 32;

    /// Wraps raw identity bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw identity bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = InvalidPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| InvalidPeerId)?;
        let bytes: [u8; Self::LEN] = raw.try_into().map_err(|_| InvalidPeerId)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; PeerId::LEN]> for PeerId {
    fn from(bytes: [u8; PeerId::LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_from_str_roundtrip() {
        let id = PeerId::from_bytes([0xAB; 32]);
        let parsed: PeerId = id.to_string().parse().expect("parse hex id");
        assert_eq!(parsed, id);
    }

    #[test]
    fn from_str_rejects_wrong_length() {
        assert_eq!("abcd".parse::<PeerId>(), Err(InvalidPeerId));
    }

    #[test]
    fn from_str_rejects_non_hex() {
        let s = "zz".repeat(32);
        assert_eq!(s.parse::<PeerId>(), Err(InvalidPeerId));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[0] = 1;
        high[0] = 2;
        assert!(PeerId::from_bytes(low) < PeerId::from_bytes(high));
    }
}
