//! The record model: attribute records keyed by `(subsystem, peer, key)`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::KeyHash;
use crate::identity::PeerId;

/// Absolute expiration time in microseconds since the Unix epoch.
///
/// [`Expiry::NEVER`] marks a record that only a `Replace` store can remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Expiry(u64);

impl Expiry {
    /// A record that never expires.
    pub const NEVER: Self = Self(u64::MAX);

    /// Wraps an absolute epoch-microsecond timestamp.
    #[must_use]
    pub const fn from_unix_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// The current time, suitable as the `now` argument of an expiry sweep.
    ///
    /// A clock before the Unix epoch is treated as the epoch itself.
    #[must_use]
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX));
        Self(micros)
    }

    /// The raw epoch-microsecond value.
    #[must_use]
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Whether a record carrying this expiry is dead at time `now`.
    #[must_use]
    pub const fn is_expired_at(&self, now: Self) -> bool {
        self.0 < now.0
    }
}

impl fmt::Display for Expiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NEVER {
            f.write_str("never")
        } else {
            write!(f, "{}us", self.0)
        }
    }
}

/// Controls how a store interacts with records already under the same
/// composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOption {
    /// Keep existing records; multiple records may share the composite key.
    Multiple,
    /// Delete existing records under the composite key before inserting.
    Replace,
}

impl StoreOption {
    /// Wire discriminant of this option.
    #[must_use]
    pub const fn to_wire(self) -> u8 {
        match self {
            Self::Multiple => 0,
            Self::Replace => 1,
        }
    }

    /// Parses a wire discriminant back into an option.
    #[must_use]
    pub const fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Multiple),
            1 => Some(Self::Replace),
            _ => None,
        }
    }
}

/// A single peer-attribute record.
///
/// `peer` and `key` are optional because the same shape doubles as an
/// iteration query, where either acts as a wildcard when absent. Writes
/// require the full composite key; see [`Record::composite_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Logical owner of the record (a transport, a DHT layer, ...).
    pub subsystem: String,
    /// Identity of the peer the attribute describes.
    pub peer: Option<PeerId>,
    /// Attribute name within the subsystem.
    pub key: Option<String>,
    /// Opaque payload; may be empty but is always present.
    pub value: Vec<u8>,
    /// Absolute expiration time.
    pub expiry: Expiry,
    /// Replace-or-accumulate behavior on store.
    pub option: StoreOption,
}

impl Record {
    /// Returns `(subsystem, peer, key)` when the record carries a full,
    /// non-empty composite key, as every write must.
    #[must_use]
    pub fn composite_key(&self) -> Option<(&str, &PeerId, &str)> {
        if self.subsystem.is_empty() {
            return None;
        }
        let peer = self.peer.as_ref()?;
        let key = self.key.as_deref().filter(|k| !k.is_empty())?;
        Some((self.subsystem.as_str(), peer, key))
    }

    /// Digest of the composite key, if the record carries one.
    #[must_use]
    pub fn key_hash(&self) -> Option<KeyHash> {
        self.composite_key()
            .map(|(subsystem, peer, key)| KeyHash::of(subsystem, peer, key))
    }
}
