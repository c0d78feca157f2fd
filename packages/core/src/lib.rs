//! Peerstore core -- record model, composite-key digests, and the wire protocol.
//!
//! This crate is the foundation layer shared by the service and the client
//! library; it performs no I/O of its own:
//!
//! - **Identity** ([`identity`]): fixed 32-byte [`PeerId`]
//! - **Records** ([`record`]): [`Record`], [`Expiry`], [`StoreOption`]
//! - **Hash** ([`hash`]): SHA-512 [`KeyHash`] over the `(subsystem, peer, key)` composite key
//! - **Wire** ([`wire`]): length-prefixed typed frames, record payload layout, [`FrameCodec`]

pub mod hash;
pub mod identity;
pub mod record;
pub mod wire;

// Identity
pub use identity::{InvalidPeerId, PeerId};

// Records
pub use record::{Expiry, Record, StoreOption};

// Hash
pub use hash::KeyHash;

// Wire
pub use wire::{Frame, FrameCodec, MessageType, ParseError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn public_surface_is_reexported() {
        let peer = PeerId::from_bytes([1; 32]);
        let hash = KeyHash::of("subsystem", &peer, "key");
        let record = Record {
            subsystem: "subsystem".to_string(),
            peer: Some(peer),
            key: Some("key".to_string()),
            value: Vec::new(),
            expiry: Expiry::NEVER,
            option: StoreOption::Multiple,
        };
        assert_eq!(record.key_hash(), Some(hash));
    }
}
