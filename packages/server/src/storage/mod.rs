//! Storage backends for the peerstore service.
//!
//! Defines the [`Storage`] capability set the engine consumes —
//! `store` / `iterate` / `expire` — and the compile-time backend
//! enumeration used to select an implementation by configuration string:
//!
//! - [`SqliteStorage`]: persistent, single-file SQLite backend
//! - [`MemoryStorage`]: ephemeral in-memory backend for tests and
//!   throwaway deployments
//!
//! Iteration is streaming: matching records arrive through a bounded
//! channel as owned values, and the channel closing is the end-of-stream
//! signal. A trailing `Err` item reports a backend failure mid-stream.

pub mod memory;
pub mod sqlite;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use peerstore_core::{Expiry, PeerId, Record};
use tokio::sync::mpsc;

use crate::config::ServiceConfig;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Bounded capacity of the per-iteration row channel.
pub(crate) const ITERATE_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced by storage backends.
///
/// The engine forwards the display string to the requesting client as the
/// protocol-level error message; none of these abort the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be opened.
    #[error("failed to open backend: {0}")]
    Open(String),
    /// A statement could not be prepared or its parameters bound.
    #[error("bind failed: {0}")]
    Bind(String),
    /// A statement failed while executing or stepping rows.
    #[error("step failed: {0}")]
    Step(String),
    /// The backend has shut down and accepts no further requests.
    #[error("storage backend is closed")]
    Closed,
    /// The configured backend name is not compiled in.
    #[error("unknown storage backend {0:?}")]
    UnknownBackend(String),
}

/// A record-selection query: `subsystem` is mandatory, `peer` and `key`
/// act as wildcards when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterateQuery {
    /// Subsystem whose records are selected.
    pub subsystem: String,
    /// Restrict to one peer identity, or match all peers.
    pub peer: Option<PeerId>,
    /// Restrict to one attribute key, or match all keys.
    pub key: Option<String>,
}

/// The capability set the engine consumes from a backend.
///
/// Used as `Arc<dyn Storage>`. Returning from a method means the request
/// was accepted and completed; backends queue internally so callers never
/// block the scheduler on database I/O.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists a record. With [`peerstore_core::StoreOption::Replace`],
    /// records under the same composite key are deleted first, in the same
    /// serialized operation.
    async fn store(&self, record: &Record) -> Result<(), StorageError>;

    /// Streams records matching `query` in storage order.
    ///
    /// The returned channel yields owned records; closure without a
    /// trailing `Err` item is a clean end-of-stream.
    async fn iterate(
        &self,
        query: IterateQuery,
    ) -> Result<mpsc::Receiver<Result<Record, StorageError>>, StorageError>;

    /// Deletes every record with `expiry < now`, returning the count.
    async fn expire(&self, now: Expiry) -> Result<u64, StorageError>;
}

/// The backends compiled into this build.
///
/// The original design loaded backends dynamically by name; a fixed
/// enumeration selected by configuration string provides the same
/// behavior without late binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Single-file SQLite backend.
    Sqlite,
    /// In-memory backend.
    Memory,
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(StorageError::UnknownBackend(other.to_string())),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => f.write_str("sqlite"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Opens the backend selected by `kind`, wiring in its section of the
/// service configuration.
///
/// # Errors
///
/// [`StorageError::Open`] when the backend cannot be initialized.
pub fn open_backend(
    kind: BackendKind,
    config: &ServiceConfig,
) -> Result<Arc<dyn Storage>, StorageError> {
    match kind {
        BackendKind::Sqlite => Ok(Arc::new(SqliteStorage::open(&config.sqlite.filename)?)),
        BackendKind::Memory => Ok(Arc::new(MemoryStorage::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_known_names() {
        assert_eq!("sqlite".parse::<BackendKind>(), Ok(BackendKind::Sqlite));
        assert_eq!("memory".parse::<BackendKind>(), Ok(BackendKind::Memory));
        assert!(matches!(
            "postgres".parse::<BackendKind>(),
            Err(StorageError::UnknownBackend(name)) if name == "postgres"
        ));
    }

    #[test]
    fn backend_kind_display_roundtrip() {
        for kind in [BackendKind::Sqlite, BackendKind::Memory] {
            assert_eq!(kind.to_string().parse::<BackendKind>(), Ok(kind));
        }
    }

    /// Verifies `Arc<dyn Storage>` compiles (object safety).
    #[test]
    fn storage_is_object_safe() {
        fn _assert_object_safe(_: &Arc<dyn Storage>) {}
    }
}
