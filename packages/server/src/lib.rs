//! Peerstore service -- UNIX-socket engine, watcher registry, and storage
//! backends for the peer-attribute store.
//!
//! - **Config** ([`config`]): [`ServiceConfig`] / [`SqliteConfig`]
//! - **Storage** ([`storage`]): the [`Storage`] capability set, SQLite and
//!   in-memory backends, backend selection by name
//! - **Watch** ([`watch`]): digest-keyed [`WatcherRegistry`] fan-out
//! - **Engine** ([`engine`]): accept loop, request dispatch, expiry
//!   sweeper, drain-based shutdown
//! - **Connection/Shutdown** ([`connection`], [`shutdown`]): per-client
//!   handles and lifecycle sequencing

pub mod config;
pub mod connection;
pub mod engine;
pub mod shutdown;
pub mod storage;
pub mod watch;

pub use config::{ServiceConfig, SqliteConfig};
pub use connection::{ClientId, ConnectionHandle, ConnectionRegistry};
pub use engine::{Engine, EngineError};
pub use shutdown::{EngineState, ShutdownController};
pub use storage::{
    open_backend, BackendKind, IterateQuery, MemoryStorage, SqliteStorage, Storage, StorageError,
};
pub use watch::WatcherRegistry;
