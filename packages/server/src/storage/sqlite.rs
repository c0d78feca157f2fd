//! SQLite [`Storage`] backend.
//!
//! A dedicated actor thread owns the `rusqlite::Connection`; the async
//! trait methods hand commands to it over a channel and await the reply.
//! This keeps all SQL strictly serialized — handler statements and the
//! expiry sweeper never interleave — and keeps blocking database work off
//! the runtime threads.
//!
//! Durability note: `synchronous = OFF` trades crash durability for write
//! latency. Stored records can be lost on power failure; callers must
//! treat the store as a best-effort cache of locally known peer
//! attributes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use peerstore_core::{Expiry, PeerId, Record, StoreOption};
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};

use super::{IterateQuery, Storage, StorageError, ITERATE_CHANNEL_CAPACITY};

const CREATE_SQL: &str = "CREATE TABLE IF NOT EXISTS peerstore_records (
    subsystem TEXT NOT NULL,
    peer BLOB NOT NULL,
    key TEXT NOT NULL,
    value BLOB,
    expiry INTEGER NOT NULL
)";

const CREATE_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_peerstore_composite
    ON peerstore_records (subsystem, peer, key)";

const INSERT_SQL: &str = "INSERT INTO peerstore_records (subsystem, peer, key, value, expiry)
    VALUES (?1, ?2, ?3, ?4, ?5)";

const SELECT_BY_SUBSYSTEM_SQL: &str = "SELECT subsystem, peer, key, value, expiry
    FROM peerstore_records WHERE subsystem = ?1";

const SELECT_BY_PEER_SQL: &str = "SELECT subsystem, peer, key, value, expiry
    FROM peerstore_records WHERE subsystem = ?1 AND peer = ?2";

const SELECT_BY_KEY_SQL: &str = "SELECT subsystem, peer, key, value, expiry
    FROM peerstore_records WHERE subsystem = ?1 AND key = ?2";

const SELECT_BY_PEER_KEY_SQL: &str = "SELECT subsystem, peer, key, value, expiry
    FROM peerstore_records WHERE subsystem = ?1 AND peer = ?2 AND key = ?3";

const DELETE_BY_KEY_SQL: &str = "DELETE FROM peerstore_records
    WHERE subsystem = ?1 AND peer = ?2 AND key = ?3";

const DELETE_EXPIRED_SQL: &str = "DELETE FROM peerstore_records WHERE expiry < ?1";

/// The statements warmed into the cache at open. `prepare_cached` re-binds
/// and resets each one around every subsequent use.
const PREPARED_SQL: [&str; 7] = [
    INSERT_SQL,
    SELECT_BY_SUBSYSTEM_SQL,
    SELECT_BY_PEER_SQL,
    SELECT_BY_KEY_SQL,
    SELECT_BY_PEER_KEY_SQL,
    DELETE_BY_KEY_SQL,
    DELETE_EXPIRED_SQL,
];

enum Command {
    Store {
        record: Record,
        reply: oneshot::Sender<Result<(), StorageError>>,
    },
    Iterate {
        query: IterateQuery,
        rows: mpsc::Sender<Result<Record, StorageError>>,
    },
    Expire {
        now: Expiry,
        reply: oneshot::Sender<Result<u64, StorageError>>,
    },
}

/// SQLite-backed [`Storage`], persisted in a single file.
pub struct SqliteStorage {
    commands: mpsc::Sender<Command>,
}

impl SqliteStorage {
    /// Opens (creating if necessary) the database at `path`, applies the
    /// tuning PRAGMAs, ensures the schema, warms the statement cache, and
    /// starts the actor thread.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// [`StorageError::Open`] when the file or its parents cannot be
    /// created, or when schema setup fails.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::Open(format!("{}: {err}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|err| StorageError::Open(format!("{}: {err}", path.display())))?;
        configure(&conn).map_err(|err| StorageError::Open(err.to_string()))?;

        let (tx, rx) = mpsc::channel(32);
        std::thread::Builder::new()
            .name("peerstore-sqlite".to_string())
            .spawn(move || actor_loop(&conn, rx))
            .map_err(|err| StorageError::Open(format!("actor thread: {err}")))?;

        tracing::info!(path = %path.display(), "sqlite backend open");
        Ok(Self { commands: tx })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn store(&self, record: &Record) -> Result<(), StorageError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Store {
                record: record.clone(),
                reply,
            })
            .await
            .map_err(|_| StorageError::Closed)?;
        result.await.map_err(|_| StorageError::Closed)?
    }

    async fn iterate(
        &self,
        query: IterateQuery,
    ) -> Result<mpsc::Receiver<Result<Record, StorageError>>, StorageError> {
        let (rows, results) = mpsc::channel(ITERATE_CHANNEL_CAPACITY);
        self.commands
            .send(Command::Iterate { query, rows })
            .await
            .map_err(|_| StorageError::Closed)?;
        Ok(results)
    }

    async fn expire(&self, now: Expiry) -> Result<u64, StorageError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Expire { now, reply })
            .await
            .map_err(|_| StorageError::Closed)?;
        result.await.map_err(|_| StorageError::Closed)?
    }
}

/// PRAGMAs, schema, and statement-cache warmup.
///
/// `page_size`, `encoding`, and `auto_vacuum` must precede table creation
/// to take effect on a fresh file.
fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "page_size", 4096)?;
    conn.pragma_update(None, "encoding", "UTF-8")?;
    conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    conn.busy_timeout(Duration::from_millis(1000))?;

    conn.execute(CREATE_SQL, [])?;
    conn.execute(CREATE_INDEX_SQL, [])?;

    conn.set_prepared_statement_cache_capacity(PREPARED_SQL.len() * 2);
    for sql in PREPARED_SQL {
        conn.prepare_cached(sql)?;
    }
    Ok(())
}

fn actor_loop(conn: &Connection, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Store { record, reply } => {
                let _ = reply.send(handle_store(conn, &record));
            }
            Command::Iterate { query, rows } => {
                if let Err(err) = handle_iterate(conn, &query, &rows) {
                    // Stream the failure; dropping `rows` afterwards ends
                    // the stream.
                    let _ = rows.blocking_send(Err(err));
                }
            }
            Command::Expire { now, reply } => {
                let _ = reply.send(handle_expire(conn, now));
            }
        }
    }
    tracing::debug!("sqlite actor shut down");
}

fn handle_store(conn: &Connection, record: &Record) -> Result<(), StorageError> {
    let (subsystem, peer, key) = record
        .composite_key()
        .ok_or_else(|| StorageError::Bind("record is missing subsystem, peer, or key".into()))?;

    if record.option == StoreOption::Replace {
        let mut delete = conn.prepare_cached(DELETE_BY_KEY_SQL).map_err(bind_err)?;
        delete
            .execute(params![subsystem, peer.as_bytes().as_slice(), key])
            .map_err(step_err)?;
    }

    let mut insert = conn.prepare_cached(INSERT_SQL).map_err(bind_err)?;
    insert
        .execute(params![
            subsystem,
            peer.as_bytes().as_slice(),
            key,
            record.value,
            expiry_to_db(record.expiry),
        ])
        .map_err(step_err)?;
    Ok(())
}

fn handle_iterate(
    conn: &Connection,
    query: &IterateQuery,
    rows: &mpsc::Sender<Result<Record, StorageError>>,
) -> Result<(), StorageError> {
    let peer_bytes = query.peer.map(|peer| peer.as_bytes().to_vec());
    let (sql, params): (&str, Vec<&dyn rusqlite::ToSql>) =
        match (peer_bytes.as_ref(), query.key.as_ref()) {
            (None, None) => (SELECT_BY_SUBSYSTEM_SQL, vec![&query.subsystem]),
            (Some(peer), None) => (SELECT_BY_PEER_SQL, vec![&query.subsystem, peer]),
            (None, Some(key)) => (SELECT_BY_KEY_SQL, vec![&query.subsystem, key]),
            (Some(peer), Some(key)) => {
                (SELECT_BY_PEER_KEY_SQL, vec![&query.subsystem, peer, key])
            }
        };

    let mut statement = conn.prepare_cached(sql).map_err(bind_err)?;
    let mut cursor = statement.query(params.as_slice()).map_err(bind_err)?;
    while let Some(row) = cursor.next().map_err(step_err)? {
        // Copy into an owned record before it crosses the channel; row
        // references die on the next cursor step.
        let record = row_to_record(row)?;
        if rows.blocking_send(Ok(record)).is_err() {
            break; // consumer went away
        }
    }
    Ok(())
}

fn handle_expire(conn: &Connection, now: Expiry) -> Result<u64, StorageError> {
    let mut delete = conn.prepare_cached(DELETE_EXPIRED_SQL).map_err(bind_err)?;
    let deleted = delete
        .execute(params![expiry_to_db(now)])
        .map_err(step_err)?;
    Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<Record, StorageError> {
    let subsystem: String = row.get(0).map_err(step_err)?;
    let peer_blob: Vec<u8> = row.get(1).map_err(step_err)?;
    let key: String = row.get(2).map_err(step_err)?;
    let value: Option<Vec<u8>> = row.get(3).map_err(step_err)?;
    let expiry: i64 = row.get(4).map_err(step_err)?;

    let peer_bytes: [u8; PeerId::LEN] = peer_blob
        .try_into()
        .map_err(|_| StorageError::Step("peer column is not 32 bytes".into()))?;

    Ok(Record {
        subsystem,
        peer: Some(PeerId::from_bytes(peer_bytes)),
        key: Some(key),
        value: value.unwrap_or_default(),
        expiry: expiry_from_db(expiry),
        // The store option is write-time behavior and is not persisted.
        option: StoreOption::Multiple,
    })
}

/// SQLite integers are signed 64-bit; expiries at or beyond `i64::MAX`
/// microseconds (the "never" sentinel included) are clamped to `i64::MAX`.
fn expiry_to_db(expiry: Expiry) -> i64 {
    i64::try_from(expiry.as_micros()).unwrap_or(i64::MAX)
}

fn expiry_from_db(raw: i64) -> Expiry {
    if raw == i64::MAX {
        return Expiry::NEVER;
    }
    Expiry::from_unix_micros(u64::try_from(raw).unwrap_or(0))
}

fn bind_err(err: rusqlite::Error) -> StorageError {
    StorageError::Bind(err.to_string())
}

fn step_err(err: rusqlite::Error) -> StorageError {
    StorageError::Step(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 32])
    }

    fn record(
        subsystem: &str,
        peer_id: PeerId,
        key: &str,
        value: &[u8],
        option: StoreOption,
    ) -> Record {
        Record {
            subsystem: subsystem.to_string(),
            peer: Some(peer_id),
            key: Some(key.to_string()),
            value: value.to_vec(),
            expiry: Expiry::NEVER,
            option,
        }
    }

    fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = SqliteStorage::open(&dir.path().join("peerstore.sqlite")).expect("open");
        (dir, storage)
    }

    async fn collect(
        storage: &SqliteStorage,
        query: IterateQuery,
    ) -> Vec<Record> {
        let mut rows = storage.iterate(query).await.expect("iterate accepted");
        let mut out = Vec::new();
        while let Some(item) = rows.recv().await {
            out.push(item.expect("row"));
        }
        out
    }

    fn query(subsystem: &str, peer: Option<PeerId>, key: Option<&str>) -> IterateQuery {
        IterateQuery {
            subsystem: subsystem.to_string(),
            peer,
            key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn replace_then_multiple_then_replace() {
        let (_dir, storage) = open_temp();
        let p = peer(1);

        // One REPLACE store -> exactly one record.
        storage
            .store(&record("t", p, "k", b"v1", StoreOption::Replace))
            .await
            .expect("store v1");
        let rows = collect(&storage, query("t", Some(p), Some("k"))).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"v1");

        // MULTIPLE accumulates alongside the existing record.
        storage
            .store(&record("t", p, "k", b"v2-", StoreOption::Multiple))
            .await
            .expect("store v2-");
        let rows = collect(&storage, query("t", Some(p), Some("k"))).await;
        let mut values: Vec<&[u8]> = rows.iter().map(|r| r.value.as_slice()).collect();
        values.sort_unstable();
        assert_eq!(values, vec![b"v1".as_slice(), b"v2-".as_slice()]);

        // REPLACE collapses the family back to one record.
        storage
            .store(&record("t", p, "k", b"v3--", StoreOption::Replace))
            .await
            .expect("store v3--");
        let rows = collect(&storage, query("t", Some(p), Some("k"))).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"v3--");
    }

    #[tokio::test]
    async fn iterate_filters_by_peer_and_key() {
        let (_dir, storage) = open_temp();
        let p1 = peer(1);
        let p2 = peer(2);

        for (pid, key, value) in [
            (p1, "a", b"1".as_slice()),
            (p1, "b", b"2".as_slice()),
            (p2, "a", b"3".as_slice()),
        ] {
            storage
                .store(&record("t", pid, key, value, StoreOption::Multiple))
                .await
                .expect("store");
        }
        storage
            .store(&record("other", p1, "a", b"x", StoreOption::Multiple))
            .await
            .expect("store other subsystem");

        assert_eq!(collect(&storage, query("t", None, None)).await.len(), 3);
        assert_eq!(collect(&storage, query("t", Some(p1), None)).await.len(), 2);
        assert_eq!(collect(&storage, query("t", None, Some("a"))).await.len(), 2);

        let exact = collect(&storage, query("t", Some(p2), Some("a"))).await;
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].value, b"3");
        assert_eq!(exact[0].peer, Some(p2));

        assert!(collect(&storage, query("absent", None, None)).await.is_empty());
    }

    #[tokio::test]
    async fn expire_removes_only_dead_records() {
        let (_dir, storage) = open_temp();
        let p = peer(7);
        let now = Expiry::from_unix_micros(1_000_000);

        let mut dead = record("t", p, "dead", b"old", StoreOption::Multiple);
        dead.expiry = Expiry::from_unix_micros(999_999); // now - 1us
        storage.store(&dead).await.expect("store dead");

        let mut alive = record("t", p, "alive", b"new", StoreOption::Multiple);
        alive.expiry = Expiry::from_unix_micros(2_000_000);
        storage.store(&alive).await.expect("store alive");

        let deleted = storage.expire(now).await.expect("expire");
        assert_eq!(deleted, 1);

        let rows = collect(&storage, query("t", Some(p), None)).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.as_deref(), Some("alive"));

        // A second sweep finds nothing further.
        assert_eq!(storage.expire(now).await.expect("expire again"), 0);
    }

    #[tokio::test]
    async fn never_expiring_records_survive_any_sweep() {
        let (_dir, storage) = open_temp();
        let p = peer(3);
        storage
            .store(&record("t", p, "k", b"v", StoreOption::Replace))
            .await
            .expect("store");

        let deleted = storage
            .expire(Expiry::from_unix_micros(u64::MAX - 1))
            .await
            .expect("expire");
        assert_eq!(deleted, 0);

        let rows = collect(&storage, query("t", Some(p), Some("k"))).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].expiry, Expiry::NEVER);
    }

    #[tokio::test]
    async fn records_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peerstore.sqlite");
        let p = peer(9);

        {
            let storage = SqliteStorage::open(&path).expect("first open");
            storage
                .store(&record("t", p, "k", b"persisted", StoreOption::Replace))
                .await
                .expect("store");
        } // actor thread winds down with the handle

        let storage = SqliteStorage::open(&path).expect("reopen");
        let rows = collect(&storage, query("t", Some(p), Some("k"))).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"persisted");
    }

    #[tokio::test]
    async fn store_without_full_key_is_a_bind_error() {
        let (_dir, storage) = open_temp();
        let mut incomplete = record("t", peer(1), "k", b"v", StoreOption::Replace);
        incomplete.key = None;

        let err = storage.store(&incomplete).await.unwrap_err();
        assert!(matches!(err, StorageError::Bind(_)));
    }

    #[tokio::test]
    async fn empty_value_roundtrips() {
        let (_dir, storage) = open_temp();
        let p = peer(4);
        storage
            .store(&record("t", p, "k", b"", StoreOption::Replace))
            .await
            .expect("store");

        let rows = collect(&storage, query("t", Some(p), Some("k"))).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].value.is_empty());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b/peerstore.sqlite");
        let _storage = SqliteStorage::open(&nested).expect("open nested");
        assert!(nested.exists());
    }

    #[test]
    fn expiry_db_mapping_clamps_and_roundtrips() {
        assert_eq!(expiry_from_db(expiry_to_db(Expiry::NEVER)), Expiry::NEVER);
        let t = Expiry::from_unix_micros(123);
        assert_eq!(expiry_from_db(expiry_to_db(t)), t);
        assert_eq!(expiry_from_db(-5), Expiry::from_unix_micros(0));
    }
}
