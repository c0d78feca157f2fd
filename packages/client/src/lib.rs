//! Peerstore client library.
//!
//! [`Client`] talks to the peerstore service over its UNIX socket and
//! hides transport failures: after a disconnect it reconnects with
//! exponential backoff and replays every in-flight watch, iteration, and
//! store. Consumers of an interrupted iteration see a synthetic
//! [`IterateItem::Interrupted`] marker and may then receive records they
//! have already seen (at-least-once delivery).
//!
//! A [`Client::store`] completes when its frame has been handed to the
//! transport; there is no round trip to await. Watches deliver matching
//! records for as long as the [`Watch`] handle is alive.

mod backoff;
mod task;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use peerstore_core::{wire, Expiry, KeyHash, ParseError, PeerId, Record, StoreOption};
use tokio::sync::{mpsc, oneshot};

use task::{Command, ConnectionTask, IterateEvent};

pub use backoff::Backoff;

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the service's UNIX socket.
    pub socket: PathBuf,
    /// Reconnect delay after the immediate first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
}

impl ClientConfig {
    /// Configuration with the default backoff policy.
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Errors surfaced to callers of the client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The operation was dropped by a `disconnect` before completion.
    #[error("operation cancelled by disconnect")]
    Cancelled,
    /// The connection task is gone; the handle is unusable.
    #[error("client connection task is gone")]
    Closed,
    /// The request could not be encoded for the wire.
    #[error(transparent)]
    Wire(#[from] ParseError),
}

/// One item of an [`Iteration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterateItem {
    /// A matching record.
    Record(Record),
    /// The transport dropped mid-stream; the iteration is being replayed
    /// and already-seen records may repeat.
    Interrupted(String),
    /// The service reported a backend error; the iteration is over.
    Failed(String),
}

/// Handle to the peerstore service.
///
/// Cheap to share by reference; all methods take `&self`. Dropping the
/// handle cancels everything still in flight.
#[derive(Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

impl Client {
    /// Creates a handle and starts its connection task.
    ///
    /// The task connects lazily: operations submitted before the first
    /// successful connect are queued and sent once the service is
    /// reachable. Must be called within a tokio runtime.
    #[must_use]
    pub fn connect(config: ClientConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(ConnectionTask::new(config, receiver).run());
        Self {
            commands,
            next_id: AtomicU64::new(1),
        }
    }

    /// Stores a record under `(subsystem, peer, key)`.
    ///
    /// Completes once the frame has been handed to the transport.
    /// Dropping the returned future before completion cancels the
    /// operation client-side; a frame already on the wire still lands in
    /// the service.
    ///
    /// # Errors
    ///
    /// [`ClientError::Wire`] when a field exceeds the wire limits,
    /// [`ClientError::Cancelled`] when a disconnect drops the operation,
    /// [`ClientError::Closed`] when the handle is no longer usable.
    pub async fn store(
        &self,
        subsystem: &str,
        peer: PeerId,
        key: &str,
        value: Vec<u8>,
        expiry: Expiry,
        option: StoreOption,
    ) -> Result<(), ClientError> {
        let record = Record {
            subsystem: subsystem.to_string(),
            peer: Some(peer),
            key: Some(key.to_string()),
            value,
            expiry,
            option,
        };
        let payload = wire::encode_record(&record)?;
        let (done, result) = oneshot::channel();
        self.commands
            .send(Command::Store { payload, done })
            .map_err(|_| ClientError::Closed)?;
        result.await.map_err(|_| ClientError::Closed)?
    }

    /// Starts streaming records of `subsystem`, optionally narrowed to
    /// one peer and/or one key.
    #[must_use]
    pub fn iterate(&self, subsystem: &str, peer: Option<PeerId>, key: Option<&str>) -> Iteration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, receiver) = mpsc::unbounded_channel();
        let query = Record {
            subsystem: subsystem.to_string(),
            peer,
            key: key.map(str::to_string),
            value: Vec::new(),
            expiry: Expiry::NEVER,
            option: StoreOption::Multiple,
        };
        match wire::encode_record(&query) {
            Ok(payload) => {
                let _ = self.commands.send(Command::Iterate {
                    id,
                    payload,
                    events,
                });
            }
            Err(err) => {
                // Fail the stream locally; nothing reached the wire.
                let _ = events.send(IterateEvent::Item(IterateItem::Failed(err.to_string())));
            }
        }
        Iteration {
            id,
            events: receiver,
            commands: self.commands.clone(),
            finished: false,
        }
    }

    /// Subscribes to stores matching `(subsystem, peer, key)`.
    #[must_use]
    pub fn watch(&self, subsystem: &str, peer: PeerId, key: &str) -> Watch {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let digest = KeyHash::of(subsystem, &peer, key);
        let (events, receiver) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Watch {
            id,
            digest,
            events,
        });
        Watch {
            id,
            events: receiver,
            commands: self.commands.clone(),
        }
    }

    /// Shuts the connection down.
    ///
    /// With `sync_first`, teardown waits until every pending store has
    /// been flushed to the service; without it, pending stores complete
    /// with [`ClientError::Cancelled`]. Iterations and watches are always
    /// cancelled immediately. Further operations on this handle fail with
    /// [`ClientError::Closed`].
    pub async fn disconnect(&self, sync_first: bool) {
        let (done, finished) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect {
                flush_stores: sync_first,
                done,
            })
            .is_ok()
        {
            let _ = finished.await;
        }
    }
}

/// A streaming iteration over matching records.
///
/// Dropping the handle detaches the consumer; the service-side stream is
/// drained quietly in the background.
#[derive(Debug)]
pub struct Iteration {
    id: u64,
    events: mpsc::UnboundedReceiver<IterateEvent>,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
}

impl Iteration {
    /// The next item, or `None` once the stream has ended.
    ///
    /// [`IterateItem::Failed`] is terminal; [`IterateItem::Interrupted`]
    /// is not — records (possibly repeats) follow after the replay.
    pub async fn next(&mut self) -> Option<IterateItem> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(IterateEvent::Item(item)) => {
                if matches!(item, IterateItem::Failed(_)) {
                    self.finished = true;
                }
                Some(item)
            }
            Some(IterateEvent::End) | None => {
                self.finished = true;
                None
            }
        }
    }

    /// Cancels the iteration. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for Iteration {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::CancelIterate { id: self.id });
    }
}

/// An active watch subscription.
///
/// Dropping the handle cancels the subscription.
#[derive(Debug)]
pub struct Watch {
    id: u64,
    events: mpsc::UnboundedReceiver<Record>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Watch {
    /// The next matching record, or `None` if the client shut down.
    pub async fn recv(&mut self) -> Option<Record> {
        self.events.recv().await
    }

    /// Cancels the subscription. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for Watch {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::CancelWatch { id: self.id });
    }
}
