//! The service engine: local-socket listener, request dispatch, watcher
//! fan-out, and the expiry sweeper.
//!
//! Each accepted client runs its own task; frames from one client are
//! dispatched strictly in receive order, and a handler completes before
//! the next frame is read. Within a store that means the storage backend
//! reports success first, then watchers are fanned out, then the
//! acknowledgement goes to the originating client.
//!
//! Malformed frames and protocol violations close the offending client
//! only; the engine and its other clients keep running.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerstore_core::{wire, Expiry, Frame, FrameCodec, MessageType};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::config::ServiceConfig;
use crate::connection::{ConnectionHandle, ConnectionRegistry};
use crate::shutdown::{ConnectionGuard, ShutdownController};
use crate::storage::{IterateQuery, Storage};
use crate::watch::WatcherRegistry;

/// Errors that abort engine startup or its accept loop.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The listening socket could not be set up.
    #[error("failed to bind {path}: {source}")]
    Bind {
        /// The configured socket path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// State shared between the accept loop and every connection task.
struct Shared {
    storage: Arc<dyn Storage>,
    watchers: WatcherRegistry,
    connections: ConnectionRegistry,
    shutdown: Arc<ShutdownController>,
    outbound_capacity: usize,
}

/// The peerstore service engine.
///
/// [`Engine::bind`] claims the socket; [`Engine::run`] serves until the
/// shutdown controller is triggered, then drains connected clients and
/// removes the socket file.
pub struct Engine {
    config: ServiceConfig,
    shared: Arc<Shared>,
    listener: UnixListener,
}

impl Engine {
    /// Binds the engine to its configured UNIX socket.
    ///
    /// Missing parent directories are created and a stale socket file
    /// from an earlier run is removed first.
    ///
    /// # Errors
    ///
    /// [`EngineError::Bind`] when directory creation, stale-file removal,
    /// or the bind itself fails.
    pub fn bind(config: ServiceConfig, storage: Arc<dyn Storage>) -> Result<Self, EngineError> {
        let bind_err = |source| EngineError::Bind {
            path: config.socket.clone(),
            source,
        };
        if let Some(parent) = config.socket.parent() {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }
        match std::fs::remove_file(&config.socket) {
            Ok(()) => tracing::debug!(socket = %config.socket.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(bind_err(err)),
        }
        let listener = UnixListener::bind(&config.socket).map_err(bind_err)?;
        tracing::info!(socket = %config.socket.display(), "engine listening");

        let shared = Arc::new(Shared {
            storage,
            watchers: WatcherRegistry::new(),
            connections: ConnectionRegistry::new(),
            shutdown: Arc::new(ShutdownController::new()),
            outbound_capacity: config.outbound_channel_capacity,
        });
        Ok(Self {
            config,
            shared,
            listener,
        })
    }

    /// The shutdown controller; trigger it to begin draining.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shared.shutdown)
    }

    /// Path of the bound socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket
    }

    /// Serves clients until shutdown is triggered, then drains.
    ///
    /// While draining, newly accepted connections receive a structured
    /// rejection; existing clients finish their in-flight request and are
    /// released. The socket file is removed on the way out.
    pub async fn run(self) {
        let Self {
            config,
            shared,
            listener,
        } = self;

        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&shared.storage),
            config.sweep_interval(),
            Arc::clone(&shared.shutdown),
        ));

        let mut shutdown_rx = shared.shutdown.subscribe();
        while !shared.shutdown.is_draining() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => accept_connection(&shared, stream),
                    Err(err) => tracing::warn!(%err, "accept failed"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        // Keep rejecting stragglers while connected clients wind down.
        tracing::info!(
            connected = shared.shutdown.connected_count(),
            "engine draining"
        );
        let drain = shared.shutdown.wait_for_drain(config.drain_timeout());
        tokio::pin!(drain);
        let drained = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, _addr)) = accepted {
                        tokio::spawn(reject_connection(stream));
                    }
                }
                drained = &mut drain => break drained,
            }
        };
        if !drained {
            tracing::warn!(
                connected = shared.shutdown.connected_count(),
                "drain timeout expired; abandoning remaining clients"
            );
        }

        sweeper.abort();
        drop(listener);
        if let Err(err) = std::fs::remove_file(&config.socket) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(%err, "socket cleanup failed");
            }
        }
        tracing::info!("engine stopped");
    }
}

fn accept_connection(shared: &Arc<Shared>, stream: UnixStream) {
    if shared.shutdown.is_draining() {
        tokio::spawn(reject_connection(stream));
        return;
    }
    let (handle, outbound) = shared.connections.register(shared.outbound_capacity);
    let guard = shared.shutdown.connection_guard();
    tracing::debug!(client = %handle.id, "client connected");
    tokio::spawn(run_connection(
        Arc::clone(shared),
        stream,
        handle,
        outbound,
        guard,
    ));
}

/// Tells a client arriving during drain that registration failed.
async fn reject_connection(stream: UnixStream) {
    let mut framed = Framed::new(stream, FrameCodec);
    let frame = Frame::new(
        MessageType::StoreResult,
        wire::encode_store_result(-1, Some("service is draining")),
    );
    if framed.send(frame).await.is_err() {
        tracing::debug!("draining rejection not delivered");
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    stream: UnixStream,
    handle: Arc<ConnectionHandle>,
    mut outbound: mpsc::Receiver<Frame>,
    guard: ConnectionGuard,
) {
    let _guard = guard;
    let id = handle.id;
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec).split();

    // Write loop: drains the bounded outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut shutdown_rx = shared.shutdown.subscribe();
    while !shared.shutdown.is_draining() {
        tokio::select! {
            incoming = frames.next() => match incoming {
                Some(Ok(frame)) => {
                    if let Err(reason) = dispatch(&shared, &handle, frame).await {
                        tracing::warn!(client = %id, %reason, "closing client after protocol error");
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!(client = %id, %err, "closing client after malformed frame");
                    break;
                }
                None => {
                    tracing::debug!(client = %id, "client closed connection");
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    shared.connections.remove(id);
    shared.watchers.remove_all(id);
    drop(handle); // last sender gone: the writer drains and exits
    let _ = writer.await;
    tracing::debug!(client = %id, "client released");
}

/// A request that must close the client connection.
#[derive(Debug, thiserror::Error)]
enum ProtocolError {
    #[error(transparent)]
    Malformed(#[from] peerstore_core::ParseError),
    #[error("store is missing subsystem, peer, or key")]
    IncompleteStore,
    #[error("iterate is missing the subsystem")]
    MissingSubsystem,
    #[error("unexpected {0:?} frame from a client")]
    Unexpected(MessageType),
}

async fn dispatch(
    shared: &Shared,
    handle: &Arc<ConnectionHandle>,
    frame: Frame,
) -> Result<(), ProtocolError> {
    match frame.ty {
        MessageType::Store => handle_store(shared, handle, &frame.payload).await,
        MessageType::Iterate => handle_iterate(shared, handle, &frame.payload).await,
        MessageType::Watch => {
            let digest = wire::decode_key_hash(&frame.payload)?;
            shared.watchers.add(digest, handle);
            Ok(())
        }
        MessageType::WatchCancel => {
            let digest = wire::decode_key_hash(&frame.payload)?;
            shared.watchers.remove(digest, handle.id);
            Ok(())
        }
        other => Err(ProtocolError::Unexpected(other)),
    }
}

async fn handle_store(
    shared: &Shared,
    handle: &Arc<ConnectionHandle>,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let record = wire::decode_record(payload)?;
    if record.composite_key().is_none() {
        return Err(ProtocolError::IncompleteStore);
    }

    let ack = match shared.storage.store(&record).await {
        Ok(()) => {
            let notified = shared.watchers.fanout(&record);
            tracing::debug!(
                client = %handle.id,
                subsystem = %record.subsystem,
                notified,
                "record stored"
            );
            wire::encode_store_result(0, None)
        }
        Err(err) => {
            tracing::warn!(client = %handle.id, %err, "store failed");
            wire::encode_store_result(-1, Some(err.to_string().as_str()))
        }
    };
    if !handle.send(Frame::new(MessageType::StoreResult, ack)).await {
        tracing::debug!(client = %handle.id, "store result not delivered");
    }
    Ok(())
}

async fn handle_iterate(
    shared: &Shared,
    handle: &Arc<ConnectionHandle>,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let query = wire::decode_record(payload)?;
    if query.subsystem.is_empty() {
        return Err(ProtocolError::MissingSubsystem);
    }
    let query = IterateQuery {
        subsystem: query.subsystem,
        peer: query.peer,
        key: query.key.filter(|key| !key.is_empty()),
    };

    let error = stream_rows(shared, handle, query).await;
    let end = Frame::new(
        MessageType::IterateEnd,
        wire::encode_iterate_end(error.as_deref()),
    );
    if !handle.send(end).await {
        tracing::debug!(client = %handle.id, "iterate end not delivered");
    }
    Ok(())
}

/// Streams matching records to the client; returns the error message for
/// the terminating `ITERATE_END`, if any.
async fn stream_rows(
    shared: &Shared,
    handle: &Arc<ConnectionHandle>,
    query: IterateQuery,
) -> Option<String> {
    let mut rows = match shared.storage.iterate(query).await {
        Ok(rows) => rows,
        Err(err) => return Some(err.to_string()),
    };
    while let Some(item) = rows.recv().await {
        match item {
            Ok(record) => {
                let payload = match wire::encode_record(&record) {
                    Ok(payload) => payload,
                    Err(err) => return Some(err.to_string()),
                };
                let frame = Frame::new(MessageType::IterateRecord, payload);
                if !handle.send(frame).await {
                    // Client is gone; the connection task will clean up.
                    return None;
                }
            }
            Err(err) => return Some(err.to_string()),
        }
    }
    None
}

/// Periodic deletion of expired records.
///
/// Fires once at start and then on a fixed cadence. A failing sweep is
/// logged and the cadence continues; statement serialization inside the
/// backend keeps sweeps from interleaving with request handlers.
async fn run_sweeper(
    storage: Arc<dyn Storage>,
    period: Duration,
    shutdown: Arc<ShutdownController>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match storage.expire(Expiry::now()).await {
                    Ok(0) => {}
                    Ok(deleted) => tracing::debug!(deleted, "expired records removed"),
                    Err(err) => tracing::warn!(%err, "expiry sweep failed"),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}
