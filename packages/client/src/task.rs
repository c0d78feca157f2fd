//! The client connection task.
//!
//! Owns the socket and the three ordered in-flight lists (stores,
//! iterations, watches). The public handle talks to it over a command
//! channel; the task connects lazily, reconnects with exponential
//! backoff after transport errors, and replays in-flight state on every
//! successful connect: watches first, then pending iterations in
//! submission order, then pending stores in submission order.
//!
//! A store completes when its frame has been handed to the transport;
//! `STORE_RESULT` frames only reset the backoff and surface server-side
//! failures in the log. Iteration replies are routed to the oldest
//! pending iteration, matching the service's strict per-connection
//! ordering.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use peerstore_core::{wire, Frame, FrameCodec, KeyHash, MessageType, Record};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::backoff::Backoff;
use crate::{ClientConfig, ClientError, IterateItem};

type FrameSink = SplitSink<Framed<UnixStream, FrameCodec>, Frame>;

/// Requests from the [`Client`](crate::Client) handle to the task.
pub(crate) enum Command {
    Store {
        payload: Bytes,
        done: oneshot::Sender<Result<(), ClientError>>,
    },
    Iterate {
        id: u64,
        payload: Bytes,
        events: mpsc::UnboundedSender<IterateEvent>,
    },
    CancelIterate {
        id: u64,
    },
    Watch {
        id: u64,
        digest: KeyHash,
        events: mpsc::UnboundedSender<Record>,
    },
    CancelWatch {
        id: u64,
    },
    Disconnect {
        flush_stores: bool,
        done: oneshot::Sender<()>,
    },
}

/// Items delivered to an [`Iteration`](crate::Iteration) consumer.
pub(crate) enum IterateEvent {
    Item(IterateItem),
    End,
}

struct StoreCtx {
    payload: Bytes,
    done: oneshot::Sender<Result<(), ClientError>>,
}

struct IterateCtx {
    id: u64,
    payload: Bytes,
    /// `None` once the consumer cancelled; the context is still replayed
    /// and kept until its end-of-stream arrives, then dropped silently.
    events: Option<mpsc::UnboundedSender<IterateEvent>>,
}

struct WatchCtx {
    id: u64,
    digest: KeyHash,
    events: mpsc::UnboundedSender<Record>,
}

/// Why `drive` gave the connection up.
enum Exit {
    /// Tear the task down for good.
    Shutdown,
    /// Transport error; reconnect after backoff.
    Transport(String),
}

pub(crate) struct ConnectionTask {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    stores: VecDeque<StoreCtx>,
    iterates: VecDeque<IterateCtx>,
    watches: Vec<WatchCtx>,
    backoff: Backoff,
    /// `Some` while a `disconnect(sync_first = true)` waits for the store
    /// queue to flush.
    disconnecting: Option<oneshot::Sender<()>>,
}

impl ConnectionTask {
    pub(crate) fn new(config: ClientConfig, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        Self {
            config,
            commands,
            stores: VecDeque::new(),
            iterates: VecDeque::new(),
            watches: Vec::new(),
            backoff,
            disconnecting: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut delay = Duration::ZERO;
        loop {
            if !delay.is_zero() && !self.wait(delay).await {
                return;
            }
            match UnixStream::connect(&self.config.socket).await {
                Err(err) => {
                    delay = self.backoff.next();
                    tracing::debug!(
                        socket = %self.config.socket.display(),
                        %err,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "connect failed"
                    );
                }
                Ok(stream) => {
                    tracing::debug!(socket = %self.config.socket.display(), "connected");
                    match self.drive(Framed::new(stream, FrameCodec)).await {
                        Exit::Shutdown => return,
                        Exit::Transport(reason) => {
                            self.on_transport_error(&reason);
                            delay = self.backoff.next();
                        }
                    }
                }
            }
        }
    }

    /// Sleeps out a backoff period while still accepting commands.
    ///
    /// Returns `false` when the task tore down during the wait.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None => {
                        self.teardown();
                        return false;
                    }
                    Some(command) => {
                        if !self.handle_offline_command(command) {
                            return false;
                        }
                    }
                },
            }
        }
    }

    /// Serves one live connection until shutdown or a transport error.
    async fn drive(&mut self, framed: Framed<UnixStream, FrameCodec>) -> Exit {
        let (mut sink, mut frames) = framed.split();

        if let Err(exit) = self.replay(&mut sink).await {
            return exit;
        }
        if self.maybe_finish_disconnect() {
            return Exit::Shutdown;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None => {
                        self.teardown();
                        return Exit::Shutdown;
                    }
                    Some(command) => match self.handle_online_command(command, &mut sink).await {
                        Ok(true) => {}
                        Ok(false) => return Exit::Shutdown,
                        Err(exit) => return exit,
                    },
                },
                incoming = frames.next() => match incoming {
                    Some(Ok(frame)) => self.on_frame(&frame),
                    Some(Err(err)) => return Exit::Transport(err.to_string()),
                    None => return Exit::Transport("connection closed by service".to_string()),
                },
            }
        }
    }

    /// Re-sends all in-flight state after a (re)connect.
    async fn replay(&mut self, sink: &mut FrameSink) -> Result<(), Exit> {
        // One subscription per distinct digest; several local watches of
        // the same key share it.
        let digests: BTreeSet<KeyHash> = self.watches.iter().map(|watch| watch.digest).collect();
        for digest in digests {
            let frame = Frame::new(MessageType::Watch, wire::encode_key_hash(&digest));
            sink.send(frame).await.map_err(transport)?;
        }
        for iterate in &self.iterates {
            let frame = Frame::new(MessageType::Iterate, iterate.payload.clone());
            sink.send(frame).await.map_err(transport)?;
        }
        self.flush_stores(sink).await
    }

    /// Sends queued stores in submission order, completing each as soon
    /// as its frame is on the wire.
    async fn flush_stores(&mut self, sink: &mut FrameSink) -> Result<(), Exit> {
        while let Some(front) = self.stores.front() {
            if front.done.is_closed() {
                // The caller dropped the store future: cancelled.
                self.stores.pop_front();
                continue;
            }
            let frame = Frame::new(MessageType::Store, front.payload.clone());
            sink.send(frame).await.map_err(transport)?;
            if let Some(ctx) = self.stores.pop_front() {
                let _ = ctx.done.send(Ok(()));
            }
        }
        Ok(())
    }

    /// Handles a command while no connection is up. Returns `false` after
    /// a final teardown.
    fn handle_offline_command(&mut self, command: Command) -> bool {
        match command {
            Command::Store { payload, done } => {
                if self.disconnecting.is_some() {
                    let _ = done.send(Err(ClientError::Cancelled));
                } else {
                    self.stores.push_back(StoreCtx { payload, done });
                }
            }
            Command::Iterate {
                id,
                payload,
                events,
            } => self.iterates.push_back(IterateCtx {
                id,
                payload,
                events: Some(events),
            }),
            Command::CancelIterate { id } => self.detach_iterate(id),
            Command::Watch {
                id,
                digest,
                events,
            } => self.watches.push(WatchCtx { id, digest, events }),
            Command::CancelWatch { id } => {
                self.watches.retain(|watch| watch.id != id);
            }
            Command::Disconnect { flush_stores, done } => {
                self.cancel_iterates_and_watches();
                if flush_stores && !self.stores.is_empty() {
                    self.disconnecting = Some(done);
                } else {
                    self.cancel_stores();
                    let _ = done.send(());
                    return false;
                }
            }
        }
        true
    }

    /// Handles a command on a live connection. `Ok(false)` ends the task.
    async fn handle_online_command(
        &mut self,
        command: Command,
        sink: &mut FrameSink,
    ) -> Result<bool, Exit> {
        match command {
            Command::Store { payload, done } => {
                if self.disconnecting.is_some() {
                    let _ = done.send(Err(ClientError::Cancelled));
                } else {
                    self.stores.push_back(StoreCtx { payload, done });
                    self.flush_stores(sink).await?;
                }
            }
            Command::Iterate {
                id,
                payload,
                events,
            } => {
                self.iterates.push_back(IterateCtx {
                    id,
                    payload: payload.clone(),
                    events: Some(events),
                });
                let frame = Frame::new(MessageType::Iterate, payload);
                sink.send(frame).await.map_err(transport)?;
            }
            Command::CancelIterate { id } => self.detach_iterate(id),
            Command::Watch {
                id,
                digest,
                events,
            } => {
                let subscribed = self.watches.iter().any(|watch| watch.digest == digest);
                self.watches.push(WatchCtx { id, digest, events });
                if !subscribed {
                    let frame = Frame::new(MessageType::Watch, wire::encode_key_hash(&digest));
                    sink.send(frame).await.map_err(transport)?;
                }
            }
            Command::CancelWatch { id } => {
                let Some(position) = self.watches.iter().position(|watch| watch.id == id) else {
                    return Ok(true);
                };
                let digest = self.watches.remove(position).digest;
                if !self.watches.iter().any(|watch| watch.digest == digest) {
                    let frame =
                        Frame::new(MessageType::WatchCancel, wire::encode_key_hash(&digest));
                    sink.send(frame).await.map_err(transport)?;
                }
            }
            Command::Disconnect { flush_stores, done } => {
                self.cancel_iterates_and_watches();
                if flush_stores && !self.stores.is_empty() {
                    self.disconnecting = Some(done);
                } else {
                    self.cancel_stores();
                    let _ = done.send(());
                    return Ok(false);
                }
            }
        }
        Ok(!self.maybe_finish_disconnect())
    }

    /// Routes an incoming frame to the matching in-flight context.
    fn on_frame(&mut self, frame: &Frame) {
        match frame.ty {
            MessageType::IterateRecord => match wire::decode_record(&frame.payload) {
                Ok(record) => {
                    // Replies arrive in request order; the oldest pending
                    // iteration owns this record.
                    if let Some(front) = self.iterates.front() {
                        if let Some(events) = &front.events {
                            let _ = events.send(IterateEvent::Item(IterateItem::Record(record)));
                        }
                    } else {
                        tracing::warn!("iterate record with no pending iteration");
                    }
                }
                Err(err) => tracing::warn!(%err, "undecodable iterate record"),
            },
            MessageType::IterateEnd => {
                self.backoff.reset();
                let Some(ctx) = self.iterates.pop_front() else {
                    tracing::warn!("iterate end with no pending iteration");
                    return;
                };
                let Some(events) = ctx.events else {
                    return; // cancelled context, released silently
                };
                match wire::decode_iterate_end(&frame.payload) {
                    Ok(None) => {
                        let _ = events.send(IterateEvent::End);
                    }
                    Ok(Some(emsg)) => {
                        let _ = events.send(IterateEvent::Item(IterateItem::Failed(emsg)));
                    }
                    Err(err) => {
                        let _ = events
                            .send(IterateEvent::Item(IterateItem::Failed(err.to_string())));
                    }
                }
            }
            MessageType::WatchRecord => match wire::decode_record(&frame.payload) {
                Ok(record) => {
                    let Some(digest) = record.key_hash() else {
                        tracing::warn!("watch record without a composite key");
                        return;
                    };
                    for watch in self.watches.iter().filter(|watch| watch.digest == digest) {
                        let _ = watch.events.send(record.clone());
                    }
                }
                Err(err) => tracing::warn!(%err, "undecodable watch record"),
            },
            MessageType::StoreResult => match wire::decode_store_result(&frame.payload) {
                Ok((code, message)) => {
                    if code >= 0 {
                        self.backoff.reset();
                    } else {
                        tracing::warn!(
                            code,
                            message = message.as_deref().unwrap_or_default(),
                            "service reported store failure"
                        );
                    }
                }
                Err(err) => tracing::warn!(%err, "undecodable store result"),
            },
            other => tracing::warn!(ty = ?other, "unexpected frame from service"),
        }
    }

    /// Notifies consumers that the transport dropped mid-flight.
    ///
    /// Iterations get a synthetic interruption item and stay queued for
    /// replay, so their consumers may see records again (at-least-once).
    fn on_transport_error(&mut self, reason: &str) {
        tracing::debug!(
            reason,
            pending_stores = self.stores.len(),
            pending_iterates = self.iterates.len(),
            watches = self.watches.len(),
            "transport error; reconnecting"
        );
        for iterate in &self.iterates {
            if let Some(events) = &iterate.events {
                let _ = events.send(IterateEvent::Item(IterateItem::Interrupted(
                    reason.to_string(),
                )));
            }
        }
    }

    /// Detaches the consumer; the context itself lives until its
    /// end-of-stream arrives.
    fn detach_iterate(&mut self, id: u64) {
        if let Some(ctx) = self.iterates.iter_mut().find(|ctx| ctx.id == id) {
            ctx.events = None;
        }
    }

    fn maybe_finish_disconnect(&mut self) -> bool {
        if !self.stores.is_empty() {
            return false;
        }
        if let Some(done) = self.disconnecting.take() {
            let _ = done.send(());
            return true;
        }
        false
    }

    fn cancel_iterates_and_watches(&mut self) {
        for ctx in self.iterates.drain(..) {
            if let Some(events) = ctx.events {
                let _ = events.send(IterateEvent::End);
            }
        }
        self.watches.clear();
    }

    fn cancel_stores(&mut self) {
        for ctx in self.stores.drain(..) {
            let _ = ctx.done.send(Err(ClientError::Cancelled));
        }
    }

    fn teardown(&mut self) {
        self.cancel_iterates_and_watches();
        self.cancel_stores();
    }
}

fn transport(err: peerstore_core::ParseError) -> Exit {
    Exit::Transport(err.to_string())
}
