//! Per-client connection handles and the live-connection registry.
//!
//! Each accepted client gets a bounded mpsc channel for outbound frames;
//! the receiver end is drained by that connection's write loop, and
//! [`ConnectionHandle`] holds the sender end. Watcher entries hold `Weak`
//! references to handles, so a handle dies with its connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use peerstore_core::Frame;
use tokio::sync::mpsc;

/// Unique identifier for a connected client, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Handle to one connected client.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Registry-assigned identifier.
    pub id: ClientId,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Enqueues a frame without blocking.
    ///
    /// Returns `false` when the outbound queue is full or the connection
    /// has closed; callers that may drop frames (watch fan-out) use this.
    #[must_use]
    pub fn try_send(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Enqueues a frame, waiting for queue space.
    ///
    /// Returns `false` when the connection has closed. Used where frames
    /// must not be dropped (iteration streams, acknowledgements).
    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    /// Whether the write loop is still draining this connection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Registry of all currently connected clients.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u64, Arc<ConnectionHandle>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Client IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning its handle and the outbound
    /// frame receiver for the write loop.
    pub fn register(&self, capacity: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<Frame>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(ConnectionHandle { id, tx });
        self.connections.lock().insert(id.0, Arc::clone(&handle));
        (handle, rx)
    }

    /// Removes a connection, returning its handle if it was present.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ConnectionHandle>> {
        self.connections.lock().remove(&id.0)
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use peerstore_core::MessageType;

    use super::*;

    fn frame() -> Frame {
        Frame::new(MessageType::IterateEnd, Bytes::new())
    }

    #[test]
    fn register_assigns_sequential_ids() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = registry.register(4);
        let (h2, _rx2) = registry.register(4);
        assert_eq!(h1.id, ClientId(1));
        assert_eq!(h2.id, ClientId(2));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn remove_forgets_the_connection() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(4);
        assert!(registry.remove(handle.id).is_some());
        assert!(registry.remove(handle.id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn try_send_reports_full_queue() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(1);
        assert!(handle.try_send(frame()));
        assert!(!handle.try_send(frame()));
    }

    #[test]
    fn try_send_reports_closed_connection() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(1);
        drop(rx);
        assert!(!handle.try_send(frame()));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn send_waits_for_capacity() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.register(1);
        assert!(handle.send(frame()).await);

        let writer = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.send(frame()).await })
        };
        // Draining one frame unblocks the pending send.
        assert!(rx.recv().await.is_some());
        assert!(writer.await.expect("join"));
    }
}
