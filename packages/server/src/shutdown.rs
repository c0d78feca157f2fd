//! Engine shutdown sequencing.
//!
//! The engine runs `Running -> Draining -> Stopped`. Draining starts when
//! the shutdown signal fires; `Stopped` is reached only once every
//! connected client has completed or been disconnected, tracked by RAII
//! guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Engine-wide lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Accepting connections and serving requests.
    Running,
    /// Shutdown signalled; existing clients finish, new ones are rejected.
    Draining,
    /// All clients gone; terminal.
    Stopped,
}

/// Coordinates shutdown between the accept loop, connection tasks, and
/// the sweeper.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    connected: Arc<AtomicU64>,
    state: Mutex<EngineState>,
}

impl ShutdownController {
    /// Creates a controller in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            connected: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(EngineState::Running),
        }
    }

    /// Returns a receiver notified when shutdown is triggered.
    ///
    /// Tasks select on this alongside their main loop to begin teardown.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and notifies every subscriber.
    pub fn trigger_drain(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Running {
            *state = EngineState::Draining;
        }
        drop(state);
        // Receivers may already be gone during teardown.
        let _ = self.signal.send(true);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Whether new connections must be rejected.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state() != EngineState::Running
    }

    /// Creates an RAII guard counting one connected client.
    ///
    /// The count drops when the guard does, even if the connection task
    /// panics.
    #[must_use]
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connected.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            connected: Arc::clone(&self.connected),
        }
    }

    /// Number of currently tracked client connections.
    #[must_use]
    pub fn connected_count(&self) -> u64 {
        self.connected.load(Ordering::Relaxed)
    }

    /// Waits until every tracked connection is gone, up to `timeout`.
    ///
    /// Returns `true` (and transitions to `Stopped`) on a complete drain,
    /// `false` if the timeout expired with clients still connected.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.connected.load(Ordering::Relaxed) == 0 {
                *self.state.lock() = EngineState::Stopped;
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard decrementing the connected-client count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    connected: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
    }
}
