//! Shared connection state read by the read worker.
//!
//! The transport layer owns the [`ConnectionState`]: it installs an open
//! state when a stream is negotiated and replaces it wholesale on
//! reconnect. The read worker holds the slot lock for the duration of one
//! `pull`; a replacement first asks it to let go, so swapping the state
//! never waits on a pull.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tracing::debug;

use crate::error::StreamError;
use crate::stanza::Stanza;

/// Source of decoded inbound stanzas for one negotiated stream.
///
/// `pull` is raced against interrupt delivery, so it must be cancel-safe:
/// dropping the future before it completes must not lose a stanza that
/// was already read off the wire.
#[async_trait]
pub trait StanzaSource: Send {
    async fn pull(&mut self) -> Result<Stanza, StreamError>;
}

/// Transport state of the session.
pub enum ConnectionState {
    /// No stream has been installed yet
    NoConnection,
    /// Stream negotiated, stanzas can be pulled
    Open(Box<dyn StanzaSource>),
    /// Stream ended (fatal error or explicit close)
    Closed,
}

impl ConnectionState {
    /// Get the payload-free status of this state.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::NoConnection => ConnectionStatus::NoConnection,
            ConnectionState::Open(_) => ConnectionStatus::Open,
            ConnectionState::Closed => ConnectionStatus::Closed,
        }
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionState::{:?}", self.status())
    }
}

/// Status of the connection, observable without taking the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NoConnection,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::NoConnection => write!(f, "no-connection"),
            ConnectionStatus::Open => write!(f, "open"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

struct Inner {
    slot: Mutex<ConnectionState>,
    status: watch::Sender<ConnectionStatus>,
    /// Replacements waiting for the slot
    pending_swaps: AtomicUsize,
    swap_requested: Notify,
}

/// Counts one waiting replacement for as long as it lives.
struct PendingSwap<'a>(&'a Inner);

impl<'a> PendingSwap<'a> {
    fn announce(inner: &'a Inner) -> Self {
        inner.pending_swaps.fetch_add(1, Ordering::SeqCst);
        inner.swap_requested.notify_waiters();
        Self(inner)
    }
}

impl Drop for PendingSwap<'_> {
    fn drop(&mut self) {
        self.0.pending_swaps.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single-slot holder of the session's [`ConnectionState`].
///
/// The status channel is only updated while the slot lock is held, so a
/// status observed as `Open` always has an open state behind it until
/// the next replacement.
#[derive(Clone)]
pub struct SharedConnectionState {
    inner: Arc<Inner>,
}

impl SharedConnectionState {
    /// Create a slot in the `NoConnection` state.
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NoConnection);
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(ConnectionState::NoConnection),
                status,
                pending_swaps: AtomicUsize::new(0),
                swap_requested: Notify::new(),
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Replace the state, returning the previous one.
    ///
    /// A read worker blocked in `pull` on the old state gives up the slot
    /// at once; the lock is fair, so the replacement goes first.
    pub async fn replace(&self, state: ConnectionState) -> ConnectionState {
        let pending = PendingSwap::announce(&self.inner);
        let mut slot = self.inner.slot.lock().await;
        drop(pending);
        let status = state.status();
        let previous = std::mem::replace(&mut *slot, state);
        self.inner.status.send_replace(status);
        debug!(from = %previous.status(), to = %status, "Connection state replaced");
        previous
    }

    /// Install an open stream.
    pub async fn open(&self, source: Box<dyn StanzaSource>) {
        self.replace(ConnectionState::Open(source)).await;
    }

    /// Mark the connection closed, discarding the current source.
    pub async fn close(&self) {
        self.replace(ConnectionState::Closed).await;
    }

    /// Lock the slot once it holds an open state.
    pub(crate) async fn lock_open(&self) -> MutexGuard<'_, ConnectionState> {
        let mut status = self.inner.status.subscribe();
        loop {
            let slot = self.inner.slot.lock().await;
            if matches!(*slot, ConnectionState::Open(_)) {
                return slot;
            }
            drop(slot);

            let opened = status
                .wait_for(|status| *status == ConnectionStatus::Open)
                .await
                .is_ok();
            if !opened {
                // Sender lives in `inner`, which we hold.
                tokio::task::yield_now().await;
            }
        }
    }

    /// Resolves while a replacement is waiting for the slot.
    pub(crate) async fn swap_requested(&self) {
        loop {
            let notified = self.inner.swap_requested.notified();
            if self.inner.pending_swaps.load(Ordering::SeqCst) > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Mark the connection closed through a guard obtained from [`lock_open`].
    ///
    /// [`lock_open`]: Self::lock_open
    pub(crate) fn close_locked(&self, slot: &mut MutexGuard<'_, ConnectionState>) {
        **slot = ConnectionState::Closed;
        self.inner.status.send_replace(ConnectionStatus::Closed);
    }
}

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnectionState")
            .field("status", &self.status())
            .finish()
    }
}
