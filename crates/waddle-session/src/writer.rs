//! The session's single write path.
//!
//! [`WriterSlot`] always holds exactly one [`RawWriter`]. Taking the slot
//! is taking exclusive ownership of the wire: the write worker, the
//! keep-alive worker and user code serialize on it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::StreamError;

/// Raw byte sink of the active transport.
///
/// `Err` signals the connection is dead; the caller decides whether to retry.
#[async_trait]
pub trait RawWriter: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), StreamError>;
}

/// Writer installed before any transport is connected. Every send fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingWriter;

#[async_trait]
impl RawWriter for FailingWriter {
    async fn send(&mut self, _data: &[u8]) -> Result<(), StreamError> {
        Err(StreamError::Disconnected)
    }
}

/// Exclusive hold on the writer slot. Dropping it puts the writer back.
pub type WriterGuard = OwnedMutexGuard<Box<dyn RawWriter>>;

/// Single-slot holder of the current [`RawWriter`].
#[derive(Clone)]
pub struct WriterSlot {
    inner: Arc<Mutex<Box<dyn RawWriter>>>,
}

impl WriterSlot {
    /// Create a slot holding the given writer.
    pub fn new(writer: Box<dyn RawWriter>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Take the writer, waiting until no other task holds it.
    pub async fn acquire(&self) -> WriterGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Swap in a new writer (e.g. after reconnecting), returning the old one.
    pub async fn replace(&self, writer: Box<dyn RawWriter>) -> Box<dyn RawWriter> {
        let mut guard = self.acquire().await;
        debug!("Writer replaced");
        std::mem::replace(&mut *guard, writer)
    }

    /// Take the writer, send `data`, and put the writer back.
    pub async fn send(&self, data: &[u8]) -> Result<(), StreamError> {
        let mut writer = self.acquire().await;
        writer.send(data).await
    }

    /// Whether another task currently holds the writer.
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for WriterSlot {
    fn default() -> Self {
        Self::new(Box::new(FailingWriter))
    }
}

impl std::fmt::Debug for WriterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterSlot")
            .field("held", &self.is_held())
            .finish()
    }
}
