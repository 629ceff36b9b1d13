//! Cooperative interruption of the read worker.
//!
//! A controller creates an [`InterruptToken`] / [`InterruptRelease`] pair
//! and delivers the token to the read worker through an [`Interrupter`].
//! At its next interrupt window the reader gives up the connection-state
//! slot and parks until every token it knows about has been released,
//! collecting tokens that arrive while it waits. The controller does its
//! work (typically installing a new connection state) and then releases.

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::SessionError;

/// Reader-side half of an interrupt: resolves once the controller releases.
#[derive(Debug)]
pub struct InterruptToken {
    released: oneshot::Receiver<()>,
}

impl InterruptToken {
    /// Wait until the controller releases this token (or drops its release).
    pub async fn released(self) {
        let _ = self.released.await;
    }
}

/// Controller-side half of an interrupt. Releasing (or dropping) it lets
/// the reader resume.
#[derive(Debug)]
pub struct InterruptRelease {
    tx: Option<oneshot::Sender<()>>,
}

impl InterruptRelease {
    /// Let the reader resume.
    pub fn release(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for InterruptRelease {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Create a fresh token and its release.
pub fn interrupt_token() -> (InterruptToken, InterruptRelease) {
    let (tx, rx) = oneshot::channel();
    (
        InterruptToken { released: rx },
        InterruptRelease { tx: Some(tx) },
    )
}

/// Delivers interrupt tokens to the read worker.
#[derive(Debug, Clone)]
pub struct Interrupter {
    tx: mpsc::UnboundedSender<InterruptToken>,
}

impl Interrupter {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<InterruptToken>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver one or more tokens to the read worker.
    pub fn interrupt<I>(&self, tokens: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = InterruptToken>,
    {
        for token in tokens {
            self.tx.send(token).map_err(|_| SessionError::ReaderGone)?;
        }
        Ok(())
    }

    /// Interrupt the reader with a single fresh token, returning its release.
    pub fn pause(&self) -> Result<InterruptRelease, SessionError> {
        let (token, release) = interrupt_token();
        self.interrupt([token])?;
        Ok(release)
    }
}

/// Park until `first` and every token that arrives meanwhile is released.
///
/// Returns the number of tokens acknowledged.
pub(crate) async fn acknowledge(
    first: InterruptToken,
    incoming: &mut mpsc::UnboundedReceiver<InterruptToken>,
) -> usize {
    let mut waiting = FuturesUnordered::new();
    waiting.push(first.released());
    let mut acknowledged = 0;

    loop {
        while let Ok(token) = incoming.try_recv() {
            waiting.push(token.released());
        }
        if waiting.is_empty() {
            break;
        }

        tokio::select! {
            Some(token) = incoming.recv() => {
                debug!(waiting = waiting.len() + 1, "Interrupt arrived while paused");
                waiting.push(token.released());
            }
            Some(()) = waiting.next() => {
                acknowledged += 1;
            }
        }
    }

    acknowledged
}
