//! Fan-out broadcast of inbound stanzas.
//!
//! Each [`Bus`] keeps one unbounded channel per subscriber. Publishing
//! pushes a clone into every live channel under the registry lock, so all
//! subscribers observe the same global order and a new subscriber only
//! sees items published after it subscribed. Nothing is buffered for a
//! bus without subscribers.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::stanza::{MessageError, PresenceError, Stanza};

/// A publish/subscribe queue with independent subscriber views.
pub struct Bus<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Bus<T> {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new subscriber view.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        Subscription { rx }
    }

    /// Deliver `item` to every live subscriber, pruning dropped ones.
    ///
    /// Returns the number of subscribers that received the item.
    pub fn publish(&self, item: T) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|tx| tx.send(item.clone()).is_ok());
        subscribers.len()
    }

    /// Get the number of registered subscribers (dropped ones are pruned lazily).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl<T: Clone> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's ordered view of a [`Bus`] (or of an IQ handler queue).
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn from_receiver(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Wait for the next item. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next item matching `predicate`, discarding the others.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(item) = self.rx.recv().await {
            if predicate(&item) {
                return Some(item);
            }
        }
        None
    }
}

impl<T> Unpin for Subscription<T> {}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// The three inbound buses of a session.
#[derive(Default)]
pub struct StanzaBuses {
    /// `Ok(message)` / `Err(message error)`
    pub messages: Bus<Result<Message, MessageError>>,
    /// `Ok(presence)` / `Err(presence error)`
    pub presences: Bus<Result<Presence, PresenceError>>,
    /// Every inbound stanza
    pub stanzas: Bus<Stanza>,
}

impl StanzaBuses {
    pub fn new() -> Self {
        Self::default()
    }
}
