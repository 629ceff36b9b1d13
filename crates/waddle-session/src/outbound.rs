//! Outbound stanza queue consumed by the write worker.
//!
//! FIFO, unbounded. A stanza whose send failed goes back to the front so
//! its retry stays ahead of everything queued after it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::stanza::Stanza;

/// Queue of stanzas waiting to be written.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    stanzas: Mutex<VecDeque<Stanza>>,
    available: Notify,
}

impl OutboundQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn stanzas(&self) -> MutexGuard<'_, VecDeque<Stanza>> {
        self.stanzas.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a stanza behind everything already queued.
    pub fn push(&self, stanza: Stanza) {
        self.stanzas().push_back(stanza);
        self.available.notify_one();
    }

    /// Put a stanza back at the head of the queue (undo a [`pop`](Self::pop)).
    pub fn requeue(&self, stanza: Stanza) {
        self.stanzas().push_front(stanza);
        self.available.notify_one();
    }

    /// Take the stanza at the head of the queue.
    pub fn pop(&self) -> Option<Stanza> {
        self.stanzas().pop_front()
    }

    /// Wait until the queue holds at least one stanza.
    ///
    /// Only meaningful for the single consumer: with one consumer the queue
    /// cannot become empty again between this returning and the next `pop`.
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.available.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Get the number of queued stanzas.
    pub fn len(&self) -> usize {
        self.stanzas().len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.stanzas().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use xmpp_parsers::message::Message;

    fn message(id: &str) -> Stanza {
        let mut msg = Message::new(None::<jid::Jid>);
        msg.id = Some(id.to_string());
        Stanza::Message(msg)
    }

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new();
        queue.push(message("1"));
        queue.push(message("2"));
        queue.push(message("3"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().id(), Some("1"));
        assert_eq!(queue.pop().unwrap().id(), Some("2"));
        assert_eq!(queue.pop().unwrap().id(), Some("3"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_requeue_goes_to_front() {
        let queue = OutboundQueue::new();
        queue.push(message("1"));
        queue.push(message("2"));

        let first = queue.pop().unwrap();
        queue.push(message("3"));
        queue.requeue(first);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|s| s.id().unwrap_or_default().to_string())
            .collect();
        assert_eq!(order, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_wait_non_empty_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new());

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.wait_non_empty().await;
                queue.pop().and_then(|s| s.id().map(str::to_string))
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push(message("late"));
        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }
}
