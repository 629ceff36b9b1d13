use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionState, SharedConnectionState};
use crate::error::StreamError;
use crate::interrupt::{self, InterruptToken};
use crate::metrics;
use crate::stanza::Stanza;

/// Callback receiving every pulled stanza.
pub type DispatchFn = Arc<dyn Fn(Stanza) + Send + Sync>;

/// Callback invoked when the stream fails fatally.
pub type ClosedFn = Arc<dyn Fn(&StreamError) + Send + Sync>;

enum ReadEvent {
    Stanza(Stanza),
    Closed(StreamError),
    Interrupted(InterruptToken),
}

/// Pulls stanzas off the open connection, one per iteration.
pub struct ReadWorker {
    connection: SharedConnectionState,
    interrupts: mpsc::UnboundedReceiver<InterruptToken>,
    dispatch: DispatchFn,
    on_closed: ClosedFn,
}

impl ReadWorker {
    pub fn new(
        connection: SharedConnectionState,
        interrupts: mpsc::UnboundedReceiver<InterruptToken>,
        dispatch: DispatchFn,
        on_closed: ClosedFn,
    ) -> Self {
        Self {
            connection,
            interrupts,
            dispatch,
            on_closed,
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        debug!("Read worker started");
        loop {
            match self.next_event().await {
                ReadEvent::Stanza(stanza) => {
                    trace!(kind = %stanza.kind(), id = ?stanza.id(), "Pulled stanza");
                    metrics::record_stanza_received(stanza.kind());
                    (self.dispatch)(stanza);
                }
                ReadEvent::Closed(error) => {
                    warn!(error = %error, "Stream closed");
                    metrics::record_stream_closed();
                    (self.on_closed)(&error);
                }
                ReadEvent::Interrupted(token) => {
                    debug!("Read worker interrupted");
                    let acknowledged = interrupt::acknowledge(token, &mut self.interrupts).await;
                    debug!(acknowledged, "Read worker resuming");
                }
            }
        }
    }

    /// Wait for an open connection, then either pull one stanza or take an
    /// interrupt. This is the only point where interrupts are observed.
    ///
    /// A pending state replacement also ends the pull; the slot is dropped
    /// and re-locked behind the replacement.
    async fn next_event(&mut self) -> ReadEvent {
        let Self {
            connection,
            interrupts,
            ..
        } = self;

        loop {
            let mut slot = connection.lock_open().await;
            let ConnectionState::Open(source) = &mut *slot else {
                continue;
            };

            let pulled = tokio::select! {
                biased;
                Some(token) = interrupts.recv() => return ReadEvent::Interrupted(token),
                _ = connection.swap_requested() => None,
                result = source.pull() => Some(result),
            };
            let Some(result) = pulled else {
                trace!("Yielding connection slot to a replacement");
                drop(slot);
                tokio::task::yield_now().await;
                continue;
            };

            return match result {
                Ok(stanza) => ReadEvent::Stanza(stanza),
                Err(error) => {
                    // Drop the dead source so the loop idles until a new state is installed.
                    connection.close_locked(&mut slot);
                    ReadEvent::Closed(error)
                }
            };
        }
    }
}
