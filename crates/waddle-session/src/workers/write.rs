use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::codec::StanzaEncoder;
use crate::metrics;
use crate::outbound::OutboundQueue;
use crate::writer::WriterSlot;

/// Drains the outbound queue in FIFO order through the writer slot.
///
/// A stanza whose write fails goes back to the front of the queue and is
/// retried after `backoff`, so ordering survives a broken transport.
pub struct WriteWorker {
    outbound: Arc<OutboundQueue>,
    writer: WriterSlot,
    encoder: Arc<dyn StanzaEncoder>,
    backoff: Duration,
}

impl WriteWorker {
    pub fn new(
        outbound: Arc<OutboundQueue>,
        writer: WriterSlot,
        encoder: Arc<dyn StanzaEncoder>,
        backoff: Duration,
    ) -> Self {
        Self {
            outbound,
            writer,
            encoder,
            backoff,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        debug!("Write worker started");
        loop {
            self.outbound.wait_non_empty().await;

            // A stanza only leaves the queue while the writer is held.
            let mut writer = self.writer.acquire().await;
            let Some(stanza) = self.outbound.pop() else {
                continue;
            };

            let bytes = match self.encoder.encode(&stanza) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(kind = %stanza.kind(), id = ?stanza.id(), error = %e, "Dropping unencodable stanza");
                    continue;
                }
            };

            let result = writer.send(&bytes).await;
            drop(writer);

            match result {
                Ok(()) => {
                    trace!(kind = %stanza.kind(), id = ?stanza.id(), "Wrote stanza");
                    metrics::record_stanza_sent(stanza.kind());
                }
                Err(e) => {
                    debug!(kind = %stanza.kind(), id = ?stanza.id(), error = %e, "Write failed, requeueing");
                    metrics::record_write_retry(stanza.kind());
                    self.outbound.requeue(stanza);
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
