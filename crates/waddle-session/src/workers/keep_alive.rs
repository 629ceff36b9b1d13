use std::time::Duration;

use tracing::{debug, trace};

use crate::metrics;
use crate::writer::WriterSlot;

/// Writes a whitespace keep-alive through the writer slot every `interval`.
///
/// The write result is ignored; a dead transport is the reader's to report.
pub struct KeepAliveWorker {
    writer: WriterSlot,
    interval: Duration,
    payload: Vec<u8>,
}

impl KeepAliveWorker {
    pub fn new(writer: WriterSlot, interval: Duration, payload: Vec<u8>) -> Self {
        Self {
            writer,
            interval,
            payload,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        debug!(interval = ?self.interval, "Keep-alive worker started");
        loop {
            tokio::time::sleep(self.interval).await;
            let mut writer = self.writer.acquire().await;
            let _ = writer.send(&self.payload).await;
            drop(writer);
            trace!("Keep-alive attempted");
            metrics::record_keepalive();
        }
    }
}
