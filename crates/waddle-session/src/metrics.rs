//! Session metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application. Without one, recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

use crate::stanza::StanzaKind;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-session"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stanzas pulled off the stream.
pub fn stanzas_received() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.session.stanzas.received")
        .with_description("Total stanzas pulled off the stream")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas written to the wire.
pub fn stanzas_sent() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.session.stanzas.sent")
        .with_description("Total stanzas written to the wire")
        .with_unit("stanza")
        .build()
}

/// Counter for failed writes that were requeued.
pub fn write_retries() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.session.write.retries")
        .with_description("Total failed stanza writes put back for retry")
        .with_unit("attempt")
        .build()
}

/// Counter for keep-alive writes attempted, successful or not.
pub fn keepalives() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.session.keepalives")
        .with_description("Total keep-alive writes attempted")
        .with_unit("payload")
        .build()
}

/// Counter for IQs that had no handler or waiter.
pub fn iq_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.session.iq.unroutable")
        .with_description("Total inbound IQs dropped for lack of a handler or waiter")
        .with_unit("stanza")
        .build()
}

/// Counter for fatal stream errors seen by the read worker.
pub fn streams_closed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.session.stream.closed")
        .with_description("Total streams closed by a fatal read error")
        .with_unit("stream")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for IQ requests awaiting a response.
pub fn iq_pending() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.session.iq.pending")
        .with_description("Current number of IQ requests awaiting a response")
        .with_unit("request")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record an inbound stanza.
pub fn record_stanza_received(kind: StanzaKind) {
    stanzas_received().add(1, &[KeyValue::new("type", kind.to_string())]);
}

/// Record a stanza written to the wire.
pub fn record_stanza_sent(kind: StanzaKind) {
    stanzas_sent().add(1, &[KeyValue::new("type", kind.to_string())]);
}

/// Record a failed write that will be retried.
pub fn record_write_retry(kind: StanzaKind) {
    write_retries().add(1, &[KeyValue::new("type", kind.to_string())]);
}

/// Record a keep-alive write attempt. The write result is not inspected.
pub fn record_keepalive() {
    keepalives().add(1, &[]);
}

/// Record an IQ dropped for lack of a handler (`request`) or waiter (`response`).
pub fn record_iq_unroutable(direction: &'static str) {
    iq_unroutable().add(1, &[KeyValue::new("direction", direction)]);
}

/// Record a fatal stream error.
pub fn record_stream_closed() {
    streams_closed().add(1, &[]);
}

/// Update the pending IQ gauge.
pub fn record_iq_pending(count: usize) {
    iq_pending().record(count as i64, &[]);
}
