//! The client session: buses, outbound queue, IQ correlation and workers
//! behind one handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, instrument};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::broadcast::{StanzaBuses, Subscription};
use crate::codec::{StanzaEncoder, XmlEncoder};
use crate::config::SessionConfig;
use crate::connection::{ConnectionStatus, SharedConnectionState, StanzaSource};
use crate::error::{SessionError, StreamError};
use crate::interrupt::Interrupter;
use crate::iq::{IqCorrelator, IqRequestTicket, PendingResponse};
use crate::outbound::OutboundQueue;
use crate::router::StanzaRouter;
use crate::stanza::{IqRequest, IqRequestKind, IqResponse, MessageError, PresenceError, Stanza};
use crate::supervisor::{self, SessionWorkers};
use crate::writer::{FailingWriter, RawWriter, WriterSlot};

/// Callback invoked when the read worker hits a fatal stream error.
pub type ClosedHandler = Arc<dyn Fn(&StreamError) + Send + Sync>;

/// Monotonic IQ/stanza id source, rendered as decimal strings.
#[derive(Debug)]
struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    fn next(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[derive(Default)]
struct EventHandlers {
    connection_closed: Option<ClosedHandler>,
}

/// A running XMPP client session.
///
/// Cheap to clone; every clone drives the same workers.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    buses: Arc<StanzaBuses>,
    outbound: Arc<OutboundQueue>,
    iq: Arc<IqCorrelator>,
    ids: IdGenerator,
    handlers: Arc<RwLock<EventHandlers>>,
    workers: SessionWorkers,
}

impl Session {
    /// Start a session that serializes stanzas as XML.
    ///
    /// The session has no connection until [`install_connection`] is called.
    ///
    /// [`install_connection`]: Self::install_connection
    pub fn start(config: SessionConfig) -> Self {
        Self::start_with_encoder(config, Arc::new(XmlEncoder))
    }

    /// Start a session with a custom stanza encoder.
    pub fn start_with_encoder(config: SessionConfig, encoder: Arc<dyn StanzaEncoder>) -> Self {
        let buses = Arc::new(StanzaBuses::new());
        let outbound = Arc::new(OutboundQueue::new());
        let iq = Arc::new(IqCorrelator::new(Arc::clone(&outbound)));
        let handlers = Arc::new(RwLock::new(EventHandlers::default()));

        let router = StanzaRouter::new(Arc::clone(&buses), Arc::clone(&iq));
        let closed_handlers = Arc::clone(&handlers);

        let workers = supervisor::start(
            &config,
            encoder,
            Arc::clone(&outbound),
            Arc::new(move |stanza: Stanza| router.route(stanza)),
            Arc::new(move |error: &StreamError| {
                let handler = closed_handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .connection_closed
                    .clone();
                if let Some(handler) = handler {
                    handler(error);
                }
            }),
        );

        Self {
            inner: Arc::new(SessionInner {
                config,
                buses,
                outbound,
                iq,
                ids: IdGenerator::new(),
                handlers,
                workers,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Messages received from now on; error messages arrive as `Err`.
    pub fn subscribe_messages(&self) -> Subscription<Result<Message, MessageError>> {
        self.inner.buses.messages.subscribe()
    }

    /// Presences received from now on; error presences arrive as `Err`.
    pub fn subscribe_presences(&self) -> Subscription<Result<Presence, PresenceError>> {
        self.inner.buses.presences.subscribe()
    }

    /// Every stanza received from now on.
    pub fn subscribe_stanzas(&self) -> Subscription<Stanza> {
        self.inner.buses.stanzas.subscribe()
    }

    /// Receive inbound IQ requests of `kind` whose payload is in `namespace`.
    pub fn listen_iq(
        &self,
        kind: IqRequestKind,
        namespace: &str,
    ) -> Result<Subscription<IqRequestTicket>, SessionError> {
        self.inner.iq.listen(kind, namespace)
    }

    /// Stop receiving IQ requests for `(kind, namespace)`.
    pub fn unlisten_iq(&self, kind: IqRequestKind, namespace: &str) -> bool {
        self.inner.iq.unlisten(kind, namespace)
    }

    /// Set the callback invoked when the stream fails, replacing any previous one.
    pub fn set_connection_closed_handler<F>(&self, handler: F)
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.handlers_mut().connection_closed = Some(Arc::new(handler));
    }

    /// Remove the connection-closed callback.
    pub fn clear_connection_closed_handler(&self) {
        self.handlers_mut().connection_closed = None;
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, EventHandlers> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Queue a stanza for the write worker.
    ///
    /// Fire-and-forget: write failures are retried by the worker and never
    /// reported here.
    pub fn send(&self, stanza: Stanza) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.inner.outbound.push(stanza);
        Ok(())
    }

    pub fn send_message(&self, message: Message) -> Result<(), SessionError> {
        self.send(Stanza::from(message))
    }

    pub fn send_presence(&self, presence: Presence) -> Result<(), SessionError> {
        self.send(Stanza::from(presence))
    }

    /// Write bytes directly through the writer slot, bypassing the queue.
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.inner.workers.writer.send(data).await?;
        Ok(())
    }

    /// Send an IQ request and wait for its result or error.
    ///
    /// Applies the configured default IQ timeout, if any.
    pub async fn send_iq(
        &self,
        to: Option<Jid>,
        kind: IqRequestKind,
        payload: Element,
    ) -> Result<IqResponse, SessionError> {
        match self.inner.config.default_iq_timeout {
            Some(timeout) => self.send_iq_with_timeout(to, kind, payload, timeout).await,
            None => self.request_iq(to, kind, payload)?.wait().await,
        }
    }

    /// Send an IQ request and wait at most `timeout` for the reply.
    ///
    /// On timeout the id is released, so a late reply is dropped.
    pub async fn send_iq_with_timeout(
        &self,
        to: Option<Jid>,
        kind: IqRequestKind,
        payload: Element,
        timeout: Duration,
    ) -> Result<IqResponse, SessionError> {
        let pending = self.request_iq(to, kind, payload)?;
        let id = pending.id().to_string();
        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(response) => response,
            Err(_) => {
                debug!(id = %id, ?timeout, "IQ timed out");
                Err(SessionError::IqTimeout { id })
            }
        }
    }

    /// Register a response cell under a fresh id and queue the request.
    ///
    /// The cell is registered before the request is queued so the reply
    /// can never outrun its waiter.
    #[instrument(skip(self, payload), fields(id))]
    fn request_iq(
        &self,
        to: Option<Jid>,
        kind: IqRequestKind,
        payload: Element,
    ) -> Result<PendingResponse, SessionError> {
        self.ensure_running()?;
        let id = self.generate_id();
        tracing::Span::current().record("id", id.as_str());

        let pending = self.inner.iq.register_pending(id.clone())?;
        self.inner.outbound.push(Stanza::IqRequest(IqRequest {
            id,
            from: None,
            to,
            kind,
            payload,
        }));
        Ok(pending)
    }

    /// Next id from the session counter ("1", "2", ...).
    pub fn generate_id(&self) -> String {
        self.inner.ids.next()
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Install a freshly negotiated stream and its writer.
    ///
    /// The read worker is paused while both are swapped, so it resumes on
    /// the new stream.
    pub async fn install_connection(
        &self,
        source: Box<dyn StanzaSource>,
        writer: Box<dyn RawWriter>,
    ) -> Result<(), SessionError> {
        self.ensure_running()?;
        let release = self.inner.workers.interrupter.pause()?;
        self.inner.workers.connection.open(source).await;
        self.inner.workers.writer.replace(writer).await;
        release.release();
        info!("Connection installed");
        Ok(())
    }

    /// Drop the current stream and put back a writer that always fails.
    ///
    /// Queued stanzas stay queued until the next connection is installed.
    pub async fn close_connection(&self) -> Result<(), SessionError> {
        self.ensure_running()?;
        let release = self.inner.workers.interrupter.pause()?;
        self.inner.workers.connection.close().await;
        self.inner
            .workers
            .writer
            .replace(Box::new(FailingWriter))
            .await;
        release.release();
        info!("Connection closed");
        Ok(())
    }

    /// Delivers interrupt tokens to the read worker.
    pub fn interrupter(&self) -> &Interrupter {
        &self.inner.workers.interrupter
    }

    pub fn connection_state(&self) -> &SharedConnectionState {
        &self.inner.workers.connection
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.workers.connection.status()
    }

    /// The writer slot shared with the workers.
    pub fn writer(&self) -> &WriterSlot {
        &self.inner.workers.writer
    }

    /// Get the number of stanzas waiting for the write worker.
    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.len()
    }

    /// Get the number of IQ requests awaiting a reply.
    pub fn pending_iq_count(&self) -> usize {
        self.inner.iq.pending_count()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop the workers and seal the writer slot.
    ///
    /// Pending IQ waiters are woken with [`SessionError::ResponseDropped`].
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.inner.workers.shutdown.shutdown().await;
        let dropped = self.inner.iq.clear_pending();
        if dropped > 0 {
            debug!(dropped, "Discarded pending IQ requests");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.workers.shutdown.is_shut_down()
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.is_shut_down() {
            return Err(SessionError::ShutDown);
        }
        Ok(())
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if !self.workers.shutdown.is_shut_down() {
            debug!("Last session handle dropped, cancelling workers");
            self.workers.shutdown.cancel();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.connection_status())
            .field("outbound", &self.outbound_len())
            .field("pending_iq", &self.pending_iq_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_decimal() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next(), "1");
        assert_eq!(ids.next(), "2");
        assert_eq!(ids.next(), "3");
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let session = Session::start(SessionConfig::default());
        session.shutdown().await;

        let result = session.send_message(Message::new(None::<Jid>));
        assert!(matches!(result, Err(SessionError::ShutDown)));
        assert!(matches!(
            session.send_raw(b" ").await,
            Err(SessionError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_send_queues_until_connected() {
        let session = Session::start(SessionConfig::default());
        session.send_message(Message::new(None::<Jid>)).unwrap();
        tokio::task::yield_now().await;
        // The default writer fails, so the stanza keeps being requeued.
        assert_eq!(session.outbound_len(), 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_wakes_pending_iq() {
        let session = Session::start(SessionConfig::default());
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .send_iq(
                        None,
                        IqRequestKind::Get,
                        Element::builder("ping", "urn:xmpp:ping").build(),
                    )
                    .await
            })
        };

        while session.pending_iq_count() == 0 {
            tokio::task::yield_now().await;
        }
        session.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SessionError::ResponseDropped { .. })));
    }
}
