//! IQ request/response correlation.
//!
//! Two maps:
//! - `(request kind, payload namespace)` → the handler queue that receives
//!   inbound requests as [`IqRequestTicket`]s;
//! - IQ id → the one-shot cell of a caller awaiting its reply.
//!
//! A response cell is removed from the map in the same step that claims
//! it, so each id is answered at most once and a late duplicate finds
//! nothing and is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace};
use xmpp_parsers::stanza_error::StanzaError;

use crate::broadcast::Subscription;
use crate::metrics;
use crate::outbound::OutboundQueue;
use crate::stanza::{IqError, IqRequest, IqRequestKind, IqResponse, IqResult, Stanza};
use crate::SessionError;

type HandlerKey = (IqRequestKind, String);

/// Correlates inbound IQ requests with handlers and inbound responses with waiters.
pub struct IqCorrelator {
    handlers: DashMap<HandlerKey, mpsc::UnboundedSender<IqRequestTicket>>,
    pending: DashMap<String, oneshot::Sender<IqResponse>>,
    outbound: Arc<OutboundQueue>,
}

impl IqCorrelator {
    /// Create a correlator whose tickets answer through `outbound`.
    pub fn new(outbound: Arc<OutboundQueue>) -> Self {
        Self {
            handlers: DashMap::new(),
            pending: DashMap::new(),
            outbound,
        }
    }

    /// Register the handler queue for `(kind, namespace)`.
    ///
    /// Fails if a live handler already owns the key. A key whose previous
    /// subscription was dropped is reclaimed.
    #[instrument(skip(self))]
    pub fn listen(
        &self,
        kind: IqRequestKind,
        namespace: &str,
    ) -> Result<Subscription<IqRequestTicket>, SessionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.handlers.entry((kind, namespace.to_string())) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                return Err(SessionError::HandlerAlreadyRegistered {
                    kind,
                    namespace: namespace.to_string(),
                });
            }
            Entry::Occupied(mut entry) => {
                debug!("Reclaiming IQ handler whose subscription was dropped");
                entry.insert(tx);
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        debug!("Registered IQ handler");
        Ok(Subscription::from_receiver(rx))
    }

    /// Remove the handler for `(kind, namespace)`. Returns whether one existed.
    pub fn unlisten(&self, kind: IqRequestKind, namespace: &str) -> bool {
        self.handlers
            .remove(&(kind, namespace.to_string()))
            .is_some()
    }

    /// Hand an inbound request to its handler as a fresh ticket.
    ///
    /// Returns `false` if no live handler is registered; the request is
    /// then dropped without a reply.
    pub fn route_request(&self, request: IqRequest) -> bool {
        let key = (request.kind, request.namespace());
        let Some(handler) = self.handlers.get(&key).map(|entry| entry.value().clone()) else {
            debug!(kind = %key.0, namespace = %key.1, id = %request.id, "No handler for IQ request");
            metrics::record_iq_unroutable("request");
            return false;
        };

        let ticket = IqRequestTicket::new(request, Arc::clone(&self.outbound));
        if handler.send(ticket).is_err() {
            debug!(kind = %key.0, namespace = %key.1, "IQ handler subscription dropped");
            self.handlers.remove_if(&key, |_, tx| tx.is_closed());
            metrics::record_iq_unroutable("request");
            return false;
        }
        true
    }

    /// Deliver an inbound response to the caller waiting on its id.
    ///
    /// Returns `false` if nobody is waiting (unknown id, already answered,
    /// or the caller gave up).
    pub fn route_response(&self, response: IqResponse) -> bool {
        let id = match &response {
            Ok(result) => result.id.clone(),
            Err(error) => error.id.clone(),
        };

        let Some((_, cell)) = self.pending.remove(&id) else {
            debug!(id = %id, "No pending request for IQ response");
            metrics::record_iq_unroutable("response");
            return false;
        };
        metrics::record_iq_pending(self.pending.len());

        if cell.send(response).is_err() {
            trace!(id = %id, "IQ waiter went away before the response arrived");
            return false;
        }
        true
    }

    /// Claim `id` for a new response cell.
    pub fn register_pending(self: &Arc<Self>, id: String) -> Result<PendingResponse, SessionError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::DuplicateIqId(id)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        metrics::record_iq_pending(self.pending.len());

        Ok(PendingResponse {
            id,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Get the number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Discard every pending response cell, waking their waiters.
    pub fn clear_pending(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        metrics::record_iq_pending(0);
        count
    }
}

/// A caller's claim on the reply to one outbound IQ request.
///
/// Dropping it before the reply arrives releases the id, so a late reply
/// is dropped rather than delivered into a cell nobody reads.
pub struct PendingResponse {
    id: String,
    rx: oneshot::Receiver<IqResponse>,
    correlator: Arc<IqCorrelator>,
}

impl PendingResponse {
    /// The id this cell is registered under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply.
    pub async fn wait(mut self) -> Result<IqResponse, SessionError> {
        (&mut self.rx)
            .await
            .map_err(|_| SessionError::ResponseDropped {
                id: self.id.clone(),
            })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.correlator.pending.remove(&self.id).is_some() {
            trace!(id = %self.id, "Released unanswered IQ id");
            metrics::record_iq_pending(self.correlator.pending.len());
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse").field("id", &self.id).finish()
    }
}

/// An inbound IQ request delivered to a handler.
///
/// The ticket can be answered at most once; the reply is queued for the
/// write worker like any other outbound stanza.
pub struct IqRequestTicket {
    request: IqRequest,
    answered: AtomicBool,
    outbound: Arc<OutboundQueue>,
}

impl IqRequestTicket {
    fn new(request: IqRequest, outbound: Arc<OutboundQueue>) -> Self {
        Self {
            request,
            answered: AtomicBool::new(false),
            outbound,
        }
    }

    /// The wrapped request.
    pub fn request(&self) -> &IqRequest {
        &self.request
    }

    /// Whether a reply has been sent for this request.
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    /// Reply with `result` (optional payload) or `error`.
    ///
    /// Returns `false` without sending anything if the ticket was already answered.
    pub fn answer(&self, response: Result<Option<Element>, StanzaError>) -> bool {
        if self
            .answered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let id = self.request.id.clone();
        let from = self.request.to.clone();
        let to = self.request.from.clone();
        let reply = match response {
            Ok(payload) => Stanza::IqResult(IqResult {
                id,
                from,
                to,
                payload,
            }),
            Err(error) => Stanza::IqError(IqError {
                id,
                from,
                to,
                error,
            }),
        };

        debug!(id = %self.request.id, kind = %reply.kind(), "Answering IQ request");
        self.outbound.push(reply);
        true
    }
}

impl std::fmt::Debug for IqRequestTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IqRequestTicket")
            .field("id", &self.request.id)
            .field("kind", &self.request.kind)
            .field("answered", &self.is_answered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType};

    fn correlator() -> (Arc<IqCorrelator>, Arc<OutboundQueue>) {
        let outbound = Arc::new(OutboundQueue::new());
        (Arc::new(IqCorrelator::new(Arc::clone(&outbound))), outbound)
    }

    fn ping_request(id: &str) -> IqRequest {
        IqRequest {
            id: id.to_string(),
            from: Some("juliet@example.com/balcony".parse().unwrap()),
            to: Some("romeo@example.net/orchard".parse().unwrap()),
            kind: IqRequestKind::Get,
            payload: Element::builder("ping", "urn:xmpp:ping").build(),
        }
    }

    fn result(id: &str) -> IqResponse {
        Ok(IqResult {
            id: id.to_string(),
            from: None,
            to: None,
            payload: None,
        })
    }

    #[test]
    fn test_request_routed_to_matching_handler() {
        let (iq, _) = correlator();
        let mut pings = iq.listen(IqRequestKind::Get, "urn:xmpp:ping").unwrap();
        let mut sets = iq.listen(IqRequestKind::Set, "urn:xmpp:ping").unwrap();

        assert!(iq.route_request(ping_request("1")));

        let ticket = pings.try_recv().expect("ticket delivered");
        assert_eq!(ticket.request().id, "1");
        assert!(!ticket.is_answered());
        assert!(pings.try_recv().is_none());
        assert!(sets.try_recv().is_none());
    }

    #[test]
    fn test_unroutable_request_is_dropped() {
        let (iq, outbound) = correlator();
        assert!(!iq.route_request(ping_request("1")));
        assert!(outbound.is_empty());
    }

    #[test]
    fn test_duplicate_listen_rejected_until_dropped() {
        let (iq, _) = correlator();
        let first = iq.listen(IqRequestKind::Get, "urn:xmpp:ping").unwrap();

        let err = iq.listen(IqRequestKind::Get, "urn:xmpp:ping").unwrap_err();
        assert!(matches!(err, SessionError::HandlerAlreadyRegistered { .. }));

        drop(first);
        assert!(iq.listen(IqRequestKind::Get, "urn:xmpp:ping").is_ok());
    }

    #[test]
    fn test_unlisten() {
        let (iq, _) = correlator();
        let _sub = iq.listen(IqRequestKind::Set, "jabber:iq:roster").unwrap();

        assert!(iq.unlisten(IqRequestKind::Set, "jabber:iq:roster"));
        assert!(!iq.unlisten(IqRequestKind::Set, "jabber:iq:roster"));
        assert!(!iq.route_request(IqRequest {
            kind: IqRequestKind::Set,
            payload: Element::builder("query", "jabber:iq:roster").build(),
            ..ping_request("2")
        }));
    }

    #[test]
    fn test_ticket_answers_once() {
        let (iq, outbound) = correlator();
        let mut pings = iq.listen(IqRequestKind::Get, "urn:xmpp:ping").unwrap();
        iq.route_request(ping_request("p1"));
        let ticket = pings.try_recv().unwrap();

        assert!(ticket.answer(Ok(None)));
        assert!(ticket.is_answered());

        let error = StanzaError::new(ErrorType::Cancel, DefinedCondition::Conflict, "en", "");
        assert!(!ticket.answer(Err(error)));

        assert_eq!(outbound.len(), 1);
        match outbound.pop() {
            Some(Stanza::IqResult(reply)) => {
                assert_eq!(reply.id, "p1");
                assert_eq!(reply.to, ticket.request().from);
                assert_eq!(reply.from, ticket.request().to);
            }
            other => panic!("unexpected reply: {:?}", other.map(|s| s.kind())),
        }
    }

    #[tokio::test]
    async fn test_response_delivered_exactly_once() {
        let (iq, _) = correlator();
        let pending = iq.register_pending("42".to_string()).unwrap();
        assert_eq!(iq.pending_count(), 1);

        assert!(iq.route_response(result("42")));
        assert!(!iq.route_response(result("42")));
        assert_eq!(iq.pending_count(), 0);

        let response = pending.wait().await.unwrap();
        assert_eq!(response.unwrap().id, "42");
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_rejected() {
        let (iq, _) = correlator();
        let _pending = iq.register_pending("7".to_string()).unwrap();
        let err = iq.register_pending("7".to_string()).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateIqId(id) if id == "7"));
    }

    #[test]
    fn test_dropping_pending_releases_id() {
        let (iq, _) = correlator();
        let pending = iq.register_pending("9".to_string()).unwrap();
        drop(pending);

        assert_eq!(iq.pending_count(), 0);
        assert!(!iq.route_response(result("9")));
    }

    #[tokio::test]
    async fn test_clear_pending_wakes_waiters() {
        let (iq, _) = correlator();
        let pending = iq.register_pending("5".to_string()).unwrap();

        assert_eq!(iq.clear_pending(), 1);
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, SessionError::ResponseDropped { id } if id == "5"));
    }
}
