//! Inbound stanza dispatch.
//!
//! The read worker hands every pulled stanza to [`StanzaRouter::route`],
//! which fans it out to the broadcast buses and the IQ correlator.

use std::sync::Arc;

use tracing::trace;

use crate::broadcast::StanzaBuses;
use crate::iq::IqCorrelator;
use crate::stanza::Stanza;

/// Routes inbound stanzas to buses and IQ handlers/waiters.
#[derive(Clone)]
pub struct StanzaRouter {
    buses: Arc<StanzaBuses>,
    iq: Arc<IqCorrelator>,
}

impl StanzaRouter {
    pub fn new(buses: Arc<StanzaBuses>, iq: Arc<IqCorrelator>) -> Self {
        Self { buses, iq }
    }

    /// Dispatch one inbound stanza.
    ///
    /// - every stanza goes to the generic bus;
    /// - messages and presences additionally go to their typed bus, errors as `Err`;
    /// - IQ requests go to the handler registered for `(kind, namespace)`;
    /// - IQ results and errors complete the matching pending request.
    pub fn route(&self, stanza: Stanza) {
        let delivered = self.buses.stanzas.publish(stanza.clone());
        trace!(kind = %stanza.kind(), subscribers = delivered, "Broadcast stanza");

        match stanza {
            Stanza::Message(msg) => {
                self.buses.messages.publish(Ok(msg));
            }
            Stanza::MessageError(err) => {
                self.buses.messages.publish(Err(err));
            }
            Stanza::Presence(pres) => {
                self.buses.presences.publish(Ok(pres));
            }
            Stanza::PresenceError(err) => {
                self.buses.presences.publish(Err(err));
            }
            Stanza::IqRequest(request) => {
                // TODO: answer unhandled requests with service-unavailable (RFC 6120 8.4).
                self.iq.route_request(request);
            }
            Stanza::IqResult(result) => {
                self.iq.route_response(Ok(result));
            }
            Stanza::IqError(error) => {
                self.iq.route_response(Err(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundQueue;
    use crate::stanza::{IqRequest, IqRequestKind, IqResult, StanzaKind};
    use minidom::Element;
    use xmpp_parsers::message::{Message, MessageType};
    use xmpp_parsers::presence::{self, Presence};

    fn router() -> (StanzaRouter, Arc<StanzaBuses>, Arc<IqCorrelator>) {
        let buses = Arc::new(StanzaBuses::new());
        let iq = Arc::new(IqCorrelator::new(Arc::new(OutboundQueue::new())));
        (
            StanzaRouter::new(Arc::clone(&buses), Arc::clone(&iq)),
            buses,
            iq,
        )
    }

    fn message(id: &str, type_: MessageType) -> Stanza {
        let mut msg = Message::new(None::<jid::Jid>);
        msg.id = Some(id.to_string());
        msg.type_ = type_;
        Stanza::from(msg)
    }

    #[test]
    fn test_messages_fan_out() {
        let (router, buses, _) = router();
        let mut all = buses.stanzas.subscribe();
        let mut messages = buses.messages.subscribe();
        let mut presences = buses.presences.subscribe();

        router.route(message("1", MessageType::Chat));
        router.route(message("2", MessageType::Error));
        router.route(Stanza::from(Presence::new(presence::Type::None)));

        assert_eq!(all.try_recv().unwrap().id(), Some("1"));
        assert_eq!(all.try_recv().unwrap().id(), Some("2"));
        assert_eq!(all.try_recv().unwrap().kind(), StanzaKind::Presence);
        assert!(all.try_recv().is_none());

        match messages.try_recv() {
            Some(Ok(msg)) => assert_eq!(msg.id.as_deref(), Some("1")),
            other => panic!("expected message, got {:?}", other.map(|r| r.is_ok())),
        }
        match messages.try_recv() {
            Some(Err(err)) => assert_eq!(err.message.id.as_deref(), Some("2")),
            other => panic!("expected message error, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(messages.try_recv().is_none());

        assert!(matches!(presences.try_recv(), Some(Ok(_))));
        assert!(presences.try_recv().is_none());
    }

    #[test]
    fn test_iq_request_reaches_handler() {
        let (router, _, iq) = router();
        let mut handler = iq.listen(IqRequestKind::Get, "urn:xmpp:ping").unwrap();

        router.route(Stanza::IqRequest(IqRequest {
            id: "ping-1".to_string(),
            from: None,
            to: None,
            kind: IqRequestKind::Get,
            payload: Element::builder("ping", "urn:xmpp:ping").build(),
        }));

        let ticket = handler.try_recv().expect("ticket");
        assert_eq!(ticket.request().id, "ping-1");
        assert!(!ticket.is_answered());
    }

    #[tokio::test]
    async fn test_iq_result_completes_pending() {
        let (router, _, iq) = router();
        let pending = iq.register_pending("r1".to_string()).unwrap();

        router.route(Stanza::IqResult(IqResult {
            id: "r1".to_string(),
            from: None,
            to: None,
            payload: None,
        }));

        let response = pending.wait().await.unwrap();
        assert!(response.is_ok());
    }
}
