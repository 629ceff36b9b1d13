//! Stanza types as seen by the session.
//!
//! Inbound elements are classified once, at decode time, into the seven
//! shapes the session routes on. Stanzas are immutable after that.

use jid::Jid;
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{self, Presence};
use xmpp_parsers::stanza_error::StanzaError;

/// Result of an IQ request: the peer's `result` or `error` reply.
pub type IqResponse = Result<IqResult, IqError>;

/// A classified XMPP stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    MessageError(MessageError),
    Presence(Presence),
    PresenceError(PresenceError),
    IqRequest(IqRequest),
    IqResult(IqResult),
    IqError(IqError),
}

impl Stanza {
    /// Get the stanza kind for tracing and metrics.
    pub fn kind(&self) -> StanzaKind {
        match self {
            Stanza::Message(_) => StanzaKind::Message,
            Stanza::MessageError(_) => StanzaKind::MessageError,
            Stanza::Presence(_) => StanzaKind::Presence,
            Stanza::PresenceError(_) => StanzaKind::PresenceError,
            Stanza::IqRequest(_) => StanzaKind::IqRequest,
            Stanza::IqResult(_) => StanzaKind::IqResult,
            Stanza::IqError(_) => StanzaKind::IqError,
        }
    }

    /// Get the stanza id, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(msg) => msg.id.as_deref(),
            Stanza::MessageError(err) => err.message.id.as_deref(),
            Stanza::Presence(pres) => pres.id.as_deref(),
            Stanza::PresenceError(err) => err.presence.id.as_deref(),
            Stanza::IqRequest(iq) => Some(&iq.id),
            Stanza::IqResult(iq) => Some(&iq.id),
            Stanza::IqError(iq) => Some(&iq.id),
        }
    }
}

/// Stanza kind for metrics and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    MessageError,
    Presence,
    PresenceError,
    IqRequest,
    IqResult,
    IqError,
}

impl std::fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaKind::Message => write!(f, "message"),
            StanzaKind::MessageError => write!(f, "message-error"),
            StanzaKind::Presence => write!(f, "presence"),
            StanzaKind::PresenceError => write!(f, "presence-error"),
            StanzaKind::IqRequest => write!(f, "iq-request"),
            StanzaKind::IqResult => write!(f, "iq-result"),
            StanzaKind::IqError => write!(f, "iq-error"),
        }
    }
}

/// A `<message type='error'/>`.
#[derive(Debug, Clone)]
pub struct MessageError {
    /// The original message
    pub message: Message,
    /// Parsed `<error/>` child, if present and well-formed
    pub error: Option<StanzaError>,
}

/// A `<presence type='error'/>`.
#[derive(Debug, Clone)]
pub struct PresenceError {
    /// The original presence
    pub presence: Presence,
    /// Parsed `<error/>` child, if present and well-formed
    pub error: Option<StanzaError>,
}

/// IQ request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqRequestKind {
    Get,
    Set,
}

impl std::fmt::Display for IqRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IqRequestKind::Get => write!(f, "get"),
            IqRequestKind::Set => write!(f, "set"),
        }
    }
}

/// An inbound or outbound `<iq type='get|set'/>`.
#[derive(Debug, Clone)]
pub struct IqRequest {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: IqRequestKind,
    pub payload: Element,
}

impl IqRequest {
    /// Namespace of the request payload (empty if the payload has none).
    pub fn namespace(&self) -> String {
        self.payload.ns()
    }
}

/// An `<iq type='result'/>`.
#[derive(Debug, Clone)]
pub struct IqResult {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub payload: Option<Element>,
}

/// An `<iq type='error'/>`.
#[derive(Debug, Clone)]
pub struct IqError {
    pub id: String,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub error: StanzaError,
}

/// Find and parse the `<error/>` child among unknown payloads.
fn extract_error(payloads: &[Element]) -> Option<StanzaError> {
    payloads
        .iter()
        .find(|payload| payload.name() == "error")
        .and_then(|payload| StanzaError::try_from(payload.clone()).ok())
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        if matches!(message.type_, MessageType::Error) {
            let error = extract_error(&message.payloads);
            Stanza::MessageError(MessageError { message, error })
        } else {
            Stanza::Message(message)
        }
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        if matches!(presence.type_, presence::Type::Error) {
            let error = extract_error(&presence.payloads);
            Stanza::PresenceError(PresenceError { presence, error })
        } else {
            Stanza::Presence(presence)
        }
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        let Iq { from, to, id, payload } = iq;
        match payload {
            IqType::Get(payload) => Stanza::IqRequest(IqRequest {
                id,
                from,
                to,
                kind: IqRequestKind::Get,
                payload,
            }),
            IqType::Set(payload) => Stanza::IqRequest(IqRequest {
                id,
                from,
                to,
                kind: IqRequestKind::Set,
                payload,
            }),
            IqType::Result(payload) => Stanza::IqResult(IqResult { id, from, to, payload }),
            IqType::Error(error) => Stanza::IqError(IqError { id, from, to, error }),
        }
    }
}

impl From<IqRequest> for Iq {
    fn from(request: IqRequest) -> Self {
        let payload = match request.kind {
            IqRequestKind::Get => IqType::Get(request.payload),
            IqRequestKind::Set => IqType::Set(request.payload),
        };
        Iq {
            from: request.from,
            to: request.to,
            id: request.id,
            payload,
        }
    }
}

impl From<IqResult> for Iq {
    fn from(result: IqResult) -> Self {
        Iq {
            from: result.from,
            to: result.to,
            id: result.id,
            payload: IqType::Result(result.payload),
        }
    }
}

impl From<IqError> for Iq {
    fn from(error: IqError) -> Self {
        Iq {
            from: error.from,
            to: error.to,
            id: error.id,
            payload: IqType::Error(error.error),
        }
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Self {
        match stanza {
            Stanza::Message(msg) => msg.into(),
            Stanza::MessageError(err) => err.message.into(),
            Stanza::Presence(pres) => pres.into(),
            Stanza::PresenceError(err) => err.presence.into(),
            Stanza::IqRequest(iq) => Iq::from(iq).into(),
            Stanza::IqResult(iq) => Iq::from(iq).into(),
            Stanza::IqError(iq) => Iq::from(iq).into(),
        }
    }
}
