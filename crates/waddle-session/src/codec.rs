//! Stanza marshaling between [`Stanza`] values and XML.
//!
//! The session itself treats stanzas as opaque values: the write worker
//! only needs a [`StanzaEncoder`], and transports use the decode helpers
//! here to turn parsed elements into [`Stanza`]s for their `pull`.

use minidom::Element;
use xmpp_parsers::iq::Iq;
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::Presence;

use crate::stanza::Stanza;
use crate::SessionError;

/// Serializes outbound stanzas into wire bytes.
pub trait StanzaEncoder: Send + Sync + 'static {
    fn encode(&self, stanza: &Stanza) -> Result<Vec<u8>, SessionError>;
}

/// Default encoder: minidom serialization in the `jabber:client` namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlEncoder;

impl StanzaEncoder for XmlEncoder {
    fn encode(&self, stanza: &Stanza) -> Result<Vec<u8>, SessionError> {
        let element = Element::from(stanza.clone());
        element_to_string(&element).map(String::into_bytes)
    }
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, SessionError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| SessionError::encode(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| SessionError::encode(format!("Invalid UTF-8: {}", e)))
}

/// Classify a top-level stream element into a [`Stanza`].
pub fn stanza_from_element(element: Element) -> Result<Stanza, SessionError> {
    let name = element.name().to_string();
    match name.as_str() {
        "message" => Message::try_from(element)
            .map(Stanza::from)
            .map_err(|e| SessionError::decode(format!("Invalid message: {:?}", e))),
        "presence" => Presence::try_from(element)
            .map(Stanza::from)
            .map_err(|e| SessionError::decode(format!("Invalid presence: {:?}", e))),
        "iq" => Iq::try_from(element)
            .map(Stanza::from)
            .map_err(|e| SessionError::decode(format!("Invalid iq: {:?}", e))),
        other => Err(SessionError::decode(format!("Not a stanza: <{}/>", other))),
    }
}

/// Parse a single serialized stanza.
pub fn parse_stanza(xml: &str) -> Result<Stanza, SessionError> {
    let element = xml
        .parse::<Element>()
        .map_err(|e| SessionError::decode(format!("Failed to parse element: {}", e)))?;
    stanza_from_element(element)
}
