//! Error types for the XMPP client session.

use thiserror::Error;

use crate::stanza::IqRequestKind;

/// Fatal failures of the underlying stream.
///
/// Returned by a [`StanzaSource`](crate::connection::StanzaSource) when the
/// stream can no longer produce stanzas, and by a
/// [`RawWriter`](crate::writer::RawWriter) when bytes could not be written.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The peer closed the connection
    #[error("Connection closed by peer")]
    Disconnected,

    /// IO error on the transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed XML on the stream
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// `<stream:error/>` received from the peer
    #[error("Stream error: {condition}")]
    Stream {
        /// Defined condition (e.g. `conflict`, `system-shutdown`)
        condition: String,
        /// Optional text description
        text: Option<String>,
    },
}

impl StreamError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new stream-level error with the given defined condition.
    pub fn stream(condition: impl Into<String>, text: Option<String>) -> Self {
        Self::Stream {
            condition: condition.into(),
            text,
        }
    }
}

/// Errors surfaced by the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has been shut down
    #[error("Session has been shut down")]
    ShutDown,

    /// A handler already listens on this request kind and namespace
    #[error("IQ handler already registered for {kind} {namespace:?}")]
    HandlerAlreadyRegistered {
        /// Request kind (get/set)
        kind: IqRequestKind,
        /// Payload namespace
        namespace: String,
    },

    /// A response cell is already pending under this id
    #[error("IQ id already pending: {0}")]
    DuplicateIqId(String),

    /// The pending response was discarded before a reply arrived
    #[error("IQ response for {id} was dropped")]
    ResponseDropped {
        /// IQ id
        id: String,
    },

    /// No reply arrived within the caller's timeout
    #[error("IQ {id} timed out")]
    IqTimeout {
        /// IQ id
        id: String,
    },

    /// Stanza could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Element could not be classified as a stanza
    #[error("Decode error: {0}")]
    Decode(String),

    /// A direct write through the writer slot failed
    #[error("Write failed: {0}")]
    Write(#[from] StreamError),

    /// The read worker is no longer running
    #[error("Read worker is not running")]
    ReaderGone,
}

impl SessionError {
    /// Create a new encode error.
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a new decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::stream("system-shutdown", None);
        assert_eq!(err.to_string(), "Stream error: system-shutdown");

        let err: StreamError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::HandlerAlreadyRegistered {
            kind: IqRequestKind::Get,
            namespace: "urn:xmpp:ping".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "IQ handler already registered for get \"urn:xmpp:ping\""
        );
    }
}
