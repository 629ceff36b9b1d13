//! # waddle-session
//!
//! Concurrency core of a Waddle XMPP client session.
//!
//! Turns one ordered stanza stream into a multi-producer, multi-consumer
//! session. Transport, TLS and stream negotiation live elsewhere and plug
//! in through the [`StanzaSource`] and [`RawWriter`] traits.
//!
//! ## Architecture
//!
//! - **Read worker**: pulls stanzas off the open connection and routes them
//!   to the broadcast buses and the IQ correlator
//! - **Write worker**: drains the outbound queue in FIFO order, retrying
//!   failed writes in place
//! - **Keep-alive worker**: writes a whitespace ping every 30 seconds
//! - **Broadcast buses**: message, presence and generic stanza fan-out to
//!   any number of subscribers
//! - **IQ correlator**: routes inbound requests to namespace handlers and
//!   replies to the caller waiting on their id
//! - **Interrupts**: pause the read worker at a safe point so a controller
//!   can swap the connection

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod connection;
pub mod interrupt;
pub mod iq;
pub mod metrics;
pub mod outbound;
pub mod router;
pub mod session;
pub mod stanza;
pub mod supervisor;
pub mod workers;
pub mod writer;

mod error;

pub use broadcast::{Bus, StanzaBuses, Subscription};
pub use codec::{parse_stanza, stanza_from_element, StanzaEncoder, XmlEncoder};
pub use config::SessionConfig;
pub use connection::{ConnectionState, ConnectionStatus, SharedConnectionState, StanzaSource};
pub use error::{SessionError, StreamError};
pub use interrupt::{interrupt_token, InterruptRelease, InterruptToken, Interrupter};
pub use iq::{IqCorrelator, IqRequestTicket, PendingResponse};
pub use session::{ClosedHandler, Session};
pub use stanza::{
    IqError, IqRequest, IqRequestKind, IqResponse, IqResult, MessageError, PresenceError, Stanza,
    StanzaKind,
};
pub use supervisor::{ShutdownHandle, SessionWorkers};
pub use writer::{FailingWriter, RawWriter, WriterSlot};
