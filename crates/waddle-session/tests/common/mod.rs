//! Test utilities for session integration tests.
//!
//! Provides a channel-backed stanza source and a recording writer so tests
//! can feed the read worker and observe the write path without a socket.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use waddle_session::{RawWriter, Stanza, StanzaSource, StreamError};
use xmpp_parsers::message::Message;
use xmpp_parsers::presence::{self, Presence};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing once for the test binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// Stanza source fed from a test-held channel.
///
/// `pull` blocks until the test pushes an item; a closed channel reads as
/// a peer disconnect.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Stanza, StreamError>>,
}

/// Test side of a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceFeed {
    tx: mpsc::UnboundedSender<Result<Stanza, StreamError>>,
}

impl SourceFeed {
    pub fn stanza(&self, stanza: Stanza) {
        let _ = self.tx.send(Ok(stanza));
    }

    pub fn fail(&self, error: StreamError) {
        let _ = self.tx.send(Err(error));
    }
}

pub fn channel_source() -> (Box<dyn StanzaSource>, SourceFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(ChannelSource { rx }), SourceFeed { tx })
}

#[async_trait]
impl StanzaSource for ChannelSource {
    async fn pull(&mut self) -> Result<Stanza, StreamError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(StreamError::Disconnected),
        }
    }
}

/// Writer that records every payload and can be told to fail the first
/// `failures` sends.
pub struct RecordingWriter {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: usize,
}

/// Shared view of what a [`RecordingWriter`] wrote.
#[derive(Clone, Default)]
pub struct Written(Arc<Mutex<Vec<Vec<u8>>>>);

impl Written {
    pub fn all(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }

    /// Written payloads other than whitespace keep-alives, as strings.
    pub fn stanzas(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|bytes| !bytes.iter().all(u8::is_ascii_whitespace))
            .map(|bytes| String::from_utf8(bytes).unwrap())
            .collect()
    }

    pub fn keep_alives(&self) -> usize {
        self.all().iter().filter(|bytes| bytes.as_slice() == b" ").count()
    }
}

pub fn recording_writer(failures: usize) -> (Box<dyn RawWriter>, Written) {
    let written = Written::default();
    (
        Box::new(RecordingWriter {
            written: Arc::clone(&written.0),
            failures,
        }),
        written,
    )
}

#[async_trait]
impl RawWriter for RecordingWriter {
    async fn send(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(StreamError::Disconnected);
        }
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

pub fn message(id: &str) -> Stanza {
    let mut msg = Message::new(None::<jid::Jid>);
    msg.id = Some(id.to_string());
    Stanza::from(msg)
}

pub fn presence(id: &str) -> Stanza {
    let mut pres = Presence::new(presence::Type::None);
    pres.id = Some(id.to_string());
    Stanza::from(pres)
}
