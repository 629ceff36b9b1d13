//! Worker lifecycle: spawning the three session workers and shutting them down.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::codec::StanzaEncoder;
use crate::config::SessionConfig;
use crate::connection::SharedConnectionState;
use crate::interrupt::Interrupter;
use crate::outbound::OutboundQueue;
use crate::workers::{ClosedFn, DispatchFn, KeepAliveWorker, ReadWorker, WriteWorker};
use crate::writer::{WriterGuard, WriterSlot};

/// Handles returned by [`start`].
#[derive(Debug, Clone)]
pub struct SessionWorkers {
    /// Stops every worker and seals the writer slot
    pub shutdown: ShutdownHandle,
    /// Writer slot shared with the write and keep-alive workers
    pub writer: WriterSlot,
    /// Connection state read by the read worker
    pub connection: SharedConnectionState,
    /// Interrupt channel into the read worker
    pub interrupter: Interrupter,
}

/// Spawn the read, write and keep-alive workers.
///
/// The writer slot starts with a writer that always fails and the
/// connection starts out as `NoConnection`. Must be called from within a
/// Tokio runtime.
pub fn start(
    config: &SessionConfig,
    encoder: Arc<dyn StanzaEncoder>,
    outbound: Arc<OutboundQueue>,
    dispatch: DispatchFn,
    on_closed: ClosedFn,
) -> SessionWorkers {
    let cancel = CancellationToken::new();
    let writer = WriterSlot::default();
    let connection = SharedConnectionState::new();
    let (interrupter, interrupts) = Interrupter::channel();

    let write = WriteWorker::new(
        outbound,
        writer.clone(),
        encoder,
        config.write_retry_backoff,
    );
    let keep_alive = KeepAliveWorker::new(
        writer.clone(),
        config.keep_alive_interval,
        config.keep_alive_payload.clone(),
    );
    let read = ReadWorker::new(connection.clone(), interrupts, dispatch, on_closed);

    let tasks = vec![
        spawn_cancellable(&cancel, write.run().instrument(info_span!("xmpp.session.write"))),
        spawn_cancellable(
            &cancel,
            keep_alive
                .run()
                .instrument(info_span!("xmpp.session.keepalive")),
        ),
        spawn_cancellable(&cancel, read.run().instrument(info_span!("xmpp.session.read"))),
    ];

    info!("Session workers started");

    SessionWorkers {
        shutdown: ShutdownHandle {
            inner: Arc::new(ShutdownInner {
                cancel,
                writer: writer.clone(),
                sealed: tokio::sync::Mutex::new(None),
                tasks: Mutex::new(tasks),
            }),
        },
        writer,
        connection,
        interrupter,
    }
}

fn spawn_cancellable<F>(cancel: &CancellationToken, worker: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = worker => {}
        }
    })
}

/// Stops the session's workers.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    cancel: CancellationToken,
    writer: WriterSlot,
    /// Writer guard held for the rest of the session's life once shut down
    sealed: tokio::sync::Mutex<Option<WriterGuard>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownHandle {
    /// Seal the writer slot, then stop and join every worker.
    ///
    /// Waits for an in-flight write to finish before sealing. Calling it
    /// again after the workers are gone returns once the slot is sealed.
    pub async fn shutdown(&self) {
        {
            let mut sealed = self.inner.sealed.lock().await;
            if sealed.is_none() {
                *sealed = Some(self.inner.writer.acquire().await);
                debug!("Writer slot sealed");
            }
        }

        self.inner.cancel.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if tasks.is_empty() {
            return;
        }

        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "Session worker panicked");
                }
            }
        }
        info!("Session workers stopped");
    }

    /// Stop the workers without waiting for them or sealing the writer.
    ///
    /// Each worker is dropped at its next await point.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether the workers have been told to stop.
    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}
