//! Signal-driven lifecycle.
//!
//! - `SIGHUP` → reload: launch a replacement that inherits the listener,
//!   keep serving until it acknowledges.
//! - `SIGTERM` → terminate: stop accepting and let connections drain.
//!
//! OS signals and [`Reloader::trigger`](crate::Reloader::trigger) feed one
//! bounded FIFO consumed by a single watcher task. The first terminate is
//! terminal: the watcher stops reading and later signals are discarded.
//! Tokio keeps its handlers installed, so they no longer kill the process.
//!
//! Both tasks only hold a weak reference to the reloader and stop once its
//! last handle is dropped.

use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures::stream::{self, Stream, StreamExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ReloadError, Result};
use crate::reloader::Shared;

/// Enough room for a reload immediately followed by a terminate.
const SIGNAL_QUEUE_DEPTH: usize = 2;

/// External stimulus understood by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// `SIGHUP`: hand the listener to a fresh process.
    Reload,
    /// `SIGTERM`: stop accepting and drain.
    Terminate,
}

/// Watcher state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Serving; reload and terminate are both honoured.
    Active,
    /// Terminal: accepting has stopped and signals are ignored.
    Draining,
}

type Trigger = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// OS signal streams, registered before anything is bound so that a
/// registration failure leaves no socket behind.
pub(crate) struct SignalSource {
    hangup: Trigger,
    terminate: Trigger,
}

impl SignalSource {
    pub(crate) fn register() -> Result<Self> {
        Ok(Self::from_streams(
            os_signal(SignalKind::hangup())?,
            os_signal(SignalKind::terminate())?,
        ))
    }

    fn from_streams(
        hangup: impl Stream<Item = ()> + Send + 'static,
        terminate: impl Stream<Item = ()> + Send + 'static,
    ) -> Self {
        Self {
            hangup: Box::pin(hangup),
            terminate: Box::pin(terminate),
        }
    }
}

fn os_signal(kind: SignalKind) -> Result<impl Stream<Item = ()> + Send + 'static> {
    let signal = signal(kind).map_err(ReloadError::Signal)?;
    Ok(stream::unfold(signal, |mut signal| async move {
        signal.recv().await.map(|()| ((), signal))
    }))
}

/// Start the feeder and watcher tasks. Returns the queue's sender.
///
/// Both tasks end when `detached` is cancelled.
pub(crate) fn spawn(
    shared: Weak<Shared>,
    detached: CancellationToken,
    source: SignalSource,
) -> mpsc::Sender<LifecycleSignal> {
    let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
    tokio::spawn(feed(source, tx.clone(), detached.clone()));
    tokio::spawn(watch(shared, rx, detached));
    tx
}

async fn feed(
    mut source: SignalSource,
    tx: mpsc::Sender<LifecycleSignal>,
    detached: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            // Both pending at the same wakeup: terminate wins.
            biased;
            _ = detached.cancelled() => break,
            Some(()) = source.terminate.next() => LifecycleSignal::Terminate,
            Some(()) = source.hangup.next() => LifecycleSignal::Reload,
        };

        debug!(?signal, "Received OS signal");
        if tx.send(signal).await.is_err() {
            debug!(?signal, "Watcher is draining, ignoring signal");
            break;
        }
    }
}

async fn watch(
    shared: Weak<Shared>,
    mut rx: mpsc::Receiver<LifecycleSignal>,
    detached: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = detached.cancelled() => break,
            Some(signal) = rx.recv() => signal,
            else => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match signal {
            LifecycleSignal::Reload => {
                info!("Reload requested, launching replacement process");
                if let Err(e) = shared.spawn_replacement() {
                    error!(error = %e, "Restart failed, continuing to serve");
                }
            }
            LifecycleSignal::Terminate => {
                info!("Terminate requested, draining");
                shared.begin_drain();
                break;
            }
        }
    }
    debug!("Signal watcher stopped");
}
