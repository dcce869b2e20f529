//! The [`Reloader`] handle: bind or resume, then serve until drained.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ReloaderConfig;
use crate::error::{ReloadError, Result};
use crate::handoff;
use crate::listener::{ListenerSlot, ReloadListener};
use crate::tracker::ConnectionTracker;
use crate::watcher::{self, LifecycleSignal, SignalSource, WatcherState};

/// An application server that can stop accepting and finish in-flight work
/// on request.
///
/// When one is attached, terminate asks it to shut down instead of relying
/// on the listener close alone.
pub trait GracefulServer: Send + 'static {
    /// Begin a graceful shutdown. Must not block.
    fn shutdown(&self);
}

impl GracefulServer for CancellationToken {
    fn shutdown(&self) {
        self.cancel();
    }
}

pub(crate) struct Shared {
    addr: String,
    drain_timeout: Option<Duration>,
    slot: Arc<ListenerSlot>,
    tracker: ConnectionTracker,
    server: Mutex<Option<Box<dyn GracefulServer>>>,
    signals: OnceLock<mpsc::Sender<LifecycleSignal>>,
    /// Cancelled on entering [`WatcherState::Draining`].
    stop: CancellationToken,
    /// Cancelled when the last handle is dropped; ends the signal tasks.
    detached: CancellationToken,
    bound: AtomicBool,
    resumed: AtomicBool,
}

impl Shared {
    pub(crate) fn spawn_replacement(&self) -> Result<u32> {
        let listener = self.slot.current().map_err(|_| ReloadError::NotBound)?;
        handoff::spawn_replacement(&listener)
    }

    pub(crate) fn begin_drain(&self) {
        info!(
            active_connections = self.tracker.active(),
            "Stopping accept loop"
        );
        self.stop.cancel();

        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(server) = server {
            info!("Asking attached server to shut down gracefully");
            server.shutdown();
        }

        self.slot.close();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.detached.cancel();
        self.slot.close();
    }
}

/// Zero-downtime restart coordinator for a single listening socket.
///
/// ```no_run
/// # async fn run() -> waddle_reloader::Result<()> {
/// use waddle_reloader::{is_listener_closed, Reloader};
///
/// let reloader = Reloader::new("127.0.0.1:9001");
/// reloader.bind().await?;
///
/// let listener = reloader.listener()?;
/// loop {
///     match listener.accept().await {
///         Ok((stream, _peer)) => {
///             tokio::spawn(async move {
///                 // serve `stream`; dropping it ends the connection
///                 drop(stream);
///             });
///         }
///         Err(e) if is_listener_closed(&e) => break,
///         Err(_) => continue,
///     }
/// }
/// reloader.wait().await;
/// # Ok(())
/// # }
/// ```
///
/// Reload with `kill -HUP <pid>`.
///
/// Clones share one socket. Dropping the last clone closes the socket and
/// stops reacting to signals.
#[derive(Clone)]
pub struct Reloader {
    shared: Arc<Shared>,
}

impl Reloader {
    /// Create a reloader for `listen` (`host:port`). Nothing is bound yet.
    pub fn new(listen: impl Into<String>) -> Self {
        Self::from_config(&ReloaderConfig::new(listen))
    }

    pub fn from_config(config: &ReloaderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                addr: config.listen.clone(),
                drain_timeout: config.drain_timeout,
                slot: Arc::new(ListenerSlot::default()),
                tracker: ConnectionTracker::new(),
                server: Mutex::new(None),
                signals: OnceLock::new(),
                stop: CancellationToken::new(),
                detached: CancellationToken::new(),
                bound: AtomicBool::new(false),
                resumed: AtomicBool::new(false),
            }),
        }
    }

    /// Configured listen address.
    pub fn listen_addr(&self) -> &str {
        &self.shared.addr
    }

    /// Acquire the listening socket and start the signal watcher.
    ///
    /// Fresh start: bind the configured address. Resumed child (`RELOADING`
    /// set): adopt fd 3 and send SIGTERM to the parent. A resumed child
    /// that cannot adopt its socket aborts the process.
    ///
    /// Must be called once, inside a Tokio runtime.
    pub async fn bind(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.bound.swap(true, Ordering::SeqCst) {
            return Err(ReloadError::AlreadyBound);
        }

        let source = match SignalSource::register() {
            Ok(source) => source,
            Err(e) => {
                shared.bound.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let listener = if handoff::is_resume() {
            let listener = handoff::adopt_inherited();
            shared.resumed.store(true, Ordering::SeqCst);
            handoff::acknowledge_parent();
            listener
        } else {
            match TcpListener::bind(shared.addr.as_str()).await {
                Ok(listener) => {
                    info!(addr = ?listener.local_addr().ok(), "Bound listener");
                    listener
                }
                Err(source) => {
                    shared.bound.store(false, Ordering::SeqCst);
                    return Err(ReloadError::Bind {
                        addr: shared.addr.clone(),
                        source,
                    });
                }
            }
        };

        shared.slot.install(listener);
        let tx = watcher::spawn(Arc::downgrade(shared), shared.detached.clone(), source);
        let _ = shared.signals.set(tx);
        Ok(())
    }

    /// Whether the socket was inherited from a reloading parent.
    pub fn is_resumed(&self) -> bool {
        self.shared.resumed.load(Ordering::SeqCst)
    }

    /// Accept-capable handle for the caller's server loop.
    pub fn listener(&self) -> Result<ReloadListener> {
        if !self.shared.bound.load(Ordering::SeqCst) {
            return Err(ReloadError::NotBound);
        }
        Ok(ReloadListener::new(
            Arc::clone(&self.shared.slot),
            self.shared.tracker.clone(),
        ))
    }

    /// Local address of the listening socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.shared
            .slot
            .current()
            .and_then(|listener| listener.local_addr())
            .map_err(|_| ReloadError::NotBound)
    }

    /// Attach an application server to be shut down gracefully on terminate.
    ///
    /// Replaces any previously attached server. If draining has already
    /// begun, the server is shut down immediately.
    pub fn attach<S: GracefulServer>(&self, server: S) {
        if self.shared.stop.is_cancelled() {
            server.shutdown();
            return;
        }
        let server: Box<dyn GracefulServer> = Box::new(server);
        *self
            .shared
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(server);

        // Terminate may have raced the store above.
        if self.shared.stop.is_cancelled() {
            self.shared.begin_drain();
        }
    }

    /// Serve `router` with axum until terminated, then close the listener.
    ///
    /// Axum drains in-flight requests itself, so no [`wait`](Self::wait) is
    /// needed afterwards.
    #[cfg(feature = "http")]
    pub async fn serve(&self, router: axum::Router) -> Result<()> {
        let listener = self.listener()?;
        let token = CancellationToken::new();
        self.attach(token.clone());

        info!(addr = ?self.local_addr().ok(), "Starting HTTP server");
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await;

        self.close();
        info!("HTTP server stopped");
        result.map_err(ReloadError::Serve)
    }

    /// Wait until no accepted connections remain open.
    ///
    /// Does not stop new connections from arriving; close or drain first.
    pub async fn wait(&self) {
        self.shared.tracker.wait().await;
    }

    /// Blocking form of [`wait`](Self::wait) for threads outside the runtime.
    ///
    /// Must not be called from within an async context.
    pub fn wait_blocking(&self) {
        futures::executor::block_on(self.shared.tracker.wait());
    }

    /// Wait for connections to finish, bounded by the configured drain
    /// timeout if there is one.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self) -> bool {
        match self.shared.drain_timeout {
            Some(timeout) => self.shared.tracker.wait_timeout(timeout).await,
            None => {
                self.shared.tracker.wait().await;
                true
            }
        }
    }

    /// Number of accepted connections not yet closed.
    pub fn active_connections(&self) -> usize {
        self.shared.tracker.active()
    }

    /// Close the listening socket. Pending accepts return "listener closed".
    ///
    /// Returns `false` if it was not open.
    pub fn close(&self) -> bool {
        self.shared.slot.close()
    }

    /// Current watcher state.
    pub fn state(&self) -> WatcherState {
        if self.shared.stop.is_cancelled() {
            WatcherState::Draining
        } else {
            WatcherState::Active
        }
    }

    /// Token cancelled once terminate has been processed.
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop.clone()
    }

    /// Queue `signal` as if it had been raised by the OS.
    ///
    /// Returns `false` before [`bind`](Self::bind) and once the watcher is
    /// draining.
    pub async fn trigger(&self, signal: LifecycleSignal) -> bool {
        match self.shared.signals.get() {
            Some(tx) => tx.send(signal).await.is_ok(),
            None => false,
        }
    }
}
