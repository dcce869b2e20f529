//! Listening socket wrapper.
//!
//! [`ReloadListener`] holds the process's one listening socket and counts
//! every accepted connection in the shared [`ConnectionTracker`]. Closing
//! the socket wakes every pending `accept` with a "listener closed" error.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::listener_closed;
use crate::tracker::{ConnectionGuard, ConnectionTracker};

/// Holder for the listening socket shared by the reloader and its listeners.
#[derive(Default)]
pub(crate) struct ListenerSlot {
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
}

impl ListenerSlot {
    pub(crate) fn install(&self, listener: TcpListener) {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(slot.is_none(), "listener installed twice");
        *slot = Some(Arc::new(listener));
    }

    /// The live socket, or the "listener closed" error.
    pub(crate) fn current(&self) -> io::Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(listener_closed)
    }

    /// Close the socket. Returns `false` if it was already closed.
    ///
    /// The descriptor itself is released once in-progress accepts observe
    /// the cancellation and drop their handles.
    pub(crate) fn close(&self) -> bool {
        let taken = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();

        match taken {
            Some(listener) => {
                info!(addr = ?listener.local_addr().ok(), "Closed listening socket");
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Accept-capable handle over the reloader's listening socket.
///
/// Cloning is cheap; all clones share the socket and the connection
/// counter. Run a single accept loop per process.
#[derive(Clone)]
pub struct ReloadListener {
    slot: Arc<ListenerSlot>,
    tracker: ConnectionTracker,
}

impl ReloadListener {
    pub(crate) fn new(slot: Arc<ListenerSlot>, tracker: ConnectionTracker) -> Self {
        Self { slot, tracker }
    }

    /// Accept the next inbound connection.
    ///
    /// Resolves with a [`TrackedStream`] counted as in flight until it is
    /// closed or dropped. Once the listener is closed, returns an error for
    /// which [`is_listener_closed`](crate::is_listener_closed) holds; other
    /// errors are passed through untouched and nothing is counted.
    pub async fn accept(&self) -> io::Result<(TrackedStream, SocketAddr)> {
        let listener = self.slot.current()?;

        tokio::select! {
            biased;
            _ = self.slot.closed.cancelled() => Err(listener_closed()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let guard = self.tracker.register();
                debug!(%peer, active = self.tracker.active(), "Accepted connection");
                Ok((TrackedStream::new(stream, guard), peer))
            }
        }
    }

    /// Local address of the listening socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.slot.current()?.local_addr()
    }

    /// Whether the listening socket has been closed.
    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }
}

/// An accepted connection counted by the reloader.
///
/// Reads and writes go straight to the inner [`TcpStream`].
pub struct TrackedStream {
    stream: TcpStream,
    guard: ConnectionGuard,
}

impl TrackedStream {
    fn new(stream: TcpStream, guard: ConnectionGuard) -> Self {
        Self { stream, guard }
    }

    /// Shut down the write half and stop counting this connection.
    ///
    /// The counter is decremented on the first call whatever the shutdown
    /// result; later calls do nothing and return `Ok(())`.
    pub async fn close(&mut self) -> io::Result<()> {
        if !self.guard.is_active() {
            return Ok(());
        }
        let result = self.stream.shutdown().await;
        self.guard.release();
        result
    }

    /// Whether this connection still counts as in flight.
    pub fn is_tracked(&self) -> bool {
        self.guard.is_active()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Split into the raw stream and its guard. The connection stays
    /// counted until the guard is released or dropped.
    pub fn into_parts(self) -> (TcpStream, ConnectionGuard) {
        (self.stream, self.guard)
    }
}

impl std::fmt::Debug for TrackedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedStream")
            .field("stream", &self.stream)
            .field("tracked", &self.guard.is_active())
            .finish()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(feature = "http")]
mod http {
    use std::io;
    use std::net::SocketAddr;
    use std::time::Duration;

    use tracing::error;

    use super::{ReloadListener, TrackedStream};
    use crate::error::is_listener_closed;

    /// Lets axum drive the accept loop.
    ///
    /// After the socket is closed `accept` never resolves; pair it with
    /// `with_graceful_shutdown` so the serve loop can end.
    impl axum::serve::Listener for ReloadListener {
        type Io = TrackedStream;
        type Addr = SocketAddr;

        async fn accept(&mut self) -> (Self::Io, Self::Addr) {
            loop {
                match ReloadListener::accept(self).await {
                    Ok(conn) => return conn,
                    Err(e) if is_listener_closed(&e) => return std::future::pending().await,
                    Err(e) => handle_accept_error(e).await,
                }
            }
        }

        fn local_addr(&self) -> io::Result<Self::Addr> {
            ReloadListener::local_addr(self)
        }
    }

    async fn handle_accept_error(e: io::Error) {
        if is_connection_error(&e) {
            return;
        }

        // e.g. EMFILE: back off instead of spinning
        error!(error = %e, "Accept error");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    fn is_connection_error(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
        )
    }
}
