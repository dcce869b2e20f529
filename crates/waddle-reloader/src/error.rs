use std::io;

use thiserror::Error;

/// Errors returned by [`Reloader`](crate::Reloader) operations.
///
/// Failures on the resume path are not represented here: a child that
/// cannot adopt its inherited socket aborts instead of returning.
#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listener is already bound")]
    AlreadyBound,

    #[error("listener is not bound")]
    NotBound,

    #[error("failed to register signal handler: {0}")]
    Signal(#[source] io::Error),

    #[error("failed to determine current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to launch replacement process: {0}")]
    Spawn(#[source] io::Error),

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// A specialized Result type for reloader operations.
pub type Result<T> = std::result::Result<T, ReloadError>;

/// Marker error carried by the `io::Error` that `accept` returns once the
/// listener has been closed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("listener closed")]
pub struct ListenerClosed;

pub(crate) fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, ListenerClosed)
}

/// Returns `true` if `err` was produced by accepting on a closed listener.
pub fn is_listener_closed(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<ListenerClosed>())
}
