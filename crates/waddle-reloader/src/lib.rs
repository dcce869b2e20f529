//! # waddle-reloader
//!
//! Zero-downtime restarts for a server with a single listening socket.
//!
//! ## Overview
//!
//! 1. [`Reloader::bind`] binds the configured address, or adopts the socket
//!    inherited from a reloading parent.
//! 2. The caller serves from [`Reloader::listener`] (or [`Reloader::serve`]
//!    for axum); every accepted connection is counted until closed.
//! 3. On `SIGHUP` the process launches a copy of itself that inherits the
//!    listening socket.
//! 4. The new process takes over the socket and sends `SIGTERM` to the old
//!    one, which stops accepting and drains its connections.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP` — reload: spawn a replacement, keep serving until it takes over
//! - `SIGTERM` — terminate: stop accepting, let in-flight connections finish
//!
//! ## Environment Variables
//!
//! - `RELOADING` — set by the parent; the listener is on fd 3
//! - `RELOADER_LISTEN` — listen address for [`ReloaderConfig::from_env`]
//! - `RELOADER_DRAIN_TIMEOUT_SECS` — optional bound for [`Reloader::drain`]
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.
//!
//! Tokio signal handlers are process-wide: every bound [`Reloader`] in a
//! process reacts to the same `SIGHUP`/`SIGTERM`. Use
//! [`Reloader::trigger`] to drive one instance on its own.

#[cfg(not(unix))]
compile_error!("waddle-reloader requires a Unix platform (Linux or macOS)");

mod config;
mod error;
mod handoff;
mod listener;
mod reloader;
mod tracker;
mod watcher;

pub use config::{ReloaderConfig, DEFAULT_LISTEN};
pub use error::{is_listener_closed, ListenerClosed, ReloadError, Result};
pub use handoff::{ENV_MARKER, INHERITED_FD};
pub use listener::{ReloadListener, TrackedStream};
pub use reloader::{GracefulServer, Reloader};
pub use tracker::{ConnectionGuard, ConnectionTracker};
pub use watcher::{LifecycleSignal, WatcherState};
