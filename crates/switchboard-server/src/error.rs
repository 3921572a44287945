//! Server-side error types.
//!
//! [`WireError`] covers the frame codec; [`ServerError`] is the top-level
//! runtime error. Per-connection failures never surface here - they turn
//! into [`switchboard_core::Event::Faulted`] events and the offender is
//! closed while the server keeps serving.

use std::io;

use thiserror::Error;

/// Frame codec failures.
#[derive(Error, Debug)]
pub enum WireError {
    /// Underlying transport error, including EOF inside a frame (the peer
    /// vanished mid-message).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream between frames.
    #[error("peer closed the connection")]
    Closed,

    /// Routing key longer than the frame format allows.
    #[error("frame key of {0} bytes exceeds the limit")]
    KeyTooLarge(usize),

    /// Payload longer than the configured cap.
    #[error("frame payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    /// Routing key bytes are not valid UTF-8.
    #[error("frame key is not valid utf-8")]
    KeyNotUtf8,
}

impl WireError {
    /// Whether this error is a clean end-of-stream (peer hung up between
    /// frames). EOF after any frame byte was consumed is a truncated
    /// frame, not a clean close.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Top-level server runtime errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failed to bind the listen socket.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested bind address
        address: String,
        /// OS error
        source: io::Error,
    },

    /// Listener or socket error outside any single connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Lifecycle misuse of the core (a server bug, not a peer's).
    #[error(transparent)]
    Manager(#[from] switchboard_core::ManagerError),
}
