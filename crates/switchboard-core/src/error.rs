//! Error types for the coordination core.
//!
//! Two layers: [`ManagerError`] for failures visible to callers of Manager
//! operations (unknown topic, lifecycle misuse), and [`CommandError`] for
//! failures inside command execution. Per the isolation policy, failures
//! local to one connection, command, process, or job are reported through
//! log actions or queue negative-acknowledgement and never abort their
//! siblings; only boot/start failures are fatal to the Manager itself.

use thiserror::Error;

use crate::{connection::ConnectionId, manager::Lifecycle, process::ProcessId};

/// Errors that can occur during Manager operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Subscribe/unsubscribe/publish on a topic that was never registered.
    ///
    /// Reported to the caller. Not fatal - register the topic first.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Send/end/broadcast target is no longer open.
    ///
    /// Never raised past the caller - the Manager reports it through the
    /// log channel and continues. Carried here so reports share one
    /// vocabulary.
    #[error("connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// Operation on a process the supervisor does not know.
    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),

    /// The runtime failed to spawn a process.
    ///
    /// Reported; the process is not added to the live set.
    #[error("process spawn failure for {process}: {reason}")]
    ProcessSpawnFailure {
        /// Process that failed to spawn
        process: ProcessId,
        /// Error reported by the launcher
        reason: String,
    },

    /// Operation attempted in the wrong lifecycle state.
    ///
    /// Lifecycle is uninitialized -> booted -> started -> stopped; this is
    /// a caller bug and the only error class that is fatal to the Manager.
    #[error("invalid lifecycle transition: cannot {operation} while {state:?}")]
    Lifecycle {
        /// State the Manager was in
        state: Lifecycle,
        /// Operation that was attempted
        operation: &'static str,
    },
}

/// Errors raised while a command executes.
///
/// Caught per-command by the scheduler: a failing command is reported and
/// its siblings still run. A failing job-tagged command turns into a
/// negative queue acknowledgement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command failed with a domain-specific reason.
    #[error("command failed: {0}")]
    Failed(String),

    /// The command hit a Manager-level error (unknown topic, etc.).
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl CommandError {
    /// Shorthand for a string failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
