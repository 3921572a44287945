//! Switchboard coordination core.
//!
//! A single-threaded pub/sub orchestration engine: connection and topic
//! registries, a timer wheel, a command scheduler, listener dispatch, an
//! external-process supervisor, a promise resolver, and a queue bridge,
//! composed behind the [`Manager`].
//!
//! # Architecture
//!
//! The crate is sans-IO. The Manager consumes [`Event`]s (with the current
//! time passed in) and returns [`Action`]s for a runtime to execute - it
//! never touches sockets, clocks, or child processes itself. All state
//! lives on the thread driving [`Manager::handle`]; transport readers,
//! process waiters, and queue pumps interact with it exclusively by
//! posting events.
//!
//! # Components
//!
//! - [`Manager`]: the event-driven composition root
//! - [`CommandCtx`]: capability surface handed to executing commands
//! - [`Command`] / [`Listener`] / [`Continuation`] / [`Worker`]: the
//!   traits application logic plugs into

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod command;
mod connection;
mod error;
mod listener;
mod manager;
mod message;
mod process;
mod promise;
mod queue;
mod timer;
mod topic;

pub use command::{from_fn, BoxedCommand, Command, CommandCtx, CommandId, CommandScheduler};
pub use connection::{ConnectionId, ConnectionRegistry};
pub use error::{CommandError, ManagerError};
pub use listener::{Listener, ListenerId, ListenerRegistry};
pub use manager::{
    Action, Event, Lifecycle, LogLevel, Manager, ManagerConfig, ProcessHandle,
};
pub use message::Message;
pub use process::{ProcessId, ProcessSpec, ProcessState, ProcessTable};
pub use promise::{Continuation, PromiseId, PromiseResolver};
pub use queue::{Job, JobId, JobOutcome, QueueBridge, Task, Worker};
pub use timer::{TimerId, TimerWheel};
pub use topic::TopicRegistry;
