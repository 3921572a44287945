//! Listener registry and dispatch.
//!
//! Binds inbound message patterns to commands. The common case is an
//! exact match on the message's routing key (`listen`); listeners that
//! need wildcard or multi-key matching implement [`Listener`] directly
//! and are installed with `add_listener`.
//!
//! Dispatch is asynchronous with respect to receipt: matching only builds
//! commands, which the Manager schedules via `next`. Reception is never
//! blocked by command execution, and one command's failure never blocks a
//! sibling's scheduling. All matching listeners fire, in registration
//! order.

use std::fmt;

use crate::{command::BoxedCommand, message::Message};

/// Opaque handle for an installed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A binding from message patterns to commands.
///
/// `matches` decides on the routing key alone (identity, not content);
/// `trigger` builds the command to schedule for a matching message.
pub trait Listener: Send {
    /// Whether this listener matches the given routing key.
    fn matches(&self, key: &str) -> bool;

    /// Build the command to schedule for a matching message.
    fn trigger(&mut self, message: &Message) -> BoxedCommand;
}

/// Exact-key listener wrapping a command factory.
struct KeyListener<F> {
    key: String,
    factory: F,
}

impl<F> Listener for KeyListener<F>
where
    F: FnMut(&Message) -> BoxedCommand + Send,
{
    fn matches(&self, key: &str) -> bool {
        self.key == key
    }

    fn trigger(&mut self, message: &Message) -> BoxedCommand {
        (self.factory)(message)
    }
}

/// Ordered set of installed listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    next_raw: u64,
    /// Registration order is dispatch order.
    entries: Vec<(ListenerId, Box<dyn Listener>)>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> ListenerId {
        self.next_raw += 1;
        ListenerId(self.next_raw)
    }

    /// Install an exact-key listener backed by a command factory.
    pub fn listen<F>(&mut self, key: impl Into<String>, factory: F) -> ListenerId
    where
        F: FnMut(&Message) -> BoxedCommand + Send + 'static,
    {
        self.add(Box::new(KeyListener { key: key.into(), factory }))
    }

    /// Install a listener unit directly.
    pub fn add(&mut self, listener: Box<dyn Listener>) -> ListenerId {
        let id = self.alloc();
        self.entries.push((id, listener));
        id
    }

    /// Remove a listener. Returns `false` if it was not installed.
    pub fn silence(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Build commands for every listener matching the message, in
    /// registration order.
    pub fn dispatch(&mut self, message: &Message) -> Vec<BoxedCommand> {
        self.entries
            .iter_mut()
            .filter(|(_, listener)| listener.matches(&message.key))
            .map(|(_, listener)| listener.trigger(message))
            .collect()
    }

    /// Number of installed listeners.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no listeners are installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry").field("listeners", &self.entries.len()).finish()
    }
}
