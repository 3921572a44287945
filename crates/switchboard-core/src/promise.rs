//! Promise resolver: at-most-once settlement.
//!
//! Multiple asynchronous sources (timers, process exits, queue jobs) may
//! race to resolve the same promise; only the first wins. Settling an
//! already-settled promise is deliberately a no-op, not an error.
//!
//! Continuations are data - a boxed constructor producing a command from
//! the settled value - and run through the Command Scheduler rather than
//! inline, preserving single-threaded ordering. Registering against an
//! already-settled promise hands the stored value straight back for
//! immediate scheduling.

use std::{collections::HashMap, fmt};

use bytes::Bytes;

use crate::command::BoxedCommand;

/// Opaque handle for a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u64);

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise-{}", self.0)
    }
}

/// Deferred work resumed with a promise's settled value.
///
/// Implemented for `FnOnce(Option<Bytes>) -> BoxedCommand` closures via
/// the blanket impl.
pub trait Continuation: Send {
    /// Build the command to schedule, given the settlement value.
    fn resume(self: Box<Self>, value: Option<Bytes>) -> BoxedCommand;
}

impl<F> Continuation for F
where
    F: FnOnce(Option<Bytes>) -> BoxedCommand + Send,
{
    fn resume(self: Box<Self>, value: Option<Bytes>) -> BoxedCommand {
        (*self)(value)
    }
}

enum PromiseState {
    Pending(Vec<Box<dyn Continuation>>),
    Settled(Option<Bytes>),
}

/// Table of pending and settled promises.
#[derive(Default)]
pub struct PromiseResolver {
    next_raw: u64,
    promises: HashMap<PromiseId, PromiseState>,
}

impl PromiseResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new unsettled promise.
    pub fn create(&mut self) -> PromiseId {
        self.next_raw += 1;
        let id = PromiseId(self.next_raw);
        self.promises.insert(id, PromiseState::Pending(Vec::new()));
        id
    }

    /// Settle a promise, at most once.
    ///
    /// Returns the continuation commands to schedule. Empty for unknown or
    /// already-settled promises - the losing side of a settlement race
    /// observes a silent no-op.
    pub fn resolve(&mut self, id: PromiseId, value: Option<Bytes>) -> Vec<BoxedCommand> {
        match self.promises.get_mut(&id) {
            Some(state @ PromiseState::Pending(_)) => {
                let prior = std::mem::replace(state, PromiseState::Settled(value.clone()));
                let PromiseState::Pending(continuations) = prior else {
                    return Vec::new();
                };
                continuations.into_iter().map(|c| c.resume(value.clone())).collect()
            },
            _ => Vec::new(),
        }
    }

    /// Register a continuation.
    ///
    /// Returns `Some(command)` if the promise already settled - the caller
    /// schedules it immediately with the stored value. Unknown promises
    /// drop the continuation.
    pub fn on_settled(
        &mut self,
        id: PromiseId,
        continuation: Box<dyn Continuation>,
    ) -> Option<BoxedCommand> {
        match self.promises.get_mut(&id) {
            Some(PromiseState::Pending(continuations)) => {
                continuations.push(continuation);
                None
            },
            Some(PromiseState::Settled(value)) => Some(continuation.resume(value.clone())),
            None => None,
        }
    }

    /// Whether the promise has settled.
    pub fn is_settled(&self, id: PromiseId) -> bool {
        matches!(self.promises.get(&id), Some(PromiseState::Settled(_)))
    }

    /// Settled value, `None` if unsettled or unknown.
    pub fn settled_value(&self, id: PromiseId) -> Option<Option<Bytes>> {
        match self.promises.get(&id) {
            Some(PromiseState::Settled(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of known promises (pending and settled).
    pub fn len(&self) -> usize {
        self.promises.len()
    }

    /// Whether no promises exist.
    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

impl fmt::Debug for PromiseResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseResolver").field("promises", &self.promises.len()).finish()
    }
}
