//! Connection registry.
//!
//! Tracks which connections are currently open. Identities are opaque
//! handles assigned by the runtime; the registry only answers "is this
//! connection open" and owns the set swept by broadcasts with no explicit
//! target. Topic membership lives in the topic registry - closing a
//! connection must clean up both, which the Manager does within one tick.

use std::{collections::HashSet, fmt};

/// Opaque handle for one client connection.
///
/// Values are assigned by the runtime (random, like session ids), so
/// the core never invents or reuses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a runtime-assigned raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}

/// Set of open connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    open: HashSet<ConnectionId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Idempotent: returns `false` if already open.
    pub fn open(&mut self, connection: ConnectionId) -> bool {
        self.open.insert(connection)
    }

    /// Remove a connection. Returns `false` if it was not open.
    pub fn close(&mut self, connection: ConnectionId) -> bool {
        self.open.remove(&connection)
    }

    /// Whether the connection is currently open.
    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.open.contains(&connection)
    }

    /// All open connections, unordered.
    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.open.iter().copied()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Whether no connections are open.
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Remove and return every open connection. Used by `stop`.
    pub fn drain(&mut self) -> Vec<ConnectionId> {
        self.open.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let conn = ConnectionId::new(1);

        assert!(registry.open(conn));
        assert!(!registry.open(conn));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_removes_connection() {
        let mut registry = ConnectionRegistry::new();
        let conn = ConnectionId::new(1);

        registry.open(conn);
        assert!(registry.close(conn));
        assert!(!registry.is_open(conn));
        assert!(!registry.close(conn));
    }

    #[test]
    fn drain_empties_registry() {
        let mut registry = ConnectionRegistry::new();
        registry.open(ConnectionId::new(1));
        registry.open(ConnectionId::new(2));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
