//! Messages exchanged with connections.
//!
//! A message is an immutable payload plus a short routing key. The key is the
//! discriminator listeners match on; the payload is opaque to the core. For
//! inbound messages the originating connection travels with the message so
//! listener-triggered commands can reply or subscribe the sender.

use bytes::Bytes;

use crate::connection::ConnectionId;

/// Immutable message: routing key, payload, and (for inbound) the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Routing key used for listener matching.
    pub key: String,
    /// Opaque payload bytes. The core never parses these.
    pub payload: Bytes,
    /// Connection the message arrived from. `None` for locally built
    /// messages (broadcasts, replies).
    pub origin: Option<ConnectionId>,
}

impl Message {
    /// Build an outbound message with no origin.
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { key: key.into(), payload: payload.into(), origin: None }
    }

    /// Build an inbound message carrying its originating connection.
    pub fn inbound(
        key: impl Into<String>,
        payload: impl Into<Bytes>,
        origin: ConnectionId,
    ) -> Self {
        Self { key: key.into(), payload: payload.into(), origin: Some(origin) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_has_no_origin() {
        let msg = Message::new("chat", "hi");
        assert_eq!(msg.key, "chat");
        assert_eq!(msg.payload, Bytes::from("hi"));
        assert!(msg.origin.is_none());
    }

    #[test]
    fn inbound_message_keeps_origin() {
        let conn = ConnectionId::new(7);
        let msg = Message::inbound("chat", "hi", conn);
        assert_eq!(msg.origin, Some(conn));
    }
}
