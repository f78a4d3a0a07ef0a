//! Identity handshake.
//!
//! A connected channel is not admitted to traffic until the peer has
//! acknowledged the pool's identity on it.

use std::collections::HashSet;
use std::fmt;

use uuid::Uuid;

use super::ChannelId;

/// Identity value exchanged during the handshake. Created once per pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn generate() -> Self {
        Identity(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Identity(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Identity(value.to_string())
    }
}

/// Channels with a handshake in flight.
#[derive(Debug, Default)]
pub struct HandshakeTracker {
    awaiting: HashSet<ChannelId>,
}

impl HandshakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a handshake was sent on `id`.
    pub fn begin(&mut self, id: ChannelId) {
        self.awaiting.insert(id);
    }

    /// Completes the handshake on `id`.
    ///
    /// Returns false for an acknowledgment nobody is waiting for.
    pub fn complete(&mut self, id: ChannelId) -> bool {
        self.awaiting.remove(&id)
    }

    pub fn abort(&mut self, id: ChannelId) {
        self.awaiting.remove(&id);
    }

    pub fn is_awaiting(&self, id: ChannelId) -> bool {
        self.awaiting.contains(&id)
    }

    pub fn reset(&mut self) {
        self.awaiting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_unique() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_handshake_completes_once() {
        let mut tracker = HandshakeTracker::new();
        let id = ChannelId::new(4);

        assert!(!tracker.complete(id));
        tracker.begin(id);
        assert!(tracker.is_awaiting(id));
        assert!(tracker.complete(id));
        assert!(!tracker.complete(id));
    }

    #[test]
    fn test_abort() {
        let mut tracker = HandshakeTracker::new();
        let id = ChannelId::new(1);

        tracker.begin(id);
        tracker.abort(id);
        assert!(!tracker.complete(id));
    }
}
