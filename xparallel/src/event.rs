//! Pool event surface.
//!
//! Lifecycle names are reserved: they are published directly on the pool and
//! never packetized. Every other name is an application event that goes
//! through the ordered path.

use std::collections::HashMap;

use crate::packet::Value;

/// Event name used by `send`.
pub const MESSAGE_EVENT: &str = "message";

/// Reserved lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Connect,
    ConnectError,
    ConnectTimeout,
    Disconnect,
    Error,
    Reconnect,
    ReconnectAttempt,
    ReconnectFailed,
    ReconnectError,
    Reconnecting,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 10] = [
        LifecycleEvent::Connect,
        LifecycleEvent::ConnectError,
        LifecycleEvent::ConnectTimeout,
        LifecycleEvent::Disconnect,
        LifecycleEvent::Error,
        LifecycleEvent::Reconnect,
        LifecycleEvent::ReconnectAttempt,
        LifecycleEvent::ReconnectFailed,
        LifecycleEvent::ReconnectError,
        LifecycleEvent::Reconnecting,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Connect => "connect",
            LifecycleEvent::ConnectError => "connect_error",
            LifecycleEvent::ConnectTimeout => "connect_timeout",
            LifecycleEvent::Disconnect => "disconnect",
            LifecycleEvent::Error => "error",
            LifecycleEvent::Reconnect => "reconnect",
            LifecycleEvent::ReconnectAttempt => "reconnect_attempt",
            LifecycleEvent::ReconnectFailed => "reconnect_failed",
            LifecycleEvent::ReconnectError => "reconnect_error",
            LifecycleEvent::Reconnecting => "reconnecting",
        }
    }

    /// Looks up a reserved name. This is the single reserved-name check.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == name)
    }
}

pub fn is_reserved(name: &str) -> bool {
    LifecycleEvent::from_name(name).is_some()
}

/// Subscriber callback. Receives the event's values.
pub type Handler = Box<dyn FnMut(&[Value]) + Send + 'static>;

/// Publish/subscribe component owned by the pool.
#[derive(Default)]
pub struct Emitter {
    handlers: HashMap<String, Vec<Handler>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, event: impl Into<String>, handler: Handler) {
        self.handlers.entry(event.into()).or_default().push(handler);
    }

    /// Calls every handler registered for `event`.
    ///
    /// Returns the number of handlers invoked.
    pub fn publish(&mut self, event: &str, args: &[Value]) -> usize {
        match self.handlers.get_mut(event) {
            Some(handlers) => {
                for handler in handlers.iter_mut() {
                    handler(args);
                }
                handlers.len()
            }
            None => 0,
        }
    }

    pub fn has_subscribers(&self, event: &str) -> bool {
        self.handlers.get(event).is_some_and(|h| !h.is_empty())
    }

    pub fn unsubscribe_all(&mut self, event: &str) {
        self.handlers.remove(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_reserved_names() {
        for event in LifecycleEvent::ALL {
            assert!(is_reserved(event.as_str()));
            assert_eq!(LifecycleEvent::from_name(event.as_str()), Some(event));
        }
        assert!(!is_reserved(MESSAGE_EVENT));
        assert!(!is_reserved("chat"));
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut emitter = Emitter::new();

        for tag in [1u8, 2u8] {
            let seen = seen.clone();
            emitter.subscribe(
                "chat",
                Box::new(move |args: &[Value]| seen.lock().unwrap().push((tag, args.to_vec()))),
            );
        }

        assert_eq!(emitter.publish("chat", &[b"hi".to_vec()]), 2);
        assert_eq!(emitter.publish("other", &[]), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (1, vec![b"hi".to_vec()]));
        assert_eq!(seen[1], (2, vec![b"hi".to_vec()]));
    }

    #[test]
    fn test_unsubscribe_all() {
        let mut emitter = Emitter::new();
        emitter.subscribe("chat", Box::new(|_: &[Value]| {}));
        assert!(emitter.has_subscribers("chat"));

        emitter.unsubscribe_all("chat");
        assert!(!emitter.has_subscribers("chat"));
    }
}
