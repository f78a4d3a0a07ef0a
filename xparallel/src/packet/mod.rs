//! Application packets.
//!
//! An [`Envelope`] is what travels between two pools: the sender-assigned
//! sequence number, the application event name and its values. A [`Packet`]
//! is the sender's view of the same message, which additionally owns the
//! caller's acknowledgment callback until the peer acknowledges it.

mod sequence;

use std::fmt;

pub use sequence::{SEQ_HALF_RANGE, Seq, SeqAllocator};

/// One opaque application value.
pub type Value = Vec<u8>;

/// Invoked with the peer's acknowledgment payload.
pub type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send + 'static>;

/// Sequenced application message as carried by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub seq: Seq,
    pub event: String,
    pub values: Vec<Value>,
}

impl Envelope {
    pub fn new(seq: Seq, event: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            seq,
            event: event.into(),
            values,
        }
    }
}

/// Outgoing packet owned by the dispatcher.
pub struct Packet {
    envelope: Envelope,
    ack: Option<AckCallback>,
}

impl Packet {
    pub fn new(envelope: Envelope, ack: Option<AckCallback>) -> Self {
        Self { envelope, ack }
    }

    pub fn seq(&self) -> Seq {
        self.envelope.seq
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn has_ack(&self) -> bool {
        self.ack.is_some()
    }

    pub fn into_parts(self) -> (Envelope, Option<AckCallback>) {
        (self.envelope, self.ack)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("envelope", &self.envelope)
            .field("ack", &self.ack.is_some())
            .finish()
    }
}
