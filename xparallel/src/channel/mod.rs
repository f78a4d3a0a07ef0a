//! Channels and their per-channel bring-up.
//!
//! A [`Channel`] wraps one physical duplex connection. The pool only drives
//! it through `connect`, `disconnect` and `send`; everything the channel
//! observes comes back to the pool as a [`ChannelEvent`].

mod handshake;
mod lifecycle;

use std::fmt;

use crate::error::Result;
use crate::packet::{Envelope, Seq, Value};

pub use handshake::{HandshakeTracker, Identity};
pub use lifecycle::{LifecycleTracker, PoolTransition};

/// Index of a channel inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(usize);

impl ChannelId {
    pub const fn new(index: usize) -> Self {
        ChannelId(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Channel state as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created or reconnecting, not yet connected.
    Pending,

    /// Connected, identity handshake in progress.
    Connected,

    /// Handshake complete; eligible for traffic.
    Ready,

    /// Failed to connect or failed a send.
    Errored,

    /// Connection lost or closed.
    Disconnected,
}

/// Messages the pool hands to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Identity handshake; the peer answers with [`ChannelEvent::HandshakeAck`].
    ///
    /// `epoch` changes every time the pool is closed, so the peer can tell a
    /// reopened pool (numbering restarts at 0) from channels coming back
    /// after an outage (numbering continues).
    Handshake { identity: Identity, epoch: u32 },

    /// Sequenced application packet; the peer answers with [`ChannelEvent::Ack`].
    Packet(Envelope),
}

/// Events a channel reports to its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connect,
    ConnectError(String),
    ConnectTimeout,
    Disconnect(String),
    Reconnect(u32),
    ReconnectAttempt(u32),
    Reconnecting(u32),
    ReconnectError(String),
    ReconnectFailed,

    /// The peer acknowledged our identity handshake.
    HandshakeAck,

    /// The peer acknowledged packet `seq`.
    Ack { seq: Seq, values: Vec<Value> },

    /// Packet `seq` failed in transit.
    TransportError { seq: Seq, reason: String },

    /// Packet `seq` can never be carried by this channel. The connection
    /// stays up.
    Rejected { seq: Seq, reason: String },

    /// A packet arrived from the peer.
    Received(Envelope),
}

/// One physical duplex connection, supplied by the transport.
///
/// Implementations must not block. Acknowledgments and failures are
/// reported later as [`ChannelEvent`]s.
pub trait Channel {
    fn connect(&mut self);

    fn disconnect(&mut self);

    /// Queues a message on the connection.
    ///
    /// An error means the message never left; the pool treats the channel
    /// as failing.
    fn send(&mut self, message: Outbound) -> Result<()>;

    /// Checks that a packet with this event name and these values can be
    /// carried at all. Called before the packet gets a sequence number.
    fn check_packet(&self, _event: &str, _values: &[Value]) -> Result<()> {
        Ok(())
    }
}
