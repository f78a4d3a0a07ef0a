//! Credit-based outbound dispatch.
//!
//! Every ready channel holds one credit. Sending a packet spends the
//! credit; the acknowledgment or failure of that packet returns it. This
//! keeps at most one unacknowledged packet on any channel.
//!
//! Failed packets go to the front of the error-retry queue, which is drained
//! before the normal queue. A retried packet keeps its original sequence
//! number.

use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::channel::ChannelId;
use crate::error::{Error, ErrorKind, Result};
use crate::packet::{AckCallback, Envelope, Packet, SEQ_HALF_RANGE, Seq, SeqAllocator, Value};

/// Statistics about dispatch behavior.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Packets accepted from the application.
    pub enqueued: u64,

    /// Transmissions handed to channels, retries included.
    pub sent: u64,

    /// Packets acknowledged by the peer.
    pub acked: u64,

    /// Packets moved to the error-retry queue.
    pub retried: u64,

    /// Packets dropped without delivery guarantee.
    pub abandoned: u64,
}

/// In-flight packet correlated to the channel carrying it.
#[derive(Debug)]
pub struct PendingAck {
    pub channel: ChannelId,
    pub packet: Packet,
}

/// Result of an acknowledgment.
pub struct Acked {
    pub channel: ChannelId,
    pub callback: Option<AckCallback>,
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    seq: SeqAllocator,

    /// Fresh packets in emission order.
    queue: VecDeque<Packet>,

    /// Failed packets; drained before `queue`.
    retry: VecDeque<Packet>,

    /// Channels with a free credit.
    ready: VecDeque<ChannelId>,

    /// In-flight packets keyed by sequence number.
    pending: HashMap<Seq, PendingAck>,

    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher whose first packet gets `start`.
    pub fn starting_at(start: Seq) -> Self {
        Self {
            seq: SeqAllocator::starting_at(start),
            ..Self::default()
        }
    }

    /// Assigns the next sequence number and queues a packet.
    pub fn enqueue(
        &mut self,
        event: &str,
        values: Vec<Value>,
        ack: Option<AckCallback>,
    ) -> Result<Seq> {
        let outstanding = self.outstanding() as u64;
        if outstanding >= SEQ_HALF_RANGE as u64 || self.pending.contains_key(&self.seq.peek()) {
            return Err(Error::with_detail(
                ErrorKind::SequenceExhausted,
                format!("{} packets outstanding", outstanding),
            ));
        }

        let seq = self.seq.allocate();
        self.queue
            .push_back(Packet::new(Envelope::new(seq, event, values), ack));
        self.stats.enqueued += 1;
        Ok(seq)
    }

    /// Returns the credit of `channel`.
    ///
    /// A channel with a packet in flight or already holding a credit is
    /// left alone.
    pub fn release(&mut self, channel: ChannelId) {
        if self.in_flight(channel) || self.ready.contains(&channel) {
            return;
        }
        self.ready.push_back(channel);
    }

    /// Pairs one ready channel with the next packet.
    ///
    /// Retries win over fresh packets. The packet is recorded as in flight
    /// on the channel and a copy of its envelope is returned for sending.
    pub fn next_assignment(&mut self) -> Option<(ChannelId, Envelope)> {
        if self.ready.is_empty() || (self.retry.is_empty() && self.queue.is_empty()) {
            return None;
        }

        let channel = self.ready.pop_front()?;
        let packet = match self.retry.pop_front() {
            Some(packet) => packet,
            None => self.queue.pop_front()?,
        };

        let envelope = packet.envelope().clone();
        trace!("Assigning seq={} to channel {}", envelope.seq, channel);
        self.pending.insert(envelope.seq, PendingAck { channel, packet });
        self.stats.sent += 1;

        Some((channel, envelope))
    }

    /// Completes packet `seq` acknowledged on `channel` and returns the
    /// channel's credit.
    ///
    /// Acknowledgments for unknown packets, or from a channel other than the
    /// one carrying the packet, are ignored.
    pub fn acknowledge(&mut self, channel: ChannelId, seq: Seq) -> Option<Acked> {
        if self.pending.get(&seq)?.channel != channel {
            return None;
        }
        let entry = self.pending.remove(&seq)?;
        self.stats.acked += 1;
        self.release(channel);

        let (_, callback) = entry.packet.into_parts();
        Some(Acked { channel, callback })
    }

    /// Moves packet `seq` from `channel` to the front of the error-retry
    /// queue.
    ///
    /// Does not return the channel's credit. Returns the failed packet's
    /// values.
    pub fn fail(&mut self, channel: ChannelId, seq: Seq) -> Option<Vec<Value>> {
        if self.pending.get(&seq)?.channel != channel {
            return None;
        }
        let entry = self.pending.remove(&seq)?;
        let values = entry.packet.envelope().values.clone();
        self.requeue(entry.packet);
        Some(values)
    }

    /// Drops packet `seq`, which `channel` can never carry, and returns the
    /// channel's credit.
    ///
    /// Returns the dropped packet's values.
    pub fn reject(&mut self, channel: ChannelId, seq: Seq) -> Option<Vec<Value>> {
        if self.pending.get(&seq)?.channel != channel {
            return None;
        }
        let entry = self.pending.remove(&seq)?;
        let (envelope, _) = entry.packet.into_parts();
        self.stats.abandoned += 1;
        self.release(channel);
        Some(envelope.values)
    }

    /// Puts a packet at the front of the error-retry queue.
    pub fn requeue(&mut self, packet: Packet) {
        trace!("Requeueing seq={} for retry", packet.seq());
        self.retry.push_front(packet);
        self.stats.retried += 1;
    }

    /// Removes `channel` from dispatch.
    ///
    /// Drops its credit and returns the packet it was carrying, if any.
    pub fn withdraw(&mut self, channel: ChannelId) -> Option<Packet> {
        self.ready.retain(|&id| id != channel);

        let seq = self
            .pending
            .iter()
            .find(|(_, entry)| entry.channel == channel)
            .map(|(&seq, _)| seq)?;
        self.pending.remove(&seq).map(|entry| entry.packet)
    }

    /// Records a packet dropped without retry.
    pub fn abandon(&mut self, packet: Packet) {
        trace!("Abandoning seq={}", packet.seq());
        self.stats.abandoned += 1;
    }

    /// Drops every queued and in-flight packet and every credit.
    ///
    /// Returns the number of packets dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.outstanding();
        self.queue.clear();
        self.retry.clear();
        self.pending.clear();
        self.ready.clear();
        self.stats.abandoned += dropped as u64;
        dropped
    }

    /// Clears everything and restarts numbering at 0.
    pub fn reset(&mut self) -> usize {
        let dropped = self.clear();
        self.seq.reset();
        dropped
    }

    pub fn in_flight(&self, channel: ChannelId) -> bool {
        self.pending.values().any(|entry| entry.channel == channel)
    }

    pub fn in_flight_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_ready(&self, channel: ChannelId) -> bool {
        self.ready.contains(&channel)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn retry_len(&self) -> usize {
        self.retry.len()
    }

    /// Packets queued, awaiting retry or in flight.
    pub fn outstanding(&self) -> usize {
        self.queue.len() + self.retry.len() + self.pending.len()
    }

    /// The sequence number the next packet will get.
    pub fn next_seq(&self) -> Seq {
        self.seq.peek()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}
