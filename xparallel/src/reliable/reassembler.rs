//! Inbound reordering.
//!
//! Channels have independent latency, so packets regularly arrive ahead of
//! their predecessors. The reassembler buffers them in a min-heap ordered by
//! modular sequence distance and releases them strictly in send order.
//!
//! A packet further ahead of the gap than the reorder window is dropped
//! instead of buffered, which bounds what a peer can park in memory.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use log::{trace, warn};

use crate::packet::{Envelope, SEQ_HALF_RANGE, Seq};

/// How far ahead of the next expected packet a packet may be buffered.
pub const DEFAULT_REORDER_WINDOW: u32 = 1 << 16;

/// Heap entry ordered so that the earliest sequence number is on top.
#[derive(Debug)]
struct Buffered(Envelope);

impl PartialEq for Buffered {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Buffered {}

impl PartialOrd for Buffered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Buffered {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other.0.seq.cmp_wrapping(self.0.seq)
    }
}

#[derive(Debug)]
pub struct Reassembler {
    buffer: BinaryHeap<Buffered>,

    /// Sequence numbers currently in `buffer`.
    buffered: HashSet<Seq>,

    next_expected: Seq,

    window: u32,

    /// When false, packets are released on arrival.
    sequential: bool,

    delivered: u64,

    duplicates: u64,

    overflowed: u64,
}

impl Reassembler {
    pub fn new(sequential: bool) -> Self {
        Self::starting_at(Seq::ZERO, sequential)
    }

    /// Creates a reassembler expecting `start` first.
    pub fn starting_at(start: Seq, sequential: bool) -> Self {
        Self {
            buffer: BinaryHeap::new(),
            buffered: HashSet::new(),
            next_expected: start,
            window: DEFAULT_REORDER_WINDOW,
            sequential,
            delivered: 0,
            duplicates: 0,
            overflowed: 0,
        }
    }

    /// Sets the reorder window, clamped to `1..=SEQ_HALF_RANGE`.
    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window.clamp(1, SEQ_HALF_RANGE);
        self
    }

    /// Accepts one packet and returns every packet now deliverable, in order.
    ///
    /// Packets already delivered or already buffered are dropped, and so
    /// are packets at or beyond the reorder window.
    pub fn push(&mut self, envelope: Envelope) -> Vec<Envelope> {
        if !self.sequential {
            self.delivered += 1;
            return vec![envelope];
        }

        let seq = envelope.seq;
        if seq.precedes(self.next_expected) || self.buffered.contains(&seq) {
            trace!("Dropping duplicate seq={} (expecting {})", seq, self.next_expected);
            self.duplicates += 1;
            return Vec::new();
        }
        if self.next_expected.distance_to(seq) >= self.window {
            warn!(
                "Dropping seq={}: beyond reorder window of {} after {}",
                seq, self.window, self.next_expected
            );
            self.overflowed += 1;
            return Vec::new();
        }

        self.buffered.insert(seq);
        self.buffer.push(Buffered(envelope));

        let mut ready = Vec::new();
        while self
            .buffer
            .peek()
            .is_some_and(|top| top.0.seq == self.next_expected)
        {
            if let Some(Buffered(envelope)) = self.buffer.pop() {
                self.buffered.remove(&envelope.seq);
                self.next_expected = self.next_expected.next();
                ready.push(envelope);
            }
        }

        if !ready.is_empty() {
            trace!("Releasing {} packets, next expected {}", ready.len(), self.next_expected);
        } else {
            trace!("Buffered seq={} waiting for {}", seq, self.next_expected);
        }
        self.delivered += ready.len() as u64;
        ready
    }

    pub fn next_expected(&self) -> Seq {
        self.next_expected
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Packets dropped for arriving beyond the reorder window.
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Drops buffered packets and expects 0 next.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffered.clear();
        self.next_expected = Seq::ZERO;
    }
}
