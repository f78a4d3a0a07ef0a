//! Ordering and delivery mechanisms.
//!
//! This module provides:
//! - Dispatcher: Credit-based outbound dispatch with an error-retry queue
//! - Reassembler: Restores send order of packets received across channels

mod dispatcher;
mod reassembler;

pub use dispatcher::{Acked, DispatchStats, Dispatcher, PendingAck};
pub use reassembler::{DEFAULT_REORDER_WINDOW, Reassembler};
