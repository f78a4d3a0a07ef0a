use crate::DEFAULT_CHANNEL_COUNT;
use crate::reliable::DEFAULT_REORDER_WINDOW;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of channels the pool opens. Fixed for the pool's lifetime.
    pub channel_count: usize,
    /// Whether channels reconnect on their own. Channels built through
    /// `PoolDriver::spawn` read this from their `EventSink`.
    pub auto_reconnect: bool,
    /// Restore send order on receipt. When off, messages are delivered on arrival.
    pub sequential_delivery: bool,
    /// How many packets past a gap may be buffered for reordering.
    pub reorder_window: u32,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
            auto_reconnect: true,
            sequential_delivery: true,
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }

    pub fn with_channel_count(mut self, count: usize) -> Self {
        self.channel_count = count.max(1);
        self
    }

    pub fn with_auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }

    pub fn with_sequential_delivery(mut self, enable: bool) -> Self {
        self.sequential_delivery = enable;
        self
    }

    pub fn with_reorder_window(mut self, window: u32) -> Self {
        self.reorder_window = window.max(1);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
