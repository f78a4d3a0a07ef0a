//! Pool-level aggregation of channel connectivity.
//!
//! The pool is connected iff at least one channel is connected. Transitions
//! are gated on the connected set changing size between 0 and 1, so
//! interleaved channel callbacks can never produce a duplicate or missed
//! pool event.

use std::collections::BTreeSet;

use super::ChannelId;

/// Pool-level transition produced by a channel event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolTransition {
    /// The connected set went from empty to non-empty.
    Connected,

    /// Every channel used up its attempt and none ever connected.
    ConnectFailed,

    /// The connected set became empty.
    Disconnected(String),
}

#[derive(Debug)]
pub struct LifecycleTracker {
    max_channel_count: usize,

    /// Connection attempts since the last reset.
    attempts: usize,

    connected: BTreeSet<ChannelId>,

    /// Whether any channel connected since the last reset.
    ever_connected: bool,

    connect_error_raised: bool,
}

impl LifecycleTracker {
    pub fn new(max_channel_count: usize) -> Self {
        Self {
            max_channel_count,
            attempts: 0,
            connected: BTreeSet::new(),
            ever_connected: false,
            connect_error_raised: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.connected.is_empty()
    }

    pub fn is_disconnected(&self) -> bool {
        self.connected.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn is_channel_connected(&self, id: ChannelId) -> bool {
        self.connected.contains(&id)
    }

    pub fn connected_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.connected.iter().copied()
    }

    pub fn on_channel_connect(&mut self, id: ChannelId) -> Option<PoolTransition> {
        if !self.connected.insert(id) {
            return None;
        }
        self.attempts += 1;
        self.ever_connected = true;

        if self.connected.len() == 1 {
            Some(PoolTransition::Connected)
        } else {
            None
        }
    }

    pub fn on_channel_connect_error(&mut self, id: ChannelId) -> Option<PoolTransition> {
        if self.connected.contains(&id) {
            return None;
        }
        self.attempts += 1;

        if self.attempts >= self.max_channel_count
            && !self.ever_connected
            && !self.connect_error_raised
        {
            self.connect_error_raised = true;
            Some(PoolTransition::ConnectFailed)
        } else {
            None
        }
    }

    pub fn on_channel_disconnect(&mut self, id: ChannelId, reason: &str) -> Option<PoolTransition> {
        if !self.connected.remove(&id) {
            return None;
        }

        if self.connected.is_empty() {
            Some(PoolTransition::Disconnected(reason.to_string()))
        } else {
            None
        }
    }

    /// Starts a new connect episode.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.ever_connected = false;
        self.connect_error_raised = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ChannelId, ChannelId, ChannelId) {
        (ChannelId::new(0), ChannelId::new(1), ChannelId::new(2))
    }

    #[test]
    fn test_connect_disconnect_episode() {
        let mut tracker = LifecycleTracker::new(3);
        let (a, b, c) = ids();

        assert_eq!(tracker.on_channel_connect(a), Some(PoolTransition::Connected));
        assert_eq!(tracker.on_channel_connect(b), None);
        assert_eq!(tracker.on_channel_connect(c), None);
        assert!(tracker.is_connected());
        assert!(!tracker.is_disconnected());

        assert_eq!(tracker.on_channel_disconnect(a, "lost"), None);
        assert!(tracker.is_connected());

        assert_eq!(tracker.on_channel_disconnect(b, "lost"), None);
        assert_eq!(
            tracker.on_channel_disconnect(c, "gone"),
            Some(PoolTransition::Disconnected("gone".to_string()))
        );
        assert!(tracker.is_disconnected());
        assert!(!tracker.is_connected());
    }

    #[test]
    fn test_duplicate_connect_is_ignored() {
        let mut tracker = LifecycleTracker::new(2);
        let (a, _, _) = ids();

        assert_eq!(tracker.on_channel_connect(a), Some(PoolTransition::Connected));
        assert_eq!(tracker.on_channel_connect(a), None);
        assert_eq!(tracker.attempts(), 1);
        assert_eq!(tracker.connected_count(), 1);
    }

    #[test]
    fn test_disconnect_of_untracked_channel() {
        let mut tracker = LifecycleTracker::new(2);
        let (a, b, _) = ids();

        tracker.on_channel_connect(a);
        assert_eq!(tracker.on_channel_disconnect(b, "noise"), None);
        assert!(tracker.is_connected());
    }

    #[test]
    fn test_connect_error_after_all_attempts_fail() {
        let mut tracker = LifecycleTracker::new(3);
        let (a, b, c) = ids();

        assert_eq!(tracker.on_channel_connect_error(a), None);
        assert_eq!(tracker.on_channel_connect_error(b), None);
        assert_eq!(
            tracker.on_channel_connect_error(c),
            Some(PoolTransition::ConnectFailed)
        );
        // Raised once per episode.
        assert_eq!(tracker.on_channel_connect_error(a), None);
    }

    #[test]
    fn test_no_connect_error_after_a_success() {
        let mut tracker = LifecycleTracker::new(3);
        let (a, b, c) = ids();

        tracker.on_channel_connect(a);
        tracker.on_channel_disconnect(a, "lost");
        assert_eq!(tracker.on_channel_connect_error(b), None);
        assert_eq!(tracker.on_channel_connect_error(c), None);
        assert!(tracker.attempts() >= 3);
    }

    #[test]
    fn test_reset_starts_new_episode() {
        let mut tracker = LifecycleTracker::new(1);
        let (a, _, _) = ids();

        assert_eq!(
            tracker.on_channel_connect_error(a),
            Some(PoolTransition::ConnectFailed)
        );
        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert_eq!(
            tracker.on_channel_connect_error(a),
            Some(PoolTransition::ConnectFailed)
        );
    }
}
