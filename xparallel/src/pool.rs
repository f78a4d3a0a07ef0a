//! Pool state machine and main API.
//!
//! This module provides the [`Pool`] struct that presents one ordered
//! message stream over a fixed set of channels. It owns every piece of
//! mutable state: channel states, the lifecycle tracker, handshake
//! tracking, the dispatcher, the reassembler and the event surface. All
//! mutation goes through `&mut self`, so events are applied one at a time.

use log::{debug, error, info, trace, warn};

use crate::channel::{
    Channel, ChannelEvent, ChannelId, ChannelState, HandshakeTracker, Identity, LifecycleTracker,
    Outbound, PoolTransition,
};
use crate::config::PoolConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Emitter, Handler, LifecycleEvent, MESSAGE_EVENT};
use crate::packet::{AckCallback, Envelope, Seq, Value};
use crate::reliable::{DispatchStats, Dispatcher, Reassembler};

/// Reason reported when the application closes the pool.
pub const CLIENT_DISCONNECT_REASON: &str = "io client disconnect";

/// Statistics about pool operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Packets accepted from the application.
    pub packets_enqueued: u64,

    /// Transmissions handed to channels, retries included.
    pub packets_sent: u64,

    /// Packets acknowledged by the peer.
    pub packets_acked: u64,

    /// Packets moved to the error-retry queue.
    pub packets_retried: u64,

    /// Packets dropped by teardown or total pool loss.
    pub packets_abandoned: u64,

    /// Packets delivered to the application.
    pub packets_delivered: u64,

    /// Received packets dropped as duplicates.
    pub duplicates: u64,

    /// Received packets dropped for arriving too far ahead of a gap.
    pub overflowed: u64,

    /// Channels currently connected.
    pub connected_channels: usize,
}

impl PoolStats {
    fn collect(dispatch: &DispatchStats, reassembler: &Reassembler, connected: usize) -> Self {
        Self {
            packets_enqueued: dispatch.enqueued,
            packets_sent: dispatch.sent,
            packets_acked: dispatch.acked,
            packets_retried: dispatch.retried,
            packets_abandoned: dispatch.abandoned,
            packets_delivered: reassembler.delivered(),
            duplicates: reassembler.duplicates(),
            overflowed: reassembler.overflowed(),
            connected_channels: connected,
        }
    }
}

struct Slot<C> {
    channel: C,
    state: ChannelState,
}

/// Ordered message stream over a pool of channels.
///
/// # Example
///
/// ```rust,ignore
/// use xparallel::{Pool, PoolConfig};
///
/// let mut pool = Pool::new(PoolConfig::default(), |id| make_channel(id));
/// pool.subscribe("message", |values| println!("{:?}", values));
/// pool.open();
///
/// // Channel events are fed back as the transport reports them.
/// pool.handle_channel_event(id, event);
///
/// pool.send(vec![b"hello".to_vec()], None)?;
/// ```
pub struct Pool<C: Channel> {
    config: PoolConfig,

    identity: Identity,

    /// Bumped by `close`; sent in every handshake.
    epoch: u32,

    slots: Vec<Slot<C>>,

    lifecycle: LifecycleTracker,

    handshake: HandshakeTracker,

    dispatcher: Dispatcher,

    reassembler: Reassembler,

    emitter: Emitter,

    /// Set by `close`; late disconnects then skip the retry path.
    closing: bool,
}

impl<C: Channel> Pool<C> {
    /// Creates a pool of `config.channel_count` channels built by `factory`.
    ///
    /// Channels are not connected until [`Pool::open`].
    pub fn new<F>(config: PoolConfig, mut factory: F) -> Self
    where
        F: FnMut(ChannelId) -> C,
    {
        let slots = (0..config.channel_count)
            .map(|index| Slot {
                channel: factory(ChannelId::new(index)),
                state: ChannelState::Pending,
            })
            .collect();

        Self {
            identity: Identity::generate(),
            epoch: 0,
            slots,
            lifecycle: LifecycleTracker::new(config.channel_count),
            handshake: HandshakeTracker::new(),
            dispatcher: Dispatcher::new(),
            reassembler: Reassembler::new(config.sequential_delivery)
                .with_window(config.reorder_window),
            emitter: Emitter::new(),
            closing: false,
            config,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Numbering epoch. Changes on every `close`, never on channel loss.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.lifecycle.is_disconnected()
    }

    pub fn channel_count(&self) -> usize {
        self.slots.len()
    }

    pub fn channel_state(&self, id: ChannelId) -> Option<ChannelState> {
        self.slots.get(id.index()).map(|slot| slot.state)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&C> {
        self.slots.get(id.index()).map(|slot| &slot.channel)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut C> {
        self.slots.get_mut(id.index()).map(|slot| &mut slot.channel)
    }

    /// Returns true if `id` carries an unacknowledged packet.
    pub fn is_in_flight(&self, id: ChannelId) -> bool {
        self.dispatcher.in_flight(id)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats::collect(
            self.dispatcher.stats(),
            &self.reassembler,
            self.lifecycle.connected_count(),
        )
    }

    /// Registers a handler for a lifecycle or application event.
    pub fn subscribe<F>(&mut self, event: impl Into<String>, handler: F)
    where
        F: FnMut(&[Value]) + Send + 'static,
    {
        self.emitter.subscribe(event, Box::new(handler));
    }

    pub fn subscribe_boxed(&mut self, event: impl Into<String>, handler: Handler) {
        self.emitter.subscribe(event, handler);
    }

    /// "Opens" the pool by connecting every channel.
    ///
    /// Does nothing while the pool is connected.
    pub fn open(&mut self) -> &mut Self {
        if self.is_connected() {
            return self;
        }

        info!("Opening pool {} with {} channels", self.identity, self.slots.len());
        self.closing = false;
        self.lifecycle.reset();
        self.handshake.reset();
        for slot in &mut self.slots {
            slot.state = ChannelState::Pending;
            slot.channel.connect();
        }
        self
    }

    pub fn connect(&mut self) -> &mut Self {
        self.open()
    }

    /// Tears the pool down.
    ///
    /// Every channel is disconnected and every queued or in-flight packet is
    /// dropped without retry. Numbering restarts at 0 in a new epoch.
    pub fn close(&mut self) -> &mut Self {
        info!("Closing pool {} (epoch {})", self.identity, self.epoch);
        self.closing = true;
        self.epoch = self.epoch.wrapping_add(1);

        let dropped = self.dispatcher.reset();
        if dropped > 0 {
            warn!("Dropped {} undelivered packets on close", dropped);
        }
        self.reassembler.reset();
        self.handshake.reset();

        for index in 0..self.slots.len() {
            let id = ChannelId::new(index);
            let slot = &mut self.slots[index];
            slot.channel.disconnect();
            slot.state = ChannelState::Disconnected;

            if let Some(transition) = self.lifecycle.on_channel_disconnect(id, CLIENT_DISCONNECT_REASON) {
                self.apply(transition);
            }
        }
        self
    }

    pub fn disconnect(&mut self) -> &mut Self {
        self.close()
    }

    /// Emits an event.
    ///
    /// Reserved lifecycle names are published immediately on the pool's own
    /// event surface. Anything else is sent as an ordered packet.
    pub fn emit(&mut self, event: &str, values: Vec<Value>, ack: Option<AckCallback>) -> Result<()> {
        match LifecycleEvent::from_name(event) {
            Some(lifecycle) => {
                self.publish_lifecycle_event(lifecycle, &values);
                Ok(())
            }
            None => self.send_application_message(event, values, ack).map(|_| ()),
        }
    }

    /// Sends a `message` event.
    pub fn send(&mut self, values: Vec<Value>, ack: Option<AckCallback>) -> Result<Seq> {
        self.send_application_message(MESSAGE_EVENT, values, ack)
    }

    /// Publishes a lifecycle event immediately. Never ordered or packetized.
    pub fn publish_lifecycle_event(&mut self, event: LifecycleEvent, args: &[Value]) {
        self.emitter.publish(event.as_str(), args);
    }

    /// Queues an ordered application message and returns its sequence number.
    pub fn send_application_message(
        &mut self,
        event: &str,
        values: Vec<Value>,
        ack: Option<AckCallback>,
    ) -> Result<Seq> {
        if LifecycleEvent::from_name(event).is_some() {
            return Err(Error::with_detail(ErrorKind::ReservedEvent, event));
        }
        for slot in &self.slots {
            slot.channel.check_packet(event, &values)?;
        }

        let seq = self.dispatcher.enqueue(event, values, ack)?;
        trace!("Enqueued seq={} event={}", seq, event);
        self.dispatch();
        Ok(seq)
    }

    /// Applies one event reported by channel `id`.
    pub fn handle_channel_event(&mut self, id: ChannelId, event: ChannelEvent) {
        if id.index() >= self.slots.len() {
            warn!("Event {:?} from unknown channel {}", event, id);
            return;
        }

        match event {
            ChannelEvent::Connect => self.on_connect(id),
            ChannelEvent::Reconnect(attempt) => {
                debug!("Channel {} reconnected after {} attempts", id, attempt);
                self.on_connect(id);
            }
            ChannelEvent::ConnectError(reason) => {
                if self.config.auto_reconnect {
                    debug!("Channel {} connect error: {}", id, reason);
                } else {
                    self.on_connect_error(id, &reason);
                }
            }
            ChannelEvent::ConnectTimeout => {
                if self.config.auto_reconnect {
                    debug!("Channel {} connect timeout", id);
                } else {
                    self.on_connect_error(id, "connect_timeout");
                }
            }
            ChannelEvent::ReconnectFailed => self.on_connect_error(id, "reconnect_failed"),
            ChannelEvent::ReconnectAttempt(attempt) | ChannelEvent::Reconnecting(attempt) => {
                trace!("Channel {} reconnect attempt {}", id, attempt);
            }
            ChannelEvent::ReconnectError(reason) => {
                debug!("Channel {} reconnect error: {}", id, reason);
            }
            ChannelEvent::Disconnect(reason) => self.on_disconnect(id, &reason),
            ChannelEvent::HandshakeAck => self.on_handshake_ack(id),
            ChannelEvent::Ack { seq, values } => self.on_ack(id, seq, values),
            ChannelEvent::TransportError { seq, reason } => self.on_transport_error(id, seq, &reason),
            ChannelEvent::Rejected { seq, reason } => self.on_rejected(id, seq, &reason),
            ChannelEvent::Received(envelope) => self.on_receive(id, envelope),
        }
    }

    fn on_connect(&mut self, id: ChannelId) {
        if self.closing {
            debug!("Ignoring connect of channel {} during teardown", id);
            return;
        }

        let transition = self.lifecycle.on_channel_connect(id);

        let slot = &mut self.slots[id.index()];
        if matches!(slot.state, ChannelState::Connected | ChannelState::Ready) {
            trace!("Channel {} already connected", id);
        } else {
            debug!("Channel {} connected, sending identity", id);
            slot.state = ChannelState::Connected;
            self.handshake.begin(id);
            let handshake = Outbound::Handshake {
                identity: self.identity.clone(),
                epoch: self.epoch,
            };
            if let Err(e) = slot.channel.send(handshake) {
                warn!("Handshake on channel {} failed: {}", id, e);
                self.handshake.abort(id);
                slot.state = ChannelState::Errored;
            }
        }

        if let Some(transition) = transition {
            self.apply(transition);
        }
    }

    fn on_connect_error(&mut self, id: ChannelId, reason: &str) {
        debug!("Channel {} failed to connect: {}", id, reason);
        if !self.lifecycle.is_channel_connected(id) {
            self.slots[id.index()].state = ChannelState::Errored;
        }
        if let Some(transition) = self.lifecycle.on_channel_connect_error(id) {
            self.apply(transition);
        }
    }

    fn on_disconnect(&mut self, id: ChannelId, reason: &str) {
        debug!("Channel {} disconnected: {}", id, reason);
        self.slots[id.index()].state = ChannelState::Disconnected;
        self.handshake.abort(id);

        let orphan = self.dispatcher.withdraw(id);
        let transition = self.lifecycle.on_channel_disconnect(id, reason);
        let pool_lost = matches!(transition, Some(PoolTransition::Disconnected(_)));

        if let Some(packet) = orphan {
            if self.closing || pool_lost {
                self.dispatcher.abandon(packet);
            } else {
                self.dispatcher.requeue(packet);
            }
        }

        if let Some(transition) = transition {
            self.apply(transition);
        }
        self.dispatch();
    }

    fn on_handshake_ack(&mut self, id: ChannelId) {
        if !self.handshake.complete(id) {
            debug!("Unexpected handshake ack on channel {}", id);
            return;
        }

        let slot = &mut self.slots[id.index()];
        if slot.state != ChannelState::Connected {
            return;
        }
        debug!("Channel {} admitted", id);
        slot.state = ChannelState::Ready;
        self.dispatcher.release(id);
        self.dispatch();
    }

    fn on_ack(&mut self, id: ChannelId, seq: Seq, values: Vec<Value>) {
        let Some(acked) = self.dispatcher.acknowledge(id, seq) else {
            debug!("Stale ack seq={} on channel {}", seq, id);
            return;
        };
        trace!("Ack seq={} on channel {}", seq, acked.channel);

        if let Some(callback) = acked.callback {
            callback(values);
        }
        self.dispatch();
    }

    fn on_transport_error(&mut self, id: ChannelId, seq: Seq, reason: &str) {
        // Errors before admission belong to the handshake, not to a packet.
        if self.slots[id.index()].state != ChannelState::Ready {
            debug!("Ignoring transport error on unadmitted channel {}: {}", id, reason);
            return;
        }

        let Some(values) = self.dispatcher.fail(id, seq) else {
            debug!("Transport error for unknown seq={} on channel {}", seq, id);
            return;
        };
        warn!("Packet seq={} failed on channel {}: {}", seq, id, reason);

        self.dispatcher.release(id);
        self.publish_lifecycle_event(LifecycleEvent::Error, &values);
        self.dispatch();
    }

    fn on_rejected(&mut self, id: ChannelId, seq: Seq, reason: &str) {
        let Some(values) = self.dispatcher.reject(id, seq) else {
            debug!("Rejection of unknown seq={} on channel {}", seq, id);
            return;
        };
        error!("Packet seq={} dropped by channel {}: {}", seq, id, reason);
        self.publish_lifecycle_event(LifecycleEvent::Error, &values);
        self.dispatch();
    }

    fn on_receive(&mut self, id: ChannelId, envelope: Envelope) {
        trace!("Received seq={} on channel {}", envelope.seq, id);
        for envelope in self.reassembler.push(envelope) {
            if LifecycleEvent::from_name(&envelope.event).is_some() {
                warn!("Dropping peer packet seq={} with reserved name {}", envelope.seq, envelope.event);
                continue;
            }
            self.emitter.publish(&envelope.event, &envelope.values);
        }
    }

    /// Hands queued packets to ready channels until one side runs dry.
    fn dispatch(&mut self) {
        while let Some((id, envelope)) = self.dispatcher.next_assignment() {
            let seq = envelope.seq;
            let slot = &mut self.slots[id.index()];

            if let Err(e) = slot.channel.send(Outbound::Packet(envelope)) {
                // The channel keeps no credit until it reconnects.
                warn!("Send of seq={} on channel {} failed: {}", seq, id, e);
                slot.state = ChannelState::Errored;
                if let Some(values) = self.dispatcher.fail(id, seq) {
                    self.publish_lifecycle_event(LifecycleEvent::Error, &values);
                }
            }
        }
    }

    fn apply(&mut self, transition: PoolTransition) {
        match transition {
            PoolTransition::Connected => {
                info!("Pool {} connected", self.identity);
                self.publish_lifecycle_event(LifecycleEvent::Connect, &[]);
            }
            PoolTransition::ConnectFailed => {
                error!(
                    "Pool {} failed to connect after {} attempts",
                    self.identity,
                    self.lifecycle.attempts()
                );
                self.publish_lifecycle_event(LifecycleEvent::ConnectError, &[]);
            }
            PoolTransition::Disconnected(reason) => {
                info!("Pool {} disconnected: {}", self.identity, reason);
                self.publish_lifecycle_event(LifecycleEvent::Disconnect, &[reason.into_bytes()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records everything the pool hands it.
    #[derive(Debug, Default)]
    struct ScriptedChannel {
        sent: Vec<Outbound>,
        connects: usize,
        disconnects: usize,
        fail_sends: bool,
        max_values: Option<usize>,
    }

    impl ScriptedChannel {
        fn packets(&self) -> Vec<u32> {
            self.sent
                .iter()
                .filter_map(|m| match m {
                    Outbound::Packet(env) => Some(env.seq.get()),
                    Outbound::Handshake { .. } => None,
                })
                .collect()
        }
    }

    impl Channel for ScriptedChannel {
        fn connect(&mut self) {
            self.connects += 1;
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }

        fn send(&mut self, message: Outbound) -> Result<()> {
            if self.fail_sends {
                return Err(Error::with_detail(ErrorKind::ChannelTransport, "broken pipe"));
            }
            self.sent.push(message);
            Ok(())
        }

        fn check_packet(&self, _event: &str, values: &[Value]) -> Result<()> {
            match self.max_values {
                Some(max) if values.len() > max => {
                    Err(Error::with_detail(ErrorKind::InvalidFrame, "too many values"))
                }
                _ => Ok(()),
            }
        }
    }

    type Log = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

    fn pool(count: usize) -> (Pool<ScriptedChannel>, Log) {
        pool_with(PoolConfig::new().with_channel_count(count))
    }

    fn pool_with(config: PoolConfig) -> (Pool<ScriptedChannel>, Log) {
        let mut pool = Pool::new(config, |_| ScriptedChannel::default());
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        for name in ["connect", "connect_error", "disconnect", "error", "message", "chat"] {
            let log = log.clone();
            pool.subscribe(name, move |values: &[Value]| {
                log.lock().unwrap().push((name.to_string(), values.to_vec()))
            });
        }
        pool.open();
        (pool, log)
    }

    fn id(i: usize) -> ChannelId {
        ChannelId::new(i)
    }

    fn admit(pool: &mut Pool<ScriptedChannel>, i: usize) {
        pool.handle_channel_event(id(i), ChannelEvent::Connect);
        pool.handle_channel_event(id(i), ChannelEvent::HandshakeAck);
    }

    fn count(log: &Log, name: &str) -> usize {
        log.lock().unwrap().iter().filter(|(n, _)| n == name).count()
    }

    fn messages(log: &Log) -> Vec<Vec<Value>> {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == "message")
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn value(tag: u32) -> Vec<Value> {
        vec![tag.to_be_bytes().to_vec()]
    }

    #[test]
    fn test_open_connects_every_channel() {
        let (pool, _) = pool(3);
        for i in 0..3 {
            assert_eq!(pool.channel(id(i)).unwrap().connects, 1);
            assert_eq!(pool.channel_state(id(i)), Some(ChannelState::Pending));
        }
        assert!(pool.is_disconnected());
        assert!(!pool.is_connected());
    }

    #[test]
    fn test_connect_and_disconnect_raised_once_per_episode() {
        let (mut pool, log) = pool(3);

        pool.handle_channel_event(id(0), ChannelEvent::Connect);
        assert_eq!(count(&log, "connect"), 1);
        assert!(pool.is_connected());

        pool.handle_channel_event(id(1), ChannelEvent::Connect);
        pool.handle_channel_event(id(2), ChannelEvent::Connect);
        assert_eq!(count(&log, "connect"), 1);

        pool.handle_channel_event(id(0), ChannelEvent::Disconnect("ping timeout".into()));
        assert_eq!(count(&log, "disconnect"), 0);
        assert!(pool.is_connected());

        pool.handle_channel_event(id(1), ChannelEvent::Disconnect("ping timeout".into()));
        pool.handle_channel_event(id(2), ChannelEvent::Disconnect("transport close".into()));
        assert_eq!(count(&log, "disconnect"), 1);
        assert!(pool.is_disconnected());

        let log = log.lock().unwrap();
        let (_, args) = log.iter().find(|(n, _)| n == "disconnect").unwrap();
        assert_eq!(args, &vec![b"transport close".to_vec()]);
    }

    #[test]
    fn test_connect_error_when_every_channel_fails() {
        let (mut pool, log) = pool_with(
            PoolConfig::new()
                .with_channel_count(3)
                .with_auto_reconnect(false),
        );

        pool.handle_channel_event(id(0), ChannelEvent::ConnectError("refused".into()));
        pool.handle_channel_event(id(1), ChannelEvent::ConnectTimeout);
        assert_eq!(count(&log, "connect_error"), 0);

        pool.handle_channel_event(id(2), ChannelEvent::ConnectError("refused".into()));
        assert_eq!(count(&log, "connect_error"), 1);
        assert_eq!(pool.channel_state(id(2)), Some(ChannelState::Errored));
    }

    #[test]
    fn test_connect_errors_ignored_with_auto_reconnect() {
        let (mut pool, log) = pool(2);

        pool.handle_channel_event(id(0), ChannelEvent::ConnectError("refused".into()));
        pool.handle_channel_event(id(1), ChannelEvent::ConnectError("refused".into()));
        assert_eq!(count(&log, "connect_error"), 0);

        // The transport giving up still counts.
        pool.handle_channel_event(id(0), ChannelEvent::ReconnectFailed);
        assert_eq!(count(&log, "connect_error"), 0);
        pool.handle_channel_event(id(1), ChannelEvent::ReconnectFailed);
        assert_eq!(count(&log, "connect_error"), 1);
    }

    #[test]
    fn test_handshake_gates_traffic() {
        let (mut pool, _) = pool(1);

        pool.handle_channel_event(id(0), ChannelEvent::Connect);
        let sent = &pool.channel(id(0)).unwrap().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            Outbound::Handshake {
                identity: pool.identity().clone(),
                epoch: 0,
            }
        );
        assert_eq!(pool.channel_state(id(0)), Some(ChannelState::Connected));

        pool.send(value(0), None).unwrap();
        assert!(pool.channel(id(0)).unwrap().packets().is_empty());

        pool.handle_channel_event(id(0), ChannelEvent::HandshakeAck);
        assert_eq!(pool.channel_state(id(0)), Some(ChannelState::Ready));
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0]);
    }

    #[test]
    fn test_at_most_one_packet_in_flight_per_channel() {
        let (mut pool, _) = pool(2);
        admit(&mut pool, 0);
        admit(&mut pool, 1);

        for tag in 0..5 {
            pool.send(value(tag), None).unwrap();
        }
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0]);
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![1]);

        pool.handle_channel_event(id(1), ChannelEvent::Ack { seq: Seq::new(1), values: vec![] });
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![1, 2]);
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0]);

        pool.handle_channel_event(id(0), ChannelEvent::Ack { seq: Seq::new(0), values: vec![] });
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0, 3]);
        assert_eq!(pool.stats().packets_acked, 2);
    }

    #[test]
    fn test_ack_callback_receives_peer_payload() {
        let (mut pool, _) = pool(1);
        admit(&mut pool, 0);

        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        pool.emit(
            "chat",
            value(7),
            Some(Box::new(move |values| *sink.lock().unwrap() = Some(values))),
        )
        .unwrap();

        pool.handle_channel_event(
            id(0),
            ChannelEvent::Ack { seq: Seq::new(0), values: vec![b"ok".to_vec()] },
        );
        assert_eq!(*got.lock().unwrap(), Some(vec![b"ok".to_vec()]));
    }

    #[test]
    fn test_failed_packet_retried_before_queued_one() {
        let (mut pool, log) = pool(2);
        admit(&mut pool, 0);

        for tag in 0..7 {
            let seq = pool.send(value(tag), None).unwrap();
            if tag < 5 {
                pool.handle_channel_event(id(0), ChannelEvent::Ack { seq, values: vec![] });
            }
        }
        // seq 5 in flight on channel 0, seq 6 queued.
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0, 1, 2, 3, 4, 5]);

        pool.handle_channel_event(
            id(0),
            ChannelEvent::TransportError { seq: Seq::new(5), reason: "timeout".into() },
        );
        assert_eq!(count(&log, "error"), 1);
        // Channel 0 is healthy and got its credit back: 5 goes again first.
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0, 1, 2, 3, 4, 5, 5]);

        admit(&mut pool, 1);
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![6]);
        assert_eq!(pool.stats().packets_retried, 1);
    }

    #[test]
    fn test_retry_waits_for_a_ready_channel() {
        let (mut pool, _) = pool(2);
        admit(&mut pool, 0);
        pool.send(value(5), None).unwrap();
        pool.send(value(6), None).unwrap();

        // Channel 0 reports a failure and then refuses the retry too.
        pool.channel_mut(id(0)).unwrap().fail_sends = true;
        pool.handle_channel_event(
            id(0),
            ChannelEvent::TransportError { seq: Seq::new(0), reason: "reset".into() },
        );
        assert_eq!(pool.channel_state(id(0)), Some(ChannelState::Errored));
        assert!(!pool.is_in_flight(id(0)));

        admit(&mut pool, 1);
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![0]);
        pool.handle_channel_event(id(1), ChannelEvent::Ack { seq: Seq::new(0), values: vec![] });
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![0, 1]);
    }

    #[test]
    fn test_transport_error_before_admission_is_ignored() {
        let (mut pool, log) = pool(1);
        pool.handle_channel_event(id(0), ChannelEvent::Connect);
        pool.handle_channel_event(
            id(0),
            ChannelEvent::TransportError { seq: Seq::new(0), reason: "handshake".into() },
        );
        assert_eq!(count(&log, "error"), 0);
        assert_eq!(pool.stats().packets_retried, 0);
    }

    #[test]
    fn test_lost_channel_packet_moves_to_survivor() {
        let (mut pool, log) = pool(2);
        admit(&mut pool, 0);
        admit(&mut pool, 1);
        pool.send(value(0), None).unwrap();
        pool.send(value(1), None).unwrap();
        pool.send(value(2), None).unwrap();

        pool.handle_channel_event(id(0), ChannelEvent::Disconnect("transport error".into()));
        assert_eq!(count(&log, "disconnect"), 0);

        pool.handle_channel_event(id(1), ChannelEvent::Ack { seq: Seq::new(1), values: vec![] });
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![1, 0]);
        pool.handle_channel_event(id(1), ChannelEvent::Ack { seq: Seq::new(0), values: vec![] });
        assert_eq!(pool.channel(id(1)).unwrap().packets(), vec![1, 0, 2]);
    }

    #[test]
    fn test_total_loss_abandons_in_flight() {
        let (mut pool, log) = pool(1);
        admit(&mut pool, 0);
        pool.send(value(0), None).unwrap();
        pool.send(value(1), None).unwrap();

        pool.handle_channel_event(id(0), ChannelEvent::Disconnect("transport close".into()));
        assert_eq!(count(&log, "disconnect"), 1);
        assert_eq!(pool.stats().packets_abandoned, 1);

        // The channel comes back: the queued packet goes out, the lost one does not.
        admit(&mut pool, 0);
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0, 1]);
        assert_eq!(count(&log, "connect"), 2);
    }

    #[test]
    fn test_close_drops_everything_once() {
        let (mut pool, log) = pool(2);
        admit(&mut pool, 0);
        admit(&mut pool, 1);
        for tag in 0..4 {
            pool.send(value(tag), None).unwrap();
        }

        pool.close();
        assert!(pool.is_disconnected());
        assert_eq!(count(&log, "disconnect"), 1);
        assert_eq!(pool.stats().packets_abandoned, 4);
        for i in 0..2 {
            assert_eq!(pool.channel(id(i)).unwrap().disconnects, 1);
        }

        // Late transport events change nothing.
        pool.handle_channel_event(id(0), ChannelEvent::Disconnect("io client disconnect".into()));
        pool.handle_channel_event(id(1), ChannelEvent::Connect);
        assert_eq!(count(&log, "disconnect"), 1);
        assert!(pool.is_disconnected());

        pool.open();
        admit(&mut pool, 1);
        assert_eq!(pool.send(value(9), None).unwrap(), Seq::ZERO);
    }

    #[test]
    fn test_reserved_names_bypass_ordering() {
        let (mut pool, log) = pool(1);

        pool.emit("error", vec![b"custom".to_vec()], None).unwrap();
        assert_eq!(count(&log, "error"), 1);
        assert_eq!(pool.stats().packets_enqueued, 0);

        let err = pool
            .send_application_message("disconnect", vec![], None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReservedEvent);
    }

    #[test]
    fn test_received_packets_delivered_in_send_order() {
        let (mut pool, log) = pool(3);
        for (channel, seq) in [(1, 1), (0, 0), (2, 2)] {
            pool.handle_channel_event(
                id(channel),
                ChannelEvent::Received(Envelope::new(Seq::new(seq), "message", value(seq))),
            );
        }
        assert_eq!(messages(&log), vec![value(0), value(1), value(2)]);
        assert_eq!(pool.stats().packets_delivered, 3);
    }

    #[test]
    fn test_unordered_delivery_when_disabled() {
        let (mut pool, log) = pool_with(
            PoolConfig::new()
                .with_channel_count(2)
                .with_sequential_delivery(false),
        );
        for seq in [1, 0] {
            pool.handle_channel_event(
                id(0),
                ChannelEvent::Received(Envelope::new(Seq::new(seq), "message", value(seq))),
            );
        }
        assert_eq!(messages(&log), vec![value(1), value(0)]);
    }

    #[test]
    fn test_peer_cannot_spoof_lifecycle_events() {
        let (mut pool, log) = pool(1);
        pool.handle_channel_event(
            id(0),
            ChannelEvent::Received(Envelope::new(Seq::new(0), "connect", vec![])),
        );
        pool.handle_channel_event(
            id(0),
            ChannelEvent::Received(Envelope::new(Seq::new(1), "chat", value(1))),
        );
        assert_eq!(count(&log, "connect"), 0);
        assert_eq!(count(&log, "chat"), 1);
    }

    fn last_epoch(pool: &Pool<ScriptedChannel>, i: usize) -> Option<u32> {
        pool.channel(id(i))
            .unwrap()
            .sent
            .iter()
            .rev()
            .find_map(|m| match m {
                Outbound::Handshake { epoch, .. } => Some(*epoch),
                Outbound::Packet(_) => None,
            })
    }

    #[test]
    fn test_unencodable_packet_refused_before_numbering() {
        let mut pool = Pool::new(PoolConfig::new().with_channel_count(2), |_| ScriptedChannel {
            max_values: Some(3),
            ..ScriptedChannel::default()
        });
        pool.open();
        admit(&mut pool, 0);

        let err = pool.send(vec![Vec::new(); 4], None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFrame);
        assert_eq!(pool.stats().packets_enqueued, 0);
        assert!(pool.channel(id(0)).unwrap().packets().is_empty());

        // The next packet takes the number the refused one would have had.
        assert_eq!(pool.send(value(1), None).unwrap(), Seq::ZERO);
    }

    #[test]
    fn test_rejected_packet_dropped_without_retry() {
        let (mut pool, log) = pool(1);
        admit(&mut pool, 0);
        pool.send(value(0), None).unwrap();
        pool.send(value(1), None).unwrap();

        pool.handle_channel_event(
            id(0),
            ChannelEvent::Rejected { seq: Seq::ZERO, reason: "frame too large".into() },
        );
        assert_eq!(count(&log, "error"), 1);
        assert_eq!(pool.channel_state(id(0)), Some(ChannelState::Ready));
        assert_eq!(pool.channel(id(0)).unwrap().packets(), vec![0, 1]);

        let stats = pool.stats();
        assert_eq!(stats.packets_retried, 0);
        assert_eq!(stats.packets_abandoned, 1);
    }

    #[test]
    fn test_numbering_survives_total_loss() {
        let (mut pool, log) = pool(2);
        admit(&mut pool, 0);
        admit(&mut pool, 1);
        for seq in 0..2 {
            let seq = pool.send(value(seq), None).unwrap();
            pool.handle_channel_event(id(seq.get() as usize), ChannelEvent::Ack { seq, values: vec![] });
            pool.handle_channel_event(
                id(0),
                ChannelEvent::Received(Envelope::new(seq, "message", value(seq.get()))),
            );
        }

        pool.handle_channel_event(id(0), ChannelEvent::Disconnect("transport close".into()));
        pool.handle_channel_event(id(1), ChannelEvent::Disconnect("transport close".into()));
        assert!(pool.is_disconnected());

        pool.handle_channel_event(id(0), ChannelEvent::Reconnect(1));
        pool.handle_channel_event(id(0), ChannelEvent::HandshakeAck);
        assert_eq!(last_epoch(&pool, 0), Some(0));
        assert_eq!(pool.send(value(2), None).unwrap(), Seq::new(2));

        pool.handle_channel_event(
            id(0),
            ChannelEvent::Received(Envelope::new(Seq::new(2), "message", value(2))),
        );
        assert_eq!(messages(&log), vec![value(0), value(1), value(2)]);
    }

    #[test]
    fn test_close_starts_new_epoch() {
        let (mut pool, _) = pool(1);
        admit(&mut pool, 0);
        assert_eq!(last_epoch(&pool, 0), Some(0));

        pool.close();
        assert_eq!(pool.epoch(), 1);
        pool.open();
        admit(&mut pool, 0);
        assert_eq!(last_epoch(&pool, 0), Some(1));
        assert_eq!(pool.send(value(0), None).unwrap(), Seq::ZERO);
    }
}
