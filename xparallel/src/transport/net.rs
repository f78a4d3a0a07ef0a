//! Stream-socket channel.
//!
//! A [`NetChannel`] owns one background task per connection episode. The task
//! dials the target, reports lifecycle events through its [`EventSink`],
//! writes whatever the pool hands to [`Channel::send`] and answers the peer's
//! handshakes and packets. Reconnection uses a fixed delay and an optional
//! attempt limit; whether to reconnect at all is the pool's
//! `auto_reconnect`, read from the sink.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_vsock::{VsockAddr, VsockStream};

use super::codec::{self, Frame, FrameCodec};
use crate::channel::{Channel, ChannelEvent, Outbound};
use crate::driver::EventSink;
use crate::error::{Error, ErrorKind, Result};
use crate::packet::Value;
use crate::pool::CLIENT_DISCONNECT_REASON;

/// Reason reported when the peer closes the stream.
pub const TRANSPORT_CLOSE_REASON: &str = "transport close";

/// Where a [`NetChannel`] dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct NetChannelConfig {
    /// Limit for a single dial.
    pub connect_timeout: Duration,

    /// Pause between reconnection attempts.
    pub reconnect_delay: Duration,

    /// None retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl NetChannelConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }
}

impl Default for NetChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

async fn dial(target: &ChannelTarget) -> std::io::Result<BoxedStream> {
    match target {
        ChannelTarget::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        ChannelTarget::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        ChannelTarget::Vsock { cid, port } => {
            Ok(Box::new(VsockStream::connect(VsockAddr::new(*cid, *port)).await?))
        }
    }
}

pub struct NetChannel {
    target: ChannelTarget,
    config: NetChannelConfig,
    sink: EventSink,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl NetChannel {
    pub fn new(target: ChannelTarget, config: NetChannelConfig, sink: EventSink) -> Self {
        Self {
            target,
            config,
            sink,
            outbound: None,
            cancel: None,
            task: None,
        }
    }

    pub fn target(&self) -> &ChannelTarget {
        &self.target
    }

    /// Whether the connection task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Channel for NetChannel {
    fn connect(&mut self) {
        if self.is_running() {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            self.target.clone(),
            self.config,
            self.sink.clone(),
            rx,
            cancel.clone(),
        ));

        self.outbound = Some(tx);
        self.cancel = Some(cancel);
        self.task = Some(task);
    }

    fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
        self.task = None;
    }

    fn send(&mut self, message: Outbound) -> Result<()> {
        match &self.outbound {
            Some(tx) => tx
                .send(message)
                .map_err(|_| Error::with_detail(ErrorKind::ChannelTransport, "connection task stopped")),
            None => Err(Error::with_detail(ErrorKind::ChannelTransport, "channel not connected")),
        }
    }

    fn check_packet(&self, event: &str, values: &[Value]) -> Result<()> {
        codec::check_packet(event, values)
    }
}

impl Drop for NetChannel {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

enum Closed {
    Local,
    Remote(String),
}

async fn run(
    target: ChannelTarget,
    config: NetChannelConfig,
    sink: EventSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    let id = sink.id();
    let mut attempt: u32 = 0;
    let mut was_connected = false;

    loop {
        let dialing = timeout(config.connect_timeout, dial(&target));
        let dialed = tokio::select! {
            _ = cancel.cancelled() => return,
            dialed = dialing => dialed,
        };
        let reconnecting = was_connected || attempt > 0;

        match dialed {
            Ok(Ok(stream)) => {
                debug!("Channel {} connected to {:?}", id, target);
                // Anything still queued was addressed to the previous connection.
                while outbound.try_recv().is_ok() {}

                if reconnecting {
                    sink.emit(ChannelEvent::Reconnect(attempt));
                } else {
                    sink.emit(ChannelEvent::Connect);
                }
                was_connected = true;
                attempt = 0;

                match drive(stream, &sink, &mut outbound, &cancel).await {
                    Closed::Local => {
                        // The pool already recorded this disconnect when it asked for it.
                        debug!("Channel {} closed: {}", id, CLIENT_DISCONNECT_REASON);
                        return;
                    }
                    Closed::Remote(reason) => {
                        info!("Channel {} lost connection: {}", id, reason);
                        sink.emit(ChannelEvent::Disconnect(reason));
                    }
                }
            }
            Ok(Err(err)) => {
                warn!("Channel {} failed to connect: {}", id, err);
                if reconnecting {
                    sink.emit(ChannelEvent::ReconnectError(err.to_string()));
                } else {
                    sink.emit(ChannelEvent::ConnectError(err.to_string()));
                }
            }
            Err(_) => {
                warn!("Channel {} timed out connecting", id);
                if reconnecting {
                    sink.emit(ChannelEvent::ReconnectError("timeout".to_string()));
                } else {
                    sink.emit(ChannelEvent::ConnectTimeout);
                }
            }
        }

        if !sink.auto_reconnect() {
            return;
        }
        if config.max_reconnect_attempts.is_some_and(|max| attempt >= max) {
            sink.emit(ChannelEvent::ReconnectFailed);
            return;
        }

        attempt += 1;
        sink.emit(ChannelEvent::ReconnectAttempt(attempt));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(config.reconnect_delay) => {}
        }
        sink.emit(ChannelEvent::Reconnecting(attempt));
    }
}

async fn drive(
    stream: BoxedStream,
    sink: &EventSink,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    cancel: &CancellationToken,
) -> Closed {
    let mut framed = Framed::new(stream, FrameCodec::new());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = SinkExt::<Frame>::close(&mut framed).await;
                return Closed::Local;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = SinkExt::<Frame>::close(&mut framed).await;
                    return Closed::Local;
                };
                let (frame, seq) = match message {
                    Outbound::Handshake { identity, epoch } => (Frame::Handshake { identity, epoch }, None),
                    Outbound::Packet(envelope) => {
                        let seq = envelope.seq;
                        (Frame::Packet(envelope), Some(seq))
                    }
                };
                trace!("Channel {} sending {} {:?}", sink.id(), frame.frame_type().event_name(), seq);
                match (framed.send(frame).await, seq) {
                    (Ok(()), _) => {}
                    // Nothing reached the stream, so the connection is still good.
                    (Err(err), Some(seq)) if err.kind() == ErrorKind::InvalidFrame => {
                        warn!("Channel {} cannot encode seq={}: {}", sink.id(), seq, err);
                        sink.emit(ChannelEvent::Rejected {
                            seq,
                            reason: err.to_string(),
                        });
                    }
                    (Err(err), Some(seq)) => {
                        sink.emit(ChannelEvent::TransportError {
                            seq,
                            reason: err.to_string(),
                        });
                        return Closed::Remote(err.to_string());
                    }
                    (Err(err), None) => return Closed::Remote(err.to_string()),
                }
            }
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(err) = handle_frame(frame, sink, &mut framed).await {
                        return Closed::Remote(err.to_string());
                    }
                }
                Some(Err(err)) => return Closed::Remote(err.to_string()),
                None => return Closed::Remote(TRANSPORT_CLOSE_REASON.to_string()),
            }
        }
    }
}

async fn handle_frame(
    frame: Frame,
    sink: &EventSink,
    framed: &mut Framed<BoxedStream, FrameCodec>,
) -> Result<()> {
    match frame {
        Frame::Handshake { identity, epoch } => {
            debug!("Channel {} peer identity {} epoch {}", sink.id(), identity, epoch);
            framed.send(Frame::HandshakeAck).await?;
        }
        Frame::HandshakeAck => {
            sink.emit(ChannelEvent::HandshakeAck);
        }
        Frame::Packet(envelope) => {
            framed
                .send(Frame::Ack {
                    seq: envelope.seq,
                    values: Vec::new(),
                })
                .await?;
            sink.emit(ChannelEvent::Received(envelope));
        }
        Frame::Ack { seq, values } => {
            sink.emit(ChannelEvent::Ack { seq, values });
        }
        Frame::Nack { seq, reason } => {
            sink.emit(ChannelEvent::TransportError { seq, reason });
        }
    }
    Ok(())
}
