//! Async pool driver.
//!
//! The driver task owns the [`Pool`] and applies channel events and
//! application commands one at a time, so no two dispatch passes or
//! reassembly deliveries ever interleave. Channels report through an
//! [`EventSink`]; the application talks to the task through a cloneable
//! [`PoolHandle`].

use log::{debug, trace};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelEvent, ChannelId, Identity};
use crate::config::PoolConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Handler, MESSAGE_EVENT};
use crate::packet::{AckCallback, Value};
use crate::pool::{Pool, PoolStats};

/// Capacity of the application command mailbox.
const MAILBOX_CAPACITY: usize = 1024;

enum Command {
    Open,
    Close,
    Emit {
        event: String,
        values: Vec<Value>,
        ack: Option<AckCallback>,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        event: String,
        handler: Handler,
    },
    Stats(oneshot::Sender<PoolStats>),
    Shutdown,
}

/// Where a channel reports its events. Also carries the pool's reconnect
/// policy.
#[derive(Debug, Clone)]
pub struct EventSink {
    id: ChannelId,
    tx: mpsc::UnboundedSender<(ChannelId, ChannelEvent)>,
    auto_reconnect: bool,
}

impl EventSink {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<(ChannelId, ChannelEvent)>) -> Self {
        Self {
            id,
            tx,
            auto_reconnect: true,
        }
    }

    pub fn with_auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether the channel should reconnect on its own.
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Reports an event. Returns false once the driver is gone.
    pub fn emit(&self, event: ChannelEvent) -> bool {
        self.tx.send((self.id, event)).is_ok()
    }
}

/// Read-only pool flags published by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub connected: bool,
    pub disconnected: bool,
}

impl PoolStatus {
    fn of<C: Channel>(pool: &Pool<C>) -> Self {
        Self {
            connected: pool.is_connected(),
            disconnected: pool.is_disconnected(),
        }
    }
}

/// Application side of a running pool.
#[derive(Clone)]
pub struct PoolHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PoolStatus>,
    identity: Identity,
}

fn closed() -> Error {
    Error::new(ErrorKind::Closed)
}

impl PoolHandle {
    /// The identity value this pool presents in every handshake.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.status.borrow().disconnected
    }

    pub fn status_watch(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }

    /// Waits until at least one channel is connected.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut status = self.status.clone();
        status
            .wait_for(|status| status.connected)
            .await
            .map(|_| ())
            .map_err(|_| closed())
    }

    pub async fn open(&self) -> Result<()> {
        self.request(Command::Open).await
    }

    pub async fn connect(&self) -> Result<()> {
        self.open().await
    }

    pub async fn close(&self) -> Result<()> {
        self.request(Command::Close).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.close().await
    }

    pub async fn emit(&self, event: &str, values: Vec<Value>) -> Result<()> {
        self.emit_inner(event, values, None).await
    }

    pub async fn emit_with_callback(
        &self,
        event: &str,
        values: Vec<Value>,
        ack: AckCallback,
    ) -> Result<()> {
        self.emit_inner(event, values, Some(ack)).await
    }

    /// Emits an event and waits for the peer's acknowledgment payload.
    pub async fn emit_with_ack(&self, event: &str, values: Vec<Value>) -> Result<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        let ack: AckCallback = Box::new(move |values| {
            let _ = tx.send(values);
        });
        self.emit_inner(event, values, Some(ack)).await?;

        rx.await.map_err(|_| {
            Error::with_detail(
                ErrorKind::PoolDisconnected,
                "packet dropped before acknowledgment",
            )
        })
    }

    /// Sends a `message` event.
    pub async fn send(&self, values: Vec<Value>) -> Result<()> {
        self.emit(MESSAGE_EVENT, values).await
    }

    pub async fn subscribe<F>(&self, event: &str, handler: F) -> Result<()>
    where
        F: FnMut(&[Value]) + Send + 'static,
    {
        self.request(Command::Subscribe {
            event: event.to_string(),
            handler: Box::new(handler),
        })
        .await
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Stats(tx)).await?;
        rx.await.map_err(|_| closed())
    }

    /// Closes the pool and stops the driver task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    async fn emit_inner(
        &self,
        event: &str,
        values: Vec<Value>,
        ack: Option<AckCallback>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Emit {
            event: event.to_string(),
            values,
            ack,
            reply,
        })
        .await?;
        rx.await.map_err(|_| closed())?
    }

    async fn request(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| closed())
    }
}

/// Spawns pool driver tasks.
pub struct PoolDriver;

impl PoolDriver {
    /// Builds a pool whose channels come from `factory` and starts driving
    /// it on the current tokio runtime.
    ///
    /// The pool is not opened; call [`PoolHandle::open`].
    pub fn spawn<C, F>(config: PoolConfig, mut factory: F) -> (PoolHandle, JoinHandle<()>)
    where
        C: Channel + Send + 'static,
        F: FnMut(EventSink) -> C,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(MAILBOX_CAPACITY);

        let pool = Pool::new(config, |id| {
            let sink = EventSink::new(id, event_tx.clone()).with_auto_reconnect(config.auto_reconnect);
            factory(sink)
        });
        let identity = pool.identity().clone();
        let (status_tx, status_rx) = watch::channel(PoolStatus::of(&pool));

        let task = tokio::spawn(run(pool, command_rx, event_rx, status_tx));
        let handle = PoolHandle {
            commands: command_tx,
            status: status_rx,
            identity,
        };
        (handle, task)
    }
}

async fn run<C: Channel>(
    mut pool: Pool<C>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::UnboundedReceiver<(ChannelId, ChannelEvent)>,
    status: watch::Sender<PoolStatus>,
) {
    debug!("Pool driver for {} started", pool.identity());

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => apply(&mut pool, command),
            },
            Some((id, event)) = events.recv() => {
                trace!("Channel {} event {:?}", id, event);
                pool.handle_channel_event(id, event);
            }
        }
        publish_status(&pool, &status);
    }

    pool.close();
    publish_status(&pool, &status);
    debug!("Pool driver for {} stopped", pool.identity());
}

fn apply<C: Channel>(pool: &mut Pool<C>, command: Command) {
    match command {
        Command::Open => {
            pool.open();
        }
        Command::Close => {
            pool.close();
        }
        Command::Emit {
            event,
            values,
            ack,
            reply,
        } => {
            let _ = reply.send(pool.emit(&event, values, ack));
        }
        Command::Subscribe { event, handler } => pool.subscribe_boxed(event, handler),
        Command::Stats(reply) => {
            let _ = reply.send(pool.stats());
        }
        Command::Shutdown => {}
    }
}

fn publish_status<C: Channel>(pool: &Pool<C>, status: &watch::Sender<PoolStatus>) {
    let next = PoolStatus::of(pool);
    status.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}
