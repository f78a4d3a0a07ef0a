use futures::{SinkExt, StreamExt};
use log::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tokio_vsock::{VsockAddr, VsockListener};
use xparallel::packet::SeqAllocator;
use xparallel::reliable::Reassembler;
use xparallel::{Envelope, Error, ErrorKind, Frame, FrameCodec, Identity, Result, MESSAGE_EVENT};

#[derive(Debug)]
pub enum ServerTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

/// How long a session without channels is kept for its pool to come back.
const SESSION_LINGER: Duration = Duration::from_secs(60);

/// All channels that presented the same identity and epoch.
///
/// A session outlives its channels: after an outage the pool reconnects
/// with the same epoch and carries on numbering where it stopped. A new
/// epoch means the pool was closed and reopened, so numbering restarts.
struct Session {
    epoch: u32,

    reassembler: Reassembler,

    /// Sequence numbers for replies sent back to the pool.
    replies: SeqAllocator,

    channels: usize,

    started: Instant,

    received_bytes: usize,

    /// Set while no channel is open.
    idle_since: Option<Instant>,
}

impl Session {
    fn new(epoch: u32) -> Self {
        Self {
            epoch,
            reassembler: Reassembler::new(true),
            replies: SeqAllocator::new(),
            channels: 0,
            started: Instant::now(),
            received_bytes: 0,
            idle_since: None,
        }
    }

    fn log_summary(&self, identity: &Identity) {
        let elapsed = self.started.elapsed();
        let speed = (self.received_bytes as f64 / 1024.0) / elapsed.as_secs_f64();
        info!("=== Session {} (epoch {}) Idle ===", identity, self.epoch);
        info!("Messages delivered: {}", self.reassembler.delivered());
        info!("Duplicates dropped: {}", self.reassembler.duplicates());
        info!("Total received: {} KB", self.received_bytes / 1024);
        info!("Time: {:.2} seconds", elapsed.as_secs_f64());
        info!("Speed: {:.2} KB/s", speed);
    }
}

type SessionMap = HashMap<Identity, Session>;

type Sessions = Arc<Mutex<SessionMap>>;

/// Adds a channel to the session of `identity`, starting a fresh session
/// when none exists or the epoch changed. Returns the session's open
/// channel count.
fn join(sessions: &mut SessionMap, identity: &Identity, epoch: u32, linger: Duration) -> usize {
    sessions.retain(|other, session| {
        let expired = session.idle_since.is_some_and(|since| since.elapsed() >= linger);
        if expired && other != identity {
            debug!("Session {} expired", other);
        }
        !expired || other == identity
    });

    let session = sessions
        .entry(identity.clone())
        .or_insert_with(|| Session::new(epoch));
    if session.epoch != epoch {
        info!(
            "Session {} restarted: epoch {} -> {}",
            identity, session.epoch, epoch
        );
        *session = Session::new(epoch);
    }
    session.channels += 1;
    session.idle_since = None;
    session.channels
}

/// Removes a channel of `epoch` from the session of `identity`. Channels of
/// a replaced epoch are not counted.
fn leave(sessions: &mut SessionMap, identity: &Identity, epoch: u32) {
    let Some(session) = sessions.get_mut(identity) else {
        return;
    };
    if session.epoch != epoch {
        return;
    }
    session.channels = session.channels.saturating_sub(1);
    if session.channels == 0 {
        session.log_summary(identity);
        session.idle_since = Some(Instant::now());
    }
}

pub struct TransServer {
    target: ServerTarget,
    sessions: Sessions,
}

impl TransServer {
    pub fn new(target: ServerTarget) -> Self {
        Self {
            target,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(&self) -> Result<()> {
        match &self.target {
            ServerTarget::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                info!("Server listening on Unix Socket {:?}", path);
                loop {
                    let (stream, _) = listener.accept().await?;
                    debug!("Accepted Unix connection");
                    self.spawn_channel(stream);
                }
            }
            ServerTarget::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("Server listening on TCP {:?}", addr);
                loop {
                    let (stream, peer) = listener.accept().await?;
                    stream.set_nodelay(true)?;
                    debug!("Accepted TCP connection from {:?}", peer);
                    self.spawn_channel(stream);
                }
            }
            ServerTarget::Vsock { cid, port } => {
                let listener = VsockListener::bind(VsockAddr::new(*cid, *port))?;
                info!("Server listening on Vsock CID:{} Port:{}", cid, port);
                loop {
                    let (stream, addr) = listener.accept().await?;
                    debug!("Accepted Vsock connection from {:?}", addr);
                    self.spawn_channel(stream);
                }
            }
        }
    }

    fn spawn_channel<T>(&self, stream: T)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_channel(stream, sessions).await {
                error!("Channel error: {}", e);
            }
        });
    }
}

/// Serves one channel: identity handshake first, then packets until the
/// client goes away.
async fn handle_channel<T>(stream: T, sessions: Sessions) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, FrameCodec::new());

    let (identity, epoch) = match framed.next().await {
        Some(Ok(Frame::Handshake { identity, epoch })) => (identity, epoch),
        Some(Ok(frame)) => {
            return Err(Error::with_detail(
                ErrorKind::InvalidFrame,
                format!("expected handshake, got {:?}", frame.frame_type()),
            ));
        }
        Some(Err(e)) => return Err(e),
        None => return Ok(()),
    };

    let open = join(&mut *sessions.lock().await, &identity, epoch, SESSION_LINGER);
    info!("Session {} (epoch {}) joined by a channel ({} open)", identity, epoch, open);
    framed.send(Frame::HandshakeAck).await?;

    let result = serve_packets(&mut framed, &identity, epoch, &sessions).await;

    leave(&mut *sessions.lock().await, &identity, epoch);
    result
}

async fn serve_packets<T>(
    framed: &mut Framed<T, FrameCodec>,
    identity: &Identity,
    epoch: u32,
    sessions: &Sessions,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = framed.next().await {
        match frame? {
            Frame::Packet(envelope) => {
                let seq = envelope.seq;
                let replies = deliver(envelope, identity, epoch, &mut *sessions.lock().await);
                framed
                    .send(Frame::Ack {
                        seq,
                        values: Vec::new(),
                    })
                    .await?;
                for reply in replies {
                    framed.send(Frame::Packet(reply)).await?;
                }
            }
            Frame::Ack { seq, .. } => trace!("Reply {} acknowledged", seq),
            Frame::Nack { seq, reason } => warn!("Reply {} refused: {}", seq, reason),
            Frame::Handshake { .. } | Frame::HandshakeAck => {
                warn!("Unexpected handshake on an established channel");
            }
        }
    }
    debug!("Channel of session {} closed", identity);
    Ok(())
}

/// Feeds one packet into the session and returns the replies for every
/// message it released.
fn deliver(envelope: Envelope, identity: &Identity, epoch: u32, sessions: &mut SessionMap) -> Vec<Envelope> {
    let Some(session) = sessions.get_mut(identity).filter(|session| session.epoch == epoch) else {
        debug!("Dropping seq={} from a replaced epoch of {}", envelope.seq, identity);
        return Vec::new();
    };

    let mut replies = Vec::new();
    for delivered in session.reassembler.push(envelope) {
        session.received_bytes += delivered.values.iter().map(Vec::len).sum::<usize>();
        trace!("Session {} delivered {} seq={}", identity, delivered.event, delivered.seq);

        if delivered.event == MESSAGE_EVENT {
            // Echo the message index so the client can check ordering.
            let index = delivered.values.first().cloned().unwrap_or_default();
            replies.push(Envelope::new(
                session.replies.allocate(),
                MESSAGE_EVENT,
                vec![index],
            ));
        }
    }
    replies
}

#[cfg(test)]
mod tests {
    use super::*;
    use xparallel::Seq;

    fn message(seq: u32) -> Envelope {
        Envelope::new(Seq::new(seq), MESSAGE_EVENT, vec![seq.to_be_bytes().to_vec()])
    }

    fn echoed(replies: &[Envelope]) -> Vec<(u32, u32)> {
        replies
            .iter()
            .map(|reply| {
                let index = u32::from_be_bytes(reply.values[0].as_slice().try_into().unwrap());
                (reply.seq.get(), index)
            })
            .collect()
    }

    #[test]
    fn test_session_survives_outage() {
        let mut sessions = SessionMap::new();
        let client = Identity::from("client");

        assert_eq!(join(&mut sessions, &client, 0, SESSION_LINGER), 1);
        assert_eq!(join(&mut sessions, &client, 0, SESSION_LINGER), 2);
        assert_eq!(echoed(&deliver(message(1), &client, 0, &mut sessions)), vec![]);
        assert_eq!(
            echoed(&deliver(message(0), &client, 0, &mut sessions)),
            vec![(0, 0), (1, 1)]
        );

        leave(&mut sessions, &client, 0);
        leave(&mut sessions, &client, 0);
        assert!(sessions[&client].idle_since.is_some());

        // Both channels come back with the same epoch.
        assert_eq!(join(&mut sessions, &client, 0, SESSION_LINGER), 1);
        assert_eq!(
            echoed(&deliver(message(2), &client, 0, &mut sessions)),
            vec![(2, 2)]
        );
    }

    #[test]
    fn test_new_epoch_restarts_numbering() {
        let mut sessions = SessionMap::new();
        let client = Identity::from("client");

        join(&mut sessions, &client, 0, SESSION_LINGER);
        deliver(message(0), &client, 0, &mut sessions);
        deliver(message(1), &client, 0, &mut sessions);

        join(&mut sessions, &client, 1, SESSION_LINGER);
        assert_eq!(
            echoed(&deliver(message(0), &client, 1, &mut sessions)),
            vec![(0, 0)]
        );

        // A straggler from the old epoch neither delivers nor closes the session.
        assert!(deliver(message(2), &client, 0, &mut sessions).is_empty());
        leave(&mut sessions, &client, 0);
        assert_eq!(sessions[&client].channels, 1);
    }

    #[test]
    fn test_idle_sessions_expire() {
        let mut sessions = SessionMap::new();
        let gone = Identity::from("gone");
        let busy = Identity::from("busy");

        join(&mut sessions, &gone, 0, SESSION_LINGER);
        leave(&mut sessions, &gone, 0);
        join(&mut sessions, &busy, 0, SESSION_LINGER);
        assert_eq!(sessions.len(), 2);

        join(&mut sessions, &busy, 0, Duration::ZERO);
        assert!(!sessions.contains_key(&gone));
        assert_eq!(sessions[&busy].channels, 2);
    }
}
