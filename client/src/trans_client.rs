use log::*;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;
use xparallel::{
    ChannelTarget, Error, ErrorKind, LifecycleEvent, NetChannel, NetChannelConfig, PoolConfig,
    PoolDriver, PoolHandle, Result, MESSAGE_EVENT,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TransClient {
    target: ChannelTarget,
    config: PoolConfig,
}

impl TransClient {
    pub fn new(target: ChannelTarget, config: PoolConfig) -> Self {
        Self { target, config }
    }

    /// Sends `count` numbered messages of `size` bytes and waits until the
    /// server has echoed every index back in order.
    pub async fn send_messages(&self, count: u32, size: usize) -> Result<()> {
        let target = self.target.clone();
        let channel_config = NetChannelConfig::default().with_max_reconnect_attempts(5);
        let (pool, task) = PoolDriver::spawn(self.config, move |sink| {
            NetChannel::new(target.clone(), channel_config, sink)
        });

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        Self::log_lifecycle(&pool).await?;
        pool.subscribe(MESSAGE_EVENT, move |values| {
            let index = values
                .first()
                .and_then(|value| value.as_slice().try_into().ok())
                .map(u32::from_be_bytes);
            let _ = reply_tx.send(index);
        })
        .await?;

        info!("Opening {} channels to {:?}", self.config.channel_count, self.target);
        pool.open().await?;
        timeout(CONNECT_TIMEOUT, pool.wait_connected())
            .await
            .map_err(|_| Error::with_detail(ErrorKind::PoolConnect, "timed out"))??;
        info!("Pool {} connected", pool.identity());

        let payload = vec![0xAB; size];
        let start = Instant::now();
        for index in 0..count {
            pool.send(vec![index.to_be_bytes().to_vec(), payload.clone()])
                .await?;
        }
        let elapsed = start.elapsed();
        let total = count as usize * size;
        info!("=== Send Complete ===");
        info!("Messages queued: {}", count);
        info!("Total sent: {} KB", total / 1024);
        info!("Time: {:.2} seconds", elapsed.as_secs_f64());

        for expected in 0..count {
            let reply = timeout(REPLY_TIMEOUT, reply_rx.recv())
                .await
                .map_err(|_| Error::with_detail(ErrorKind::PoolDisconnected, "reply timed out"))?;
            match reply {
                Some(Some(index)) if index == expected => {}
                Some(other) => warn!("Reply out of order: expected {}, got {:?}", expected, other),
                None => return Err(Error::new(ErrorKind::Closed)),
            }
        }
        let elapsed = start.elapsed();
        let speed = (total as f64 / 1024.0) / elapsed.as_secs_f64();
        info!("=== Round Trip Complete ===");
        info!("Replies received: {}", count);
        info!("Time: {:.2} seconds", elapsed.as_secs_f64());
        info!("Speed: {:.2} KB/s", speed);

        let stats = pool.stats().await?;
        info!("Pool stats: {:?}", stats);

        pool.shutdown().await?;
        let _ = task.await;
        Ok(())
    }

    async fn log_lifecycle(pool: &PoolHandle) -> Result<()> {
        pool.subscribe(LifecycleEvent::Connect.as_str(), |_| info!("Pool connected"))
            .await?;
        pool.subscribe(LifecycleEvent::Disconnect.as_str(), |args| {
            let reason = args.first().map(|r| String::from_utf8_lossy(r).into_owned());
            info!("Pool disconnected: {:?}", reason);
        })
        .await?;
        pool.subscribe(LifecycleEvent::ConnectError.as_str(), |_| {
            error!("No channel could connect")
        })
        .await?;
        pool.subscribe(LifecycleEvent::Error.as_str(), |values| {
            warn!("Packet with {} values failed, retrying", values.len());
        })
        .await
    }
}
