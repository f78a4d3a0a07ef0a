mod trans_client;

use log::{error, info};
use trans_client::TransClient;
use xparallel::{ChannelTarget, PoolConfig};

const MESSAGE_COUNT: u32 = 1000;
const MESSAGE_SIZE: usize = 64 * 1024; // 64 KB
const CHANNEL_COUNT: usize = 8;
const SOCKET_PATH: &str = "/tmp/xparallel.sock";
const TCP_ADDR: &str = "127.0.0.1:1234";

const DEFAULT_SERVER_CID: u32 = 3;
const DEFAULT_SERVER_PORT: u32 = 1234;

/// Connects over `tcp` (default), `unix` or `vsock` as given by the first argument.
fn target_from_args() -> Option<ChannelTarget> {
    match std::env::args().nth(1).as_deref() {
        None | Some("tcp") => TCP_ADDR.parse().ok().map(ChannelTarget::Tcp),
        Some("unix") => Some(ChannelTarget::Unix(SOCKET_PATH.into())),
        Some("vsock") => Some(ChannelTarget::Vsock {
            cid: DEFAULT_SERVER_CID,
            port: DEFAULT_SERVER_PORT,
        }),
        Some(_) => None,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let Some(target) = target_from_args() else {
        error!("Usage: client [tcp|unix|vsock]");
        return;
    };

    let config = PoolConfig::default().with_channel_count(CHANNEL_COUNT);
    let client = TransClient::new(target, config);

    info!(
        "Sending {} messages of {} KB over {} channels...",
        MESSAGE_COUNT,
        MESSAGE_SIZE / 1024,
        CHANNEL_COUNT
    );
    if let Err(e) = client.send_messages(MESSAGE_COUNT, MESSAGE_SIZE).await {
        error!("Client failed: {}", e);
    }
}
