mod trans_server;

use log::{error, info};
use trans_server::{ServerTarget, TransServer};

const VMADDR_CID_ANY: u32 = u32::MAX;
const SERVER_PORT: u32 = 1234;
const TCP_ADDR: &str = "127.0.0.1:1234";
const SOCKET_PATH: &str = "/tmp/xparallel.sock";

/// Listens on `tcp` (default), `unix` or `vsock` as given by the first argument.
fn target_from_args() -> Option<ServerTarget> {
    match std::env::args().nth(1).as_deref() {
        None | Some("tcp") => TCP_ADDR.parse().ok().map(ServerTarget::Tcp),
        Some("unix") => Some(ServerTarget::Unix(SOCKET_PATH.into())),
        Some("vsock") => Some(ServerTarget::Vsock {
            cid: VMADDR_CID_ANY,
            port: SERVER_PORT,
        }),
        Some(_) => None,
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Some(target) = target_from_args() else {
        error!("Usage: server [tcp|unix|vsock]");
        return;
    };

    info!("Starting server on {:?}", target);
    let server = TransServer::new(target);
    if let Err(e) = server.run().await {
        error!("Server stopped: {}", e);
    }
}
