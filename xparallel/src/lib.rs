//! # XParallel - Ordered Messaging over a Channel Pool
//!
//! XParallel presents a pool of independent duplex channels as a single,
//! ordered, bidirectional message stream:
//!
//! - **Aggregate lifecycle**: one `connect` when the first channel comes up,
//!   one `disconnect` when the last one goes down
//! - **Identity handshake**: every channel announces the pool's identity before
//!   carrying traffic, so the peer can group channels into one session
//! - **Credit-based dispatch**: at most one unacknowledged packet per channel,
//!   failed packets retried ahead of fresh ones with their original sequence
//! - **In-order delivery**: packets arriving across channels are reassembled
//!   by modular sequence distance
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! │           emit / send / subscribe (PoolHandle)           │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Pool Layer                            │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │ Dispatcher  │ │ Reassembler │ │   Lifecycle     │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Channel Layer                         │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │  Channel 0  │ │  Channel 1  │ │   Channel N-1   │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                    Transport Layer                       │
//! │        NetChannel: TCP / Unix / vsock + FrameCodec       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use xparallel::{ChannelTarget, NetChannel, NetChannelConfig, PoolConfig, PoolDriver};
//!
//! let target = ChannelTarget::Tcp("127.0.0.1:9000".parse()?);
//! let (pool, _task) = PoolDriver::spawn(PoolConfig::default(), |sink| {
//!     NetChannel::new(target.clone(), NetChannelConfig::default(), sink)
//! });
//!
//! pool.subscribe("message", |values| println!("{values:?}")).await?;
//! pool.open().await?;
//! pool.send(vec![b"hello".to_vec()]).await?;
//! ```

#![deny(unsafe_code)]

pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod packet;
pub mod pool;
pub mod reliable;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelEvent, ChannelId, ChannelState, Identity, Outbound};
pub use config::PoolConfig;
pub use driver::{EventSink, PoolDriver, PoolHandle, PoolStatus};
pub use error::{Error, ErrorKind, Result};
pub use event::{LifecycleEvent, MESSAGE_EVENT};
pub use packet::{AckCallback, Envelope, Seq, Value};
pub use pool::{Pool, PoolStats};
pub use transport::{ChannelTarget, Frame, FrameCodec, NetChannel, NetChannelConfig};

/// Wire protocol version.
pub const VERSION: u8 = 1;

/// Channels per pool unless configured otherwise.
pub const DEFAULT_CHANNEL_COUNT: usize = 20;

/// Event name of the identity handshake.
pub const HANDSHAKE_EVENT: &str = "pidentity";

/// Event name of sequenced packets.
pub const PACKET_EVENT: &str = "ppacket";
