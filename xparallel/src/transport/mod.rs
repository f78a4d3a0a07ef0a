//! Reference transport.
//!
//! This module provides:
//! - Frame / FrameCodec: Tagged, length-delimited wire frames
//! - NetChannel: A [`Channel`](crate::channel::Channel) over TCP, Unix or vsock streams

mod codec;
mod net;

pub use codec::{check_packet, Frame, FrameCodec, FrameType, MAX_FRAME_LENGTH};
pub use net::{ChannelTarget, NetChannel, NetChannelConfig, TRANSPORT_CLOSE_REASON};
