//! Wire frames for [`NetChannel`](super::NetChannel).
//!
//! Every frame is carried length-delimited (u32 big-endian length prefix)
//! and its body starts with a one-byte [`FrameType`].
//!
//! # Frame Format
//!
//! ```text
//! Handshake     | 0x01 | version u8 | epoch u32 | id_len u16 | identity             |
//! HandshakeAck  | 0x02 |
//! Packet        | 0x03 | seq u32 | event_len u16 | event | count u16 | values...  |
//! Ack           | 0x04 | seq u32 | count u16 | values...                           |
//! Nack          | 0x05 | seq u32 | reason_len u16 | reason                         |
//!
//! value         | len u32 | bytes |
//! ```
//!
//! All integers are big-endian.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::channel::Identity;
use crate::error::{Error, ErrorKind, Result};
use crate::packet::{Envelope, Seq, Value};
use crate::{HANDSHAKE_EVENT, PACKET_EVENT, VERSION};

/// Largest frame body accepted or produced.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Identity announcement sent first on every connection.
    Handshake = 0x01,

    /// Identity accepted.
    HandshakeAck = 0x02,

    /// Sequenced application packet.
    Packet = 0x03,

    /// Packet accepted, with the receiver's reply values.
    Ack = 0x04,

    /// Packet refused; the sender retries it.
    Nack = 0x05,
}

impl FrameType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::Packet),
            0x04 => Some(Self::Ack),
            0x05 => Some(Self::Nack),
            _ => None,
        }
    }

    /// Name used when logging the frame.
    pub const fn event_name(self) -> &'static str {
        match self {
            Self::Handshake | Self::HandshakeAck => HANDSHAKE_EVENT,
            Self::Packet | Self::Ack | Self::Nack => PACKET_EVENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake { identity: Identity, epoch: u32 },
    HandshakeAck,
    Packet(Envelope),
    Ack { seq: Seq, values: Vec<Value> },
    Nack { seq: Seq, reason: String },
}

fn invalid(detail: impl Into<String>) -> Error {
    Error::with_detail(ErrorKind::InvalidFrame, detail)
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Handshake { .. } => FrameType::Handshake,
            Frame::HandshakeAck => FrameType::HandshakeAck,
            Frame::Packet(_) => FrameType::Packet,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Nack { .. } => FrameType::Nack,
        }
    }

    /// Writes the frame body (without the length prefix).
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.frame_type() as u8);
        match self {
            Frame::Handshake { identity, epoch } => {
                dst.put_u8(VERSION);
                dst.put_u32(*epoch);
                put_str(dst, identity.as_str())?;
            }
            Frame::HandshakeAck => {}
            Frame::Packet(envelope) => {
                dst.put_u32(envelope.seq.get());
                put_str(dst, &envelope.event)?;
                put_values(dst, &envelope.values)?;
            }
            Frame::Ack { seq, values } => {
                dst.put_u32(seq.get());
                put_values(dst, values)?;
            }
            Frame::Nack { seq, reason } => {
                dst.put_u32(seq.get());
                put_str(dst, reason)?;
            }
        }
        Ok(())
    }

    /// Parses one frame body. Trailing bytes are an error.
    pub fn decode(mut src: &[u8]) -> Result<Frame> {
        let buf = &mut src;
        let tag = take_u8(buf)?;
        let frame_type =
            FrameType::from_u8(tag).ok_or_else(|| invalid(format!("unknown frame type {tag:#04x}")))?;

        let frame = match frame_type {
            FrameType::Handshake => {
                let version = take_u8(buf)?;
                if version != VERSION {
                    return Err(invalid(format!("unsupported version {version}")));
                }
                let epoch = take_u32(buf)?;
                Frame::Handshake {
                    identity: Identity::from(take_str(buf)?),
                    epoch,
                }
            }
            FrameType::HandshakeAck => Frame::HandshakeAck,
            FrameType::Packet => {
                let seq = Seq::new(take_u32(buf)?);
                let event = take_str(buf)?;
                let values = take_values(buf)?;
                Frame::Packet(Envelope::new(seq, event, values))
            }
            FrameType::Ack => Frame::Ack {
                seq: Seq::new(take_u32(buf)?),
                values: take_values(buf)?,
            },
            FrameType::Nack => Frame::Nack {
                seq: Seq::new(take_u32(buf)?),
                reason: take_str(buf)?,
            },
        };

        if buf.has_remaining() {
            return Err(invalid(format!("{} trailing bytes", buf.remaining())));
        }
        Ok(frame)
    }
}

/// Encoded size of a packet frame body.
fn packet_len(event: &str, values: &[Value]) -> usize {
    let values_len: usize = values.iter().map(|value| 4 + value.len()).sum();
    1 + 4 + 2 + event.len() + 2 + values_len
}

/// Checks that a packet with this event name and these values fits in one
/// frame.
pub fn check_packet(event: &str, values: &[Value]) -> Result<()> {
    if event.len() > u16::MAX as usize {
        return Err(invalid(format!("event name of {} bytes", event.len())));
    }
    if values.len() > u16::MAX as usize {
        return Err(invalid(format!("{} values in one packet", values.len())));
    }
    let len = packet_len(event, values);
    if len > MAX_FRAME_LENGTH {
        return Err(invalid(format!(
            "packet of {len} bytes exceeds the {MAX_FRAME_LENGTH} byte frame limit"
        )));
    }
    Ok(())
}

fn put_str(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| invalid("string longer than 65535 bytes"))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_values(dst: &mut BytesMut, values: &[Value]) -> Result<()> {
    let count = u16::try_from(values.len()).map_err(|_| invalid("more than 65535 values"))?;
    dst.put_u16(count);
    for value in values {
        let len = u32::try_from(value.len()).map_err(|_| invalid("value too large"))?;
        dst.put_u32(len);
        dst.put_slice(value);
    }
    Ok(())
}

fn ensure(buf: &&[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(invalid(format!(
            "truncated frame: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn take_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    ensure(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn take_str(buf: &mut &[u8]) -> Result<String> {
    let len = take_u16(buf)? as usize;
    let bytes = take_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|_| invalid("string is not valid UTF-8"))
}

fn take_values(buf: &mut &[u8]) -> Result<Vec<Value>> {
    let count = take_u16(buf)? as usize;
    let mut values = Vec::with_capacity(count.min(buf.remaining() / 4 + 1));
    for _ in 0..count {
        let len = take_u32(buf)? as usize;
        values.push(take_bytes(buf, len)?);
    }
    Ok(values)
}

/// Length-delimited [`Frame`] codec for `tokio_util::codec::Framed`.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.inner.decode(src)? {
            Some(body) => Frame::decode(&body).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        frame.encode(&mut body)?;
        if body.len() > MAX_FRAME_LENGTH {
            return Err(invalid(format!("frame of {} bytes", body.len())));
        }
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}
