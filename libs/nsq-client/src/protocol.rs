//! NSQ TCP protocol (V2) commands and frames.
//!
//! Commands are newline terminated text, optionally followed by a 4 byte
//! big-endian size and a body. Everything nsqd sends back is a frame:
//!
//! ```text
//! [size: u32][frame type: u32][data: size - 4 bytes]
//! ```
//!
//! Message frames carry `[timestamp: i64][attempts: u16][id: 16 bytes][body]`.
use std::{io, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{MessageId, RawMessage};

/// sent once, right after the TCP connect
pub const MAGIC_V2: &[u8] = b"  V2";
/// response nsqd sends periodically, must be answered with `NOP`
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
/// response to `CLS`
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
/// the usual successful response
pub const OK: &[u8] = b"OK";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

/// nsqd refuses anything near this; a bigger size prefix means the stream is corrupt
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// timestamp + attempts + id
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MessageId::LEN;

/// Body of the `IDENTIFY` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identify {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    /// milliseconds
    pub heartbeat_interval: u64,
    pub feature_negotiation: bool,
}

/// Commands a client sends to nsqd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// JSON encoded [`Identify`]
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, timeout: Duration },
    Touch(MessageId),
    Pub { topic: String, body: Bytes },
    Nop,
    Cls,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Pub { .. } => "PUB",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
        }
    }
}

/// Frames nsqd sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

impl Frame {
    /// Write this frame the way nsqd would. Only peers that play the broker
    /// side (tests, fakes) need this.
    pub fn encode(&self, dst: &mut BytesMut) {
        let (frame_type, len) = match self {
            Frame::Response(data) => (FRAME_TYPE_RESPONSE, data.len()),
            Frame::Error(data) => (FRAME_TYPE_ERROR, data.len()),
            Frame::Message(msg) => (FRAME_TYPE_MESSAGE, MESSAGE_HEADER_LEN + msg.body.len()),
        };
        dst.reserve(8 + len);
        dst.put_u32((len + 4) as u32);
        dst.put_u32(frame_type);
        match self {
            Frame::Response(data) | Frame::Error(data) => dst.extend_from_slice(data),
            Frame::Message(msg) => {
                dst.put_i64(msg.timestamp);
                dst.put_u16(msg.attempts);
                dst.extend_from_slice(msg.id.as_bytes());
                dst.extend_from_slice(&msg.body);
            }
        }
    }
}

/// `tokio-util` codec for the client side of the protocol.
#[derive(Debug, Default, Clone, Copy)]
pub struct NsqCodec;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn put_sized(dst: &mut BytesMut, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("body of {} bytes does not fit a size prefix", body.len()),
        )
    })?;
    dst.reserve(4 + body.len());
    dst.put_u32(len);
    dst.extend_from_slice(body);
    Ok(())
}

impl Encoder<Command> for NsqCodec {
    type Error = io::Error;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> io::Result<()> {
        match cmd {
            Command::Identify(body) => {
                dst.extend_from_slice(b"IDENTIFY\n");
                put_sized(dst, &body)?;
            }
            Command::Sub { topic, channel } => {
                dst.extend_from_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => {
                dst.extend_from_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                dst.extend_from_slice(format!("FIN {id}\n").as_bytes());
            }
            Command::Req { id, timeout } => {
                dst.extend_from_slice(format!("REQ {id} {}\n", timeout.as_millis()).as_bytes());
            }
            Command::Touch(id) => {
                dst.extend_from_slice(format!("TOUCH {id}\n").as_bytes());
            }
            Command::Pub { topic, body } => {
                dst.extend_from_slice(format!("PUB {topic}\n").as_bytes());
                put_sized(dst, &body)?;
            }
            Command::Nop => dst.extend_from_slice(b"NOP\n"),
            Command::Cls => dst.extend_from_slice(b"CLS\n"),
        }
        Ok(())
    }
}

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = (&src[..4]).get_u32() as usize;
        if !(4..=MAX_FRAME_SIZE).contains(&size) {
            return Err(invalid(format!("bad frame size {size}")));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame_type = src.get_u32();
        let data = src.split_to(size - 4).freeze();
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => decode_message(data).map(|msg| Some(Frame::Message(msg))),
            other => Err(invalid(format!("unknown frame type {other}"))),
        }
    }
}

fn decode_message(mut data: Bytes) -> io::Result<RawMessage> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(invalid(format!("message frame too short ({} bytes)", data.len())));
    }
    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let id = MessageId::from_slice(&data.split_to(MessageId::LEN))
        .ok_or_else(|| invalid("bad message id"))?;
    Ok(RawMessage {
        timestamp,
        attempts,
        id,
        body: data,
    })
}
