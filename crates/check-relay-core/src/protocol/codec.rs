//! AMQP frame codec.
//!
//! Implements tokio's `Decoder` and `Encoder` traits for AMQP 0-9-1 frames:
//!
//! - 1 byte: frame type
//! - 2 bytes: channel (big-endian)
//! - 4 bytes: payload size (big-endian)
//! - N bytes: payload
//! - 1 byte: frame end marker (0xCE)

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{ContentHeader, Frame};
use super::method::Method;
use super::wire::invalid_data;
use super::FRAME_MAX;

const FRAME_METHOD: u8 = 1;
const FRAME_HEADER: u8 = 2;
const FRAME_BODY: u8 = 3;
const FRAME_HEARTBEAT: u8 = 8;
const FRAME_END: u8 = 0xCE;

/// Type, channel and size.
const FRAME_HEADER_LEN: usize = 7;

/// Codec for AMQP frames.
#[derive(Debug, Clone)]
pub struct AmqpCodec {
    max_frame_size: usize,
}

impl AmqpCodec {
    /// Create a new codec accepting payloads up to [`FRAME_MAX`] bytes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: FRAME_MAX as usize,
        }
    }

    /// Create a new codec with custom max payload size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for AmqpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AmqpCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let frame_type = src[0];
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

        if size > self.max_frame_size {
            return Err(invalid_data(format!(
                "frame size {size} exceeds maximum {}",
                self.max_frame_size
            )));
        }

        let total = FRAME_HEADER_LEN + size + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        if src[total - 1] != FRAME_END {
            return Err(invalid_data(format!(
                "bad frame end marker 0x{:02x}",
                src[total - 1]
            )));
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(size).freeze();
        src.advance(1);

        let frame = match frame_type {
            FRAME_METHOD => Frame::Method {
                channel,
                method: Method::decode(payload)?,
            },
            FRAME_HEADER => match ContentHeader::decode(payload) {
                Ok(header) => Frame::Header { channel, header },
                Err(e) => Frame::MalformedHeader {
                    channel,
                    reason: e.to_string(),
                },
            },
            FRAME_BODY => Frame::Body { channel, payload },
            FRAME_HEARTBEAT => Frame::Heartbeat,
            other => return Err(invalid_data(format!("unknown frame type {other}"))),
        };

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for AmqpCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.reserve(FRAME_HEADER_LEN + 1);

        let (frame_type, channel) = match &item {
            Frame::Method { channel, .. } => (FRAME_METHOD, *channel),
            Frame::Header { channel, .. } | Frame::MalformedHeader { channel, .. } => {
                (FRAME_HEADER, *channel)
            }
            Frame::Body { channel, .. } => (FRAME_BODY, *channel),
            Frame::Heartbeat => (FRAME_HEARTBEAT, 0),
        };
        dst.put_u8(frame_type);
        dst.put_u16(channel);
        // Size is patched in once the payload is written.
        dst.put_u32(0);

        let written = match &item {
            Frame::Method { method, .. } => method.encode(dst),
            Frame::Header { header, .. } => header.encode(dst),
            Frame::MalformedHeader { reason, .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot encode malformed content header ({reason})"),
            )),
            Frame::Body { payload, .. } => {
                dst.extend_from_slice(payload);
                Ok(())
            }
            Frame::Heartbeat => Ok(()),
        };
        if let Err(e) = written {
            dst.truncate(start);
            return Err(e);
        }

        let size = dst.len() - start - FRAME_HEADER_LEN;
        if size > self.max_frame_size {
            dst.truncate(start);
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame size {size} exceeds maximum {}", self.max_frame_size),
            ));
        }
        dst[start + 3..start + FRAME_HEADER_LEN].copy_from_slice(&(size as u32).to_be_bytes());
        dst.put_u8(FRAME_END);

        Ok(())
    }
}
