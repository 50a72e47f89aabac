//! The subset of AMQP 0-9-1 the relay speaks.
//!
//! Covers the connection handshake, channel open/close, exchange and queue
//! declaration, queue binding, `basic.consume`, `basic.publish` and content
//! delivery as header and body frames.

pub mod codec;
pub mod frame;
pub mod method;
mod wire;

pub use codec::AmqpCodec;
pub use frame::{BasicProperties, ContentHeader, Frame};
pub use method::{class, CloseArgs, Method};

/// Sent by the client before any frame.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Largest frame we negotiate, including the 8 bytes of framing.
pub const FRAME_MAX: u32 = 131_072;

/// Framing overhead of a body frame: header plus end marker.
pub const FRAME_OVERHEAD: u32 = 8;

/// Channel used for all traffic after the handshake.
pub const CHANNEL: u16 = 1;

/// Content type accepted on consume and set on publish.
pub const CONTENT_TYPE_JSON: &str = "application/json";
