//! Frames and content headers.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use super::method::{class, Method};
use super::wire::{invalid_data, put_long_bytes, put_short_str, Reader};

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Method { channel: u16, method: Method },
    Header { channel: u16, header: ContentHeader },
    /// A content header frame whose payload could not be parsed. Kept as a
    /// frame so the stream stays usable and the message alone is dropped.
    MalformedHeader { channel: u16, reason: String },
    Body { channel: u16, payload: Bytes },
    Heartbeat,
}

impl Frame {
    #[must_use]
    pub fn method(channel: u16, method: Method) -> Self {
        Self::Method { channel, method }
    }

    #[must_use]
    pub fn channel(&self) -> u16 {
        match self {
            Self::Method { channel, .. }
            | Self::Header { channel, .. }
            | Self::MalformedHeader { channel, .. }
            | Self::Body { channel, .. } => *channel,
            Self::Heartbeat => 0,
        }
    }

    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Method { method, .. } => format!("method {}", method.name()),
            Self::Header { header, .. } => format!("content header ({} bytes)", header.body_size),
            Self::MalformedHeader { reason, .. } => format!("malformed content header ({reason})"),
            Self::Body { payload, .. } => format!("body ({} bytes)", payload.len()),
            Self::Heartbeat => "heartbeat".to_string(),
        }
    }
}

/// The content header that precedes a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    #[must_use]
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: class::BASIC,
            body_size,
            properties,
        }
    }

    pub(crate) fn decode(payload: Bytes) -> io::Result<Self> {
        let mut r = Reader::new(payload);
        let class_id = r.u16()?;
        let _weight = r.u16()?;
        let body_size = r.u64()?;
        let properties = BasicProperties::read(&mut r)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_u16(self.class_id);
        dst.put_u16(0);
        dst.put_u64(self.body_size);
        self.properties.write(dst)
    }
}

/// Message properties of the basic class.
///
/// `headers` is kept as the raw field table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<Bytes>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

mod flag {
    pub const CONTENT_TYPE: u16 = 1 << 15;
    pub const CONTENT_ENCODING: u16 = 1 << 14;
    pub const HEADERS: u16 = 1 << 13;
    pub const DELIVERY_MODE: u16 = 1 << 12;
    pub const PRIORITY: u16 = 1 << 11;
    pub const CORRELATION_ID: u16 = 1 << 10;
    pub const REPLY_TO: u16 = 1 << 9;
    pub const EXPIRATION: u16 = 1 << 8;
    pub const MESSAGE_ID: u16 = 1 << 7;
    pub const TIMESTAMP: u16 = 1 << 6;
    pub const TYPE: u16 = 1 << 5;
    pub const USER_ID: u16 = 1 << 4;
    pub const APP_ID: u16 = 1 << 3;
    pub const CLUSTER_ID: u16 = 1 << 2;
    /// More flag words follow; not used by the basic class.
    pub const CONTINUATION: u16 = 1;
}

impl BasicProperties {
    fn read(r: &mut Reader) -> io::Result<Self> {
        let flags = r.u16()?;
        if flags & flag::CONTINUATION != 0 {
            return Err(invalid_data("property flag continuation is not supported"));
        }

        let short = |f: u16, r: &mut Reader| -> io::Result<Option<String>> {
            if flags & f != 0 {
                r.short_str().map(Some)
            } else {
                Ok(None)
            }
        };

        let content_type = short(flag::CONTENT_TYPE, r)?;
        let content_encoding = short(flag::CONTENT_ENCODING, r)?;
        let headers = if flags & flag::HEADERS != 0 {
            Some(r.table()?)
        } else {
            None
        };
        let delivery_mode = if flags & flag::DELIVERY_MODE != 0 {
            Some(r.u8()?)
        } else {
            None
        };
        let priority = if flags & flag::PRIORITY != 0 {
            Some(r.u8()?)
        } else {
            None
        };
        let correlation_id = short(flag::CORRELATION_ID, r)?;
        let reply_to = short(flag::REPLY_TO, r)?;
        let expiration = short(flag::EXPIRATION, r)?;
        let message_id = short(flag::MESSAGE_ID, r)?;
        let timestamp = if flags & flag::TIMESTAMP != 0 {
            Some(r.u64()?)
        } else {
            None
        };
        let kind = short(flag::TYPE, r)?;
        let user_id = short(flag::USER_ID, r)?;
        let app_id = short(flag::APP_ID, r)?;
        let cluster_id = short(flag::CLUSTER_ID, r)?;

        Ok(Self {
            content_type,
            content_encoding,
            headers,
            delivery_mode,
            priority,
            correlation_id,
            reply_to,
            expiration,
            message_id,
            timestamp,
            kind,
            user_id,
            app_id,
            cluster_id,
        })
    }

    fn flags(&self) -> u16 {
        [
            (self.content_type.is_some(), flag::CONTENT_TYPE),
            (self.content_encoding.is_some(), flag::CONTENT_ENCODING),
            (self.headers.is_some(), flag::HEADERS),
            (self.delivery_mode.is_some(), flag::DELIVERY_MODE),
            (self.priority.is_some(), flag::PRIORITY),
            (self.correlation_id.is_some(), flag::CORRELATION_ID),
            (self.reply_to.is_some(), flag::REPLY_TO),
            (self.expiration.is_some(), flag::EXPIRATION),
            (self.message_id.is_some(), flag::MESSAGE_ID),
            (self.timestamp.is_some(), flag::TIMESTAMP),
            (self.kind.is_some(), flag::TYPE),
            (self.user_id.is_some(), flag::USER_ID),
            (self.app_id.is_some(), flag::APP_ID),
            (self.cluster_id.is_some(), flag::CLUSTER_ID),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, f)| acc | f)
    }

    fn write(&self, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_u16(self.flags());

        let short = |dst: &mut BytesMut, value: &Option<String>| match value {
            Some(v) => put_short_str(dst, v),
            None => Ok(()),
        };

        short(dst, &self.content_type)?;
        short(dst, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            put_long_bytes(dst, headers)?;
        }
        if let Some(mode) = self.delivery_mode {
            dst.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            dst.put_u8(priority);
        }
        short(dst, &self.correlation_id)?;
        short(dst, &self.reply_to)?;
        short(dst, &self.expiration)?;
        short(dst, &self.message_id)?;
        if let Some(ts) = self.timestamp {
            dst.put_u64(ts);
        }
        short(dst, &self.kind)?;
        short(dst, &self.user_id)?;
        short(dst, &self.app_id)?;
        short(dst, &self.cluster_id)?;
        Ok(())
    }
}
