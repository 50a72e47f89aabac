//! Method frames of the connection, channel, exchange, queue and basic classes.
//!
//! Only the methods needed to publish and consume are modelled. Any other
//! method decodes to [`Method::Unknown`] with its arguments left raw.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{bit, pack_bits, put_long_bytes, put_short_str, Reader};

pub mod class {
    pub const CONNECTION: u16 = 10;
    pub const CHANNEL: u16 = 20;
    pub const EXCHANGE: u16 = 40;
    pub const QUEUE: u16 = 50;
    pub const BASIC: u16 = 60;
}

/// A decoded method with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: Bytes,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: Bytes,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        vhost: String,
    },
    ConnectionOpenOk,
    ConnectionClose(CloseArgs),
    ConnectionCloseOk,
    ChannelOpen,
    ChannelOpenOk,
    ChannelClose(CloseArgs),
    ChannelCloseOk,
    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
    },
    ExchangeDeclareOk,
    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
    },
    QueueBindOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    Unknown {
        class_id: u16,
        method_id: u16,
        arguments: Bytes,
    },
}

/// Arguments of `connection.close` and `channel.close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseArgs {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseArgs {
    /// A close initiated by us with no failing method.
    #[must_use]
    pub fn normal() -> Self {
        Self {
            reply_code: 200,
            reply_text: "Goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        }
    }

    fn read(r: &mut Reader) -> io::Result<Self> {
        Ok(Self {
            reply_code: r.u16()?,
            reply_text: r.short_str()?,
            class_id: r.u16()?,
            method_id: r.u16()?,
        })
    }

    fn write(&self, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_u16(self.reply_code);
        put_short_str(dst, &self.reply_text)?;
        dst.put_u16(self.class_id);
        dst.put_u16(self.method_id);
        Ok(())
    }
}

impl Method {
    /// `(class_id, method_id)` of this method.
    #[must_use]
    pub fn id(&self) -> (u16, u16) {
        use class::{BASIC, CHANNEL, CONNECTION, EXCHANGE, QUEUE};
        match self {
            Self::ConnectionStart { .. } => (CONNECTION, 10),
            Self::ConnectionStartOk { .. } => (CONNECTION, 11),
            Self::ConnectionTune { .. } => (CONNECTION, 30),
            Self::ConnectionTuneOk { .. } => (CONNECTION, 31),
            Self::ConnectionOpen { .. } => (CONNECTION, 40),
            Self::ConnectionOpenOk => (CONNECTION, 41),
            Self::ConnectionClose(_) => (CONNECTION, 50),
            Self::ConnectionCloseOk => (CONNECTION, 51),
            Self::ChannelOpen => (CHANNEL, 10),
            Self::ChannelOpenOk => (CHANNEL, 11),
            Self::ChannelClose(_) => (CHANNEL, 40),
            Self::ChannelCloseOk => (CHANNEL, 41),
            Self::ExchangeDeclare { .. } => (EXCHANGE, 10),
            Self::ExchangeDeclareOk => (EXCHANGE, 11),
            Self::QueueDeclare { .. } => (QUEUE, 10),
            Self::QueueDeclareOk { .. } => (QUEUE, 11),
            Self::QueueBind { .. } => (QUEUE, 20),
            Self::QueueBindOk => (QUEUE, 21),
            Self::BasicConsume { .. } => (BASIC, 20),
            Self::BasicConsumeOk { .. } => (BASIC, 21),
            Self::BasicPublish { .. } => (BASIC, 40),
            Self::BasicDeliver { .. } => (BASIC, 60),
            Self::Unknown {
                class_id,
                method_id,
                ..
            } => (*class_id, *method_id),
        }
    }

    /// Short dotted name for logs, e.g. `queue.declare-ok`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStart { .. } => "connection.start",
            Self::ConnectionStartOk { .. } => "connection.start-ok",
            Self::ConnectionTune { .. } => "connection.tune",
            Self::ConnectionTuneOk { .. } => "connection.tune-ok",
            Self::ConnectionOpen { .. } => "connection.open",
            Self::ConnectionOpenOk => "connection.open-ok",
            Self::ConnectionClose(_) => "connection.close",
            Self::ConnectionCloseOk => "connection.close-ok",
            Self::ChannelOpen => "channel.open",
            Self::ChannelOpenOk => "channel.open-ok",
            Self::ChannelClose(_) => "channel.close",
            Self::ChannelCloseOk => "channel.close-ok",
            Self::ExchangeDeclare { .. } => "exchange.declare",
            Self::ExchangeDeclareOk => "exchange.declare-ok",
            Self::QueueDeclare { .. } => "queue.declare",
            Self::QueueDeclareOk { .. } => "queue.declare-ok",
            Self::QueueBind { .. } => "queue.bind",
            Self::QueueBindOk => "queue.bind-ok",
            Self::BasicConsume { .. } => "basic.consume",
            Self::BasicConsumeOk { .. } => "basic.consume-ok",
            Self::BasicPublish { .. } => "basic.publish",
            Self::BasicDeliver { .. } => "basic.deliver",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Decode a method frame payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the arguments are truncated or malformed.
    pub fn decode(payload: Bytes) -> io::Result<Self> {
        let mut r = Reader::new(payload);
        let class_id = r.u16()?;
        let method_id = r.u16()?;

        let method = match (class_id, method_id) {
            (class::CONNECTION, 10) => Self::ConnectionStart {
                version_major: r.u8()?,
                version_minor: r.u8()?,
                server_properties: r.table()?,
                mechanisms: r.long_str()?,
                locales: r.long_str()?,
            },
            (class::CONNECTION, 11) => Self::ConnectionStartOk {
                client_properties: r.table()?,
                mechanism: r.short_str()?,
                response: r.long_bytes()?,
                locale: r.short_str()?,
            },
            (class::CONNECTION, 30) => Self::ConnectionTune {
                channel_max: r.u16()?,
                frame_max: r.u32()?,
                heartbeat: r.u16()?,
            },
            (class::CONNECTION, 31) => Self::ConnectionTuneOk {
                channel_max: r.u16()?,
                frame_max: r.u32()?,
                heartbeat: r.u16()?,
            },
            (class::CONNECTION, 40) => {
                let vhost = r.short_str()?;
                let _capabilities = r.short_str()?;
                let _insist = r.u8()?;
                Self::ConnectionOpen { vhost }
            }
            (class::CONNECTION, 41) => Self::ConnectionOpenOk,
            (class::CONNECTION, 50) => Self::ConnectionClose(CloseArgs::read(&mut r)?),
            (class::CONNECTION, 51) => Self::ConnectionCloseOk,
            (class::CHANNEL, 10) => Self::ChannelOpen,
            (class::CHANNEL, 11) => Self::ChannelOpenOk,
            (class::CHANNEL, 40) => Self::ChannelClose(CloseArgs::read(&mut r)?),
            (class::CHANNEL, 41) => Self::ChannelCloseOk,
            (class::EXCHANGE, 10) => {
                let _ticket = r.u16()?;
                let exchange = r.short_str()?;
                let kind = r.short_str()?;
                let flags = r.u8()?;
                let _arguments = r.table()?;
                Self::ExchangeDeclare {
                    exchange,
                    kind,
                    passive: bit(flags, 0),
                    durable: bit(flags, 1),
                    auto_delete: bit(flags, 2),
                    internal: bit(flags, 3),
                    no_wait: bit(flags, 4),
                }
            }
            (class::EXCHANGE, 11) => Self::ExchangeDeclareOk,
            (class::QUEUE, 10) => {
                let _ticket = r.u16()?;
                let queue = r.short_str()?;
                let flags = r.u8()?;
                let _arguments = r.table()?;
                Self::QueueDeclare {
                    queue,
                    passive: bit(flags, 0),
                    durable: bit(flags, 1),
                    exclusive: bit(flags, 2),
                    auto_delete: bit(flags, 3),
                    no_wait: bit(flags, 4),
                }
            }
            (class::QUEUE, 11) => Self::QueueDeclareOk {
                queue: r.short_str()?,
                message_count: r.u32()?,
                consumer_count: r.u32()?,
            },
            (class::QUEUE, 20) => {
                let _ticket = r.u16()?;
                let queue = r.short_str()?;
                let exchange = r.short_str()?;
                let routing_key = r.short_str()?;
                let flags = r.u8()?;
                let _arguments = r.table()?;
                Self::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait: bit(flags, 0),
                }
            }
            (class::QUEUE, 21) => Self::QueueBindOk,
            (class::BASIC, 20) => {
                let _ticket = r.u16()?;
                let queue = r.short_str()?;
                let consumer_tag = r.short_str()?;
                let flags = r.u8()?;
                let _arguments = r.table()?;
                Self::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local: bit(flags, 0),
                    no_ack: bit(flags, 1),
                    exclusive: bit(flags, 2),
                    no_wait: bit(flags, 3),
                }
            }
            (class::BASIC, 21) => Self::BasicConsumeOk {
                consumer_tag: r.short_str()?,
            },
            (class::BASIC, 40) => {
                let _ticket = r.u16()?;
                let exchange = r.short_str()?;
                let routing_key = r.short_str()?;
                let flags = r.u8()?;
                Self::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bit(flags, 0),
                    immediate: bit(flags, 1),
                }
            }
            (class::BASIC, 60) => {
                let consumer_tag = r.short_str()?;
                let delivery_tag = r.u64()?;
                let redelivered = bit(r.u8()?, 0);
                Self::BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered,
                    exchange: r.short_str()?,
                    routing_key: r.short_str()?,
                }
            }
            _ => Self::Unknown {
                class_id,
                method_id,
                arguments: r.rest(),
            },
        };

        Ok(method)
    }

    /// Encode class id, method id and arguments into `dst`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a short string exceeds 255 bytes.
    pub fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        let (class_id, method_id) = self.id();
        dst.put_u16(class_id);
        dst.put_u16(method_id);

        match self {
            Self::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                put_long_bytes(dst, server_properties)?;
                put_long_bytes(dst, mechanisms.as_bytes())?;
                put_long_bytes(dst, locales.as_bytes())?;
            }
            Self::ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                put_long_bytes(dst, client_properties)?;
                put_short_str(dst, mechanism)?;
                put_long_bytes(dst, response)?;
                put_short_str(dst, locale)?;
            }
            Self::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | Self::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            Self::ConnectionOpen { vhost } => {
                put_short_str(dst, vhost)?;
                put_short_str(dst, "")?;
                dst.put_u8(0);
            }
            Self::ConnectionOpenOk => put_short_str(dst, "")?,
            Self::ConnectionClose(args) | Self::ChannelClose(args) => args.write(dst)?,
            Self::ChannelOpen => put_short_str(dst, "")?,
            Self::ChannelOpenOk => put_long_bytes(dst, &[])?,
            Self::ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
            } => {
                dst.put_u16(0);
                put_short_str(dst, exchange)?;
                put_short_str(dst, kind)?;
                dst.put_u8(pack_bits(&[*passive, *durable, *auto_delete, *internal, *no_wait]));
                put_long_bytes(dst, &[])?;
            }
            Self::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
            } => {
                dst.put_u16(0);
                put_short_str(dst, queue)?;
                dst.put_u8(pack_bits(&[*passive, *durable, *exclusive, *auto_delete, *no_wait]));
                put_long_bytes(dst, &[])?;
            }
            Self::QueueDeclareOk {
                queue,
                message_count,
                consumer_count,
            } => {
                put_short_str(dst, queue)?;
                dst.put_u32(*message_count);
                dst.put_u32(*consumer_count);
            }
            Self::QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
            } => {
                dst.put_u16(0);
                put_short_str(dst, queue)?;
                put_short_str(dst, exchange)?;
                put_short_str(dst, routing_key)?;
                dst.put_u8(pack_bits(&[*no_wait]));
                put_long_bytes(dst, &[])?;
            }
            Self::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
            } => {
                dst.put_u16(0);
                put_short_str(dst, queue)?;
                put_short_str(dst, consumer_tag)?;
                dst.put_u8(pack_bits(&[*no_local, *no_ack, *exclusive, *no_wait]));
                put_long_bytes(dst, &[])?;
            }
            Self::BasicConsumeOk { consumer_tag } => put_short_str(dst, consumer_tag)?,
            Self::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                dst.put_u16(0);
                put_short_str(dst, exchange)?;
                put_short_str(dst, routing_key)?;
                dst.put_u8(pack_bits(&[*mandatory, *immediate]));
            }
            Self::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                put_short_str(dst, consumer_tag)?;
                dst.put_u64(*delivery_tag);
                dst.put_u8(pack_bits(&[*redelivered]));
                put_short_str(dst, exchange)?;
                put_short_str(dst, routing_key)?;
            }
            Self::ConnectionCloseOk
            | Self::ChannelCloseOk
            | Self::ExchangeDeclareOk
            | Self::QueueBindOk => {}
            Self::Unknown { arguments, .. } => dst.extend_from_slice(arguments),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reencode(method: &Method) -> Method {
        let mut buf = BytesMut::new();
        method.encode(&mut buf).unwrap();
        Method::decode(buf.freeze()).unwrap()
    }

    #[test]
    fn test_queue_declare_flags() {
        let method = Method::QueueDeclare {
            queue: String::new(),
            passive: false,
            durable: false,
            exclusive: true,
            auto_delete: true,
            no_wait: false,
        };
        let mut buf = BytesMut::new();
        method.encode(&mut buf).unwrap();
        // class, method, ticket, empty shortstr, then flags
        assert_eq!(&buf[..7], &[0, 50, 0, 10, 0, 0, 0]);
        assert_eq!(buf[7], 0b0_1100);
        assert_eq!(reencode(&method), method);
    }

    #[test]
    fn test_deliver_decodes() {
        let method = Method::BasicDeliver {
            consumer_tag: "ctag-1".to_string(),
            delivery_tag: 42,
            redelivered: true,
            exchange: "checks".to_string(),
            routing_key: "check_results".to_string(),
        };
        assert_eq!(reencode(&method), method);
        assert_eq!(method.id(), (60, 60));
    }

    #[test]
    fn test_close_args() {
        let method = Method::ChannelClose(CloseArgs {
            reply_code: 404,
            reply_text: "NOT_FOUND - no exchange".to_string(),
            class_id: 40,
            method_id: 10,
        });
        assert_eq!(reencode(&method), method);
    }

    #[test]
    fn test_unknown_method_is_kept() {
        let payload = Bytes::from_static(&[0, 60, 0, 80, 1, 2, 3]);
        let method = Method::decode(payload).unwrap();
        assert_eq!(
            method,
            Method::Unknown {
                class_id: 60,
                method_id: 80,
                arguments: Bytes::from_static(&[1, 2, 3]),
            }
        );
    }

    #[test]
    fn test_truncated_arguments_rejected() {
        // connection.tune with only the channel-max field
        let payload = Bytes::from_static(&[0, 10, 0, 30, 0, 0]);
        assert!(Method::decode(payload).is_err());
    }
}
