//! Single broker connection.
//!
//! Owns one TCP connection speaking AMQP 0-9-1 with a single channel. The
//! connect sequence is socket, login, channel open and exchange declare; the
//! consumer role adds queue declare, queue bind and `basic.consume`. A failure
//! at any step tears down whatever was opened before the error is returned.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionDescriptor, QueueBinding};
use crate::error::{CloseScope, RelayError, Result, Step};
use crate::protocol::{
    AmqpCodec, CloseArgs, Frame, Method, CHANNEL, FRAME_MAX, FRAME_OVERHEAD,
    PROTOCOL_HEADER,
};

use super::publisher::MessageEnvelope;

/// Upper bound on the close handshake while tearing down a failed connection.
const ABORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Log at info when the connection's debug flag is set, otherwise at debug.
macro_rules! milestone {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// A connection to the broker with channel 1 open and the exchange declared.
pub struct BrokerConnection {
    framed: Framed<TcpStream, AmqpCodec>,
    address: String,
    exchange: String,
    frame_max: u32,
    rpc_timeout: Duration,
    debug: bool,
    channel_open: bool,
    queue: Option<String>,
    consumer_tag: Option<String>,
}

impl BrokerConnection {
    /// Open a connection and declare the descriptor's exchange.
    ///
    /// # Errors
    ///
    /// Returns an error tagged with the failing step: `socket` for connect
    /// and write failures, `login` for the handshake, then `channel_open`
    /// and `exchange_declare`. Broker close replies are reported as
    /// [`RelayError::BrokerReply`].
    #[instrument(skip(desc), fields(address = %desc.address(), vhost = %desc.vhost, exchange = %desc.exchange))]
    pub async fn connect(desc: &ConnectionDescriptor) -> Result<Self> {
        let mut conn = Self::open_socket(desc).await?;

        if let Err(e) = conn.setup(desc).await {
            warn!(step = ?e.step().map(|s| s.as_str()), error = %e, "broker connect failed");
            conn.abort(&e).await;
            return Err(e);
        }

        milestone!(desc.debug, frame_max = conn.frame_max, "connected to broker");
        Ok(conn)
    }

    /// Open a connection and start consuming from the bound queue.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect), plus `queue_declare`, `queue_bind`
    /// and `basic_consume` failures.
    #[instrument(skip(desc, binding), fields(address = %desc.address(), queue = ?binding.queue))]
    pub async fn connect_consumer(
        desc: &ConnectionDescriptor,
        binding: &QueueBinding,
    ) -> Result<Self> {
        let mut conn = Self::connect(desc).await?;

        if let Err(e) = conn.start_consuming(binding).await {
            warn!(step = ?e.step().map(|s| s.as_str()), error = %e, "consumer setup failed");
            conn.abort(&e).await;
            return Err(e);
        }

        Ok(conn)
    }

    async fn open_socket(desc: &ConnectionDescriptor) -> Result<Self> {
        let connect = TcpStream::connect((desc.host.as_str(), desc.port));
        let mut stream = match timeout(desc.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to connect to broker");
                return Err(RelayError::transport(Step::Socket, e));
            }
            Err(_) => {
                warn!("connection timeout");
                return Err(RelayError::transport(
                    Step::Socket,
                    io::Error::new(io::ErrorKind::TimedOut, "connection timeout"),
                ));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        stream
            .write_all(PROTOCOL_HEADER)
            .await
            .map_err(|e| RelayError::transport(Step::Socket, e))?;

        debug!("TCP connection established");

        Ok(Self {
            framed: Framed::new(stream, AmqpCodec::new()),
            address: desc.address(),
            exchange: desc.exchange.clone(),
            frame_max: FRAME_MAX,
            rpc_timeout: desc.rpc_timeout,
            debug: desc.debug,
            channel_open: false,
            queue: None,
            consumer_tag: None,
        })
    }

    async fn setup(&mut self, desc: &ConnectionDescriptor) -> Result<()> {
        self.login(desc).await?;
        milestone!(self.debug, user = %desc.user, "logged in");

        self.send(Step::ChannelOpen, CHANNEL, Method::ChannelOpen)
            .await?;
        self.expect(Step::ChannelOpen, CHANNEL, |m| {
            matches!(m, Method::ChannelOpenOk)
        })
        .await?;
        self.channel_open = true;
        milestone!(self.debug, channel = CHANNEL, "channel opened");

        self.send(
            Step::ExchangeDeclare,
            CHANNEL,
            Method::ExchangeDeclare {
                exchange: desc.exchange.clone(),
                kind: desc.exchange_kind.clone(),
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                no_wait: false,
            },
        )
        .await?;
        self.expect(Step::ExchangeDeclare, CHANNEL, |m| {
            matches!(m, Method::ExchangeDeclareOk)
        })
        .await?;
        milestone!(
            self.debug,
            exchange = %desc.exchange,
            kind = %desc.exchange_kind,
            "exchange declared"
        );

        Ok(())
    }

    /// Start/StartOk with SASL PLAIN, Tune/TuneOk and Open/OpenOk.
    async fn login(&mut self, desc: &ConnectionDescriptor) -> Result<()> {
        let start = self
            .expect(Step::Login, 0, |m| matches!(m, Method::ConnectionStart { .. }))
            .await?;
        if let Method::ConnectionStart { mechanisms, .. } = &start {
            if !mechanisms.split_whitespace().any(|m| m == "PLAIN") {
                return Err(RelayError::protocol(
                    Step::Login,
                    format!("broker does not offer PLAIN authentication (offers: {mechanisms})"),
                ));
            }
        }

        let response = format!("\0{}\0{}", desc.user, desc.password);
        self.send(
            Step::Login,
            0,
            Method::ConnectionStartOk {
                client_properties: Bytes::new(),
                mechanism: "PLAIN".to_string(),
                response: Bytes::from(response),
                locale: "en_US".to_string(),
            },
        )
        .await?;

        let tune = self
            .expect(Step::Login, 0, |m| matches!(m, Method::ConnectionTune { .. }))
            .await?;
        let (channel_max, server_frame_max) = match tune {
            Method::ConnectionTune {
                channel_max,
                frame_max,
                ..
            } => (channel_max, frame_max),
            _ => (0, 0),
        };
        self.frame_max = negotiate_frame_max(server_frame_max);
        *self.framed.codec_mut() = AmqpCodec::with_max_frame_size(self.frame_max as usize);

        self.send(
            Step::Login,
            0,
            Method::ConnectionTuneOk {
                channel_max,
                frame_max: self.frame_max,
                heartbeat: 0,
            },
        )
        .await?;

        self.send(
            Step::Login,
            0,
            Method::ConnectionOpen {
                vhost: desc.vhost.clone(),
            },
        )
        .await?;
        self.expect(Step::Login, 0, |m| matches!(m, Method::ConnectionOpenOk))
            .await?;

        Ok(())
    }

    async fn start_consuming(&mut self, binding: &QueueBinding) -> Result<()> {
        let named = binding.queue.is_some();
        self.send(
            Step::QueueDeclare,
            CHANNEL,
            Method::QueueDeclare {
                queue: binding.queue.clone().unwrap_or_default(),
                passive: false,
                durable: named,
                exclusive: !named,
                auto_delete: !named,
                no_wait: false,
            },
        )
        .await?;
        let declared = self
            .expect(Step::QueueDeclare, CHANNEL, |m| {
                matches!(m, Method::QueueDeclareOk { .. })
            })
            .await?;
        let queue = match declared {
            Method::QueueDeclareOk { queue, .. } => queue,
            _ => String::new(),
        };
        milestone!(self.debug, queue = %queue, "queue declared");

        self.send(
            Step::QueueBind,
            CHANNEL,
            Method::QueueBind {
                queue: queue.clone(),
                exchange: self.exchange.clone(),
                routing_key: binding.binding_key.clone(),
                no_wait: false,
            },
        )
        .await?;
        self.expect(Step::QueueBind, CHANNEL, |m| matches!(m, Method::QueueBindOk))
            .await?;
        milestone!(
            self.debug,
            queue = %queue,
            binding_key = %binding.binding_key,
            "queue bound"
        );

        self.send(
            Step::BasicConsume,
            CHANNEL,
            Method::BasicConsume {
                queue: queue.clone(),
                consumer_tag: String::new(),
                no_local: false,
                no_ack: true,
                exclusive: false,
                no_wait: false,
            },
        )
        .await?;
        let consume_ok = self
            .expect(Step::BasicConsume, CHANNEL, |m| {
                matches!(m, Method::BasicConsumeOk { .. })
            })
            .await?;
        if let Method::BasicConsumeOk { consumer_tag } = consume_ok {
            milestone!(self.debug, consumer_tag = %consumer_tag, "consuming");
            self.consumer_tag = Some(consumer_tag);
        }
        self.queue = Some(queue);

        Ok(())
    }

    /// Broker address this connection was opened to.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Negotiated maximum frame size, framing included.
    #[must_use]
    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    /// Name of the consumed queue, once consuming.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Tag the broker assigned to our consumer, once consuming.
    #[must_use]
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    pub(crate) fn is_debug(&self) -> bool {
        self.debug
    }

    pub(crate) fn frames_mut(&mut self) -> &mut Framed<TcpStream, AmqpCodec> {
        &mut self.framed
    }

    /// Publish one message to the connection's exchange.
    ///
    /// Sends `basic.publish`, the content header and as many body frames as
    /// the negotiated frame size requires.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BrokerReply`] if the broker has closed the
    /// connection or channel, [`RelayError::Publish`] if the frames could not
    /// be written. The caller decides whether to disconnect.
    pub async fn publish(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        self.drain_incoming(Step::Publish).await?;

        let frames = envelope.to_frames(&self.exchange, self.frame_max)?;
        let frame_count = frames.len();
        for frame in frames {
            self.framed
                .feed(frame)
                .await
                .map_err(|e| RelayError::Publish {
                    message: e.to_string(),
                })?;
        }
        self.framed.flush().await.map_err(|e| RelayError::Publish {
            message: e.to_string(),
        })?;

        debug!(
            correlation_id = %envelope.correlation_id,
            routing_key = %envelope.routing_key,
            bytes = envelope.body.len(),
            frames = frame_count,
            "message published"
        );

        self.drain_incoming(Step::Publish).await
    }

    /// Consume frames that are already buffered without waiting for more.
    ///
    /// A broker close or end of stream among them is returned as an error.
    async fn drain_incoming(&mut self, step: Step) -> Result<()> {
        while let Some(next) = self.framed.next().now_or_never() {
            match next {
                None => return Err(RelayError::eof(step)),
                Some(Err(e)) => return Err(RelayError::from_read(step, e)),
                Some(Ok(frame)) => {
                    if let Some(err) = close_error(step, &frame) {
                        return Err(err);
                    }
                    debug!(frame = %frame.describe(), "ignoring frame on publisher connection");
                }
            }
        }
        Ok(())
    }

    /// Wait until the broker closes the connection or the transport fails.
    ///
    /// Frames other than a close are discarded. Cancel-safe.
    pub async fn closed(&mut self) -> RelayError {
        loop {
            match self.framed.next().await {
                None => return RelayError::eof(Step::Publish),
                Some(Err(e)) => return RelayError::from_read(Step::Publish, e),
                Some(Ok(frame)) => {
                    if let Some(err) = close_error(Step::Publish, &frame) {
                        return err;
                    }
                    debug!(frame = %frame.describe(), "ignoring frame on idle connection");
                }
            }
        }
    }

    /// Close the channel and the connection in order.
    ///
    /// The transport is shut down whether or not the close handshake
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first close step that failed.
    pub async fn disconnect(mut self) -> Result<()> {
        let result = self.close_handshake().await;
        self.shutdown_transport().await;

        match &result {
            Ok(()) => milestone!(self.debug, address = %self.address, "disconnected from broker"),
            Err(e) => warn!(address = %self.address, error = %e, "unclean disconnect from broker"),
        }
        result
    }

    /// Tear down after `cause` was observed on this connection.
    ///
    /// Acknowledges a broker-initiated close, makes a bounded attempt at
    /// closing whatever is still open and always drops the transport.
    pub async fn abort(mut self, cause: &RelayError) {
        match timeout(ABORT_CLOSE_TIMEOUT, self.teardown(cause)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "close during teardown failed"),
            Err(_) => debug!("close during teardown timed out"),
        }
        self.shutdown_transport().await;
        debug!(address = %self.address, cause = %cause, "connection torn down");
    }

    async fn teardown(&mut self, cause: &RelayError) -> Result<()> {
        match cause {
            // The socket is unusable; nothing left to say to the broker.
            RelayError::Transport { .. } => Ok(()),
            RelayError::BrokerReply { reply, .. } if reply.scope == CloseScope::Connection => {
                self.send(Step::ConnectionClose, 0, Method::ConnectionCloseOk)
                    .await
            }
            RelayError::BrokerReply { .. } => {
                self.channel_open = false;
                self.send(Step::ChannelClose, CHANNEL, Method::ChannelCloseOk)
                    .await?;
                self.close_handshake().await
            }
            _ => self.close_handshake().await,
        }
    }

    async fn close_handshake(&mut self) -> Result<()> {
        if self.channel_open {
            self.send(
                Step::ChannelClose,
                CHANNEL,
                Method::ChannelClose(CloseArgs::normal()),
            )
            .await?;
            self.expect(Step::ChannelClose, CHANNEL, |m| {
                matches!(m, Method::ChannelCloseOk)
            })
            .await?;
            self.channel_open = false;
        }

        self.send(
            Step::ConnectionClose,
            0,
            Method::ConnectionClose(CloseArgs::normal()),
        )
        .await?;
        self.expect(Step::ConnectionClose, 0, |m| {
            matches!(m, Method::ConnectionCloseOk)
        })
        .await?;
        Ok(())
    }

    /// Flush and close the socket. Bounded, since a peer that stopped
    /// reading never lets the flush finish.
    async fn shutdown_transport(&mut self) {
        match timeout(ABORT_CLOSE_TIMEOUT, SinkExt::close(&mut self.framed)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "transport shutdown failed"),
            Err(_) => debug!("transport shutdown timed out, dropping socket"),
        }
    }

    async fn send(&mut self, step: Step, channel: u16, method: Method) -> Result<()> {
        debug!(method = method.name(), channel, "sending");
        self.framed
            .send(Frame::method(channel, method))
            .await
            .map_err(|e| RelayError::transport(step, e))
    }

    /// Wait for a method on `channel` accepted by `accept`.
    ///
    /// Heartbeats and other frames are skipped. A close from the broker ends
    /// the wait with [`RelayError::BrokerReply`].
    async fn expect<F>(&mut self, step: Step, channel: u16, accept: F) -> Result<Method>
    where
        F: Fn(&Method) -> bool,
    {
        let rpc_timeout = self.rpc_timeout;
        let wait = async {
            loop {
                let frame = match self.framed.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(RelayError::from_read(step, e)),
                    None => return Err(RelayError::eof(step)),
                };

                if let Some(err) = close_error(step, &frame) {
                    return Err(err);
                }
                match frame {
                    Frame::Method {
                        channel: ch,
                        method,
                    } if ch == channel && accept(&method) => return Ok(method),
                    other => {
                        debug!(frame = %other.describe(), channel = other.channel(), "skipping frame");
                    }
                }
            }
        };

        match timeout(rpc_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::transport(
                step,
                io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for broker reply"),
            )),
        }
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("address", &self.address)
            .field("exchange", &self.exchange)
            .field("frame_max", &self.frame_max)
            .field("channel_open", &self.channel_open)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// The error for a broker-initiated close carried by `frame`, if any.
pub(crate) fn close_error(step: Step, frame: &Frame) -> Option<RelayError> {
    match frame {
        Frame::Method {
            method: Method::ConnectionClose(args),
            ..
        } => Some(RelayError::closed_by_broker(step, CloseScope::Connection, args)),
        Frame::Method {
            channel,
            method: Method::ChannelClose(args),
        } if *channel == CHANNEL => {
            Some(RelayError::closed_by_broker(step, CloseScope::Channel, args))
        }
        _ => None,
    }
}

/// Our frame size limit given the broker's; 0 from the broker means no limit.
fn negotiate_frame_max(server: u32) -> u32 {
    if server == 0 {
        FRAME_MAX
    } else {
        server.min(FRAME_MAX)
    }
}

/// Largest body payload that fits in one frame.
pub(crate) fn body_chunk_size(frame_max: u32) -> usize {
    frame_max.saturating_sub(FRAME_OVERHEAD).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_frame_max() {
        assert_eq!(negotiate_frame_max(0), FRAME_MAX);
        assert_eq!(negotiate_frame_max(4096), 4096);
        assert_eq!(negotiate_frame_max(1 << 20), FRAME_MAX);
    }

    #[test]
    fn test_body_chunk_size() {
        assert_eq!(body_chunk_size(4096), 4088);
        assert_eq!(body_chunk_size(FRAME_MAX), FRAME_MAX as usize - 8);
    }

    #[test]
    fn test_close_error_scopes() {
        let conn_close = Frame::method(0, Method::ConnectionClose(CloseArgs::normal()));
        let err = close_error(Step::Publish, &conn_close).unwrap();
        assert!(matches!(
            err,
            RelayError::BrokerReply { step: Step::Publish, ref reply } if reply.scope == CloseScope::Connection
        ));

        let chan_close = Frame::method(CHANNEL, Method::ChannelClose(CloseArgs::normal()));
        let err = close_error(Step::Consume, &chan_close).unwrap();
        assert!(matches!(
            err,
            RelayError::BrokerReply { ref reply, .. } if reply.scope == CloseScope::Channel
        ));

        assert!(close_error(Step::Consume, &Frame::Heartbeat).is_none());
    }

    #[tokio::test]
    async fn test_connect_to_invalid_address() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut desc = crate::config::RelayConfig::default().publisher_descriptor();
        desc.host = "127.0.0.1".to_string();
        desc.port = port;
        desc.connect_timeout = Duration::from_millis(500);

        let err = BrokerConnection::connect(&desc).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport { step: Step::Socket, .. }));
    }
}
