//! Mock AMQP broker for integration testing.
//!
//! A lightweight in-process broker that:
//! - Accepts AMQP 0-9-1 connections and answers the relay's handshake
//! - Records every method received and every message published
//! - Can refuse logins or exchange declarations
//! - Can close or drop live connections and push deliveries to consumers

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_util::codec::Framed;

use crate::protocol::{
    class, AmqpCodec, BasicProperties, CloseArgs, ContentHeader, Frame, Method, FRAME_MAX,
    FRAME_OVERHEAD, PROTOCOL_HEADER,
};

/// Reply codes the mock sends when closing.
pub mod reply_codes {
    pub const CONNECTION_FORCED: u16 = 320;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const PRECONDITION_FAILED: u16 = 406;
}

/// A method received by the broker.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// Sequence number of the connection, starting at 1.
    pub connection: usize,
    pub channel: u16,
    pub method: Method,
}

/// A message reassembled from `basic.publish`, header and body frames.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

impl PublishedMessage {
    /// Body as UTF-8, lossily.
    #[must_use]
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Instructions fanned out to every live connection.
#[derive(Debug, Clone)]
enum Control {
    CloseConnection(CloseArgs),
    CloseChannel(CloseArgs),
    Drop,
    Deliver {
        content_type: Option<String>,
        correlation_id: Option<String>,
        body: Bytes,
    },
    Frames(Vec<Frame>),
}

/// State shared between the broker handle and its connection tasks.
#[derive(Default)]
struct Shared {
    calls: RwLock<Vec<BrokerCall>>,
    published: RwLock<Vec<PublishedMessage>>,
    connections_total: AtomicUsize,
    connections_active: AtomicUsize,
    consumers_active: AtomicUsize,
    reject_login: AtomicBool,
    fail_exchange_declare: AtomicBool,
    stall_publishers: AtomicBool,
    frame_max: AtomicU32,
}

/// Mock AMQP broker for testing.
pub struct MockBroker {
    address: String,
    shared: Arc<Shared>,
    control_tx: broadcast::Sender<Control>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl MockBroker {
    /// Create a new mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        let shared = Shared::default();
        shared.frame_max.store(FRAME_MAX, Ordering::Relaxed);
        let (control_tx, _) = broadcast::channel(64);
        Self {
            address: address.into(),
            shared: Arc::new(shared),
            control_tx,
            shutdown_tx: None,
        }
    }

    /// Start the mock broker.
    ///
    /// Returns the actual address the broker is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn start(&mut self) -> io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();
        self.address.clone_from(&actual_address);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let shared = Arc::clone(&self.shared);
        let control_tx = self.control_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                let id = shared.connections_total.fetch_add(1, Ordering::SeqCst) + 1;
                                let shared = Arc::clone(&shared);
                                let control_rx = control_tx.subscribe();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    shared.connections_active.fetch_add(1, Ordering::SeqCst);
                                    let mut conn = MockConnection::new(id, Arc::clone(&shared));
                                    let _ = conn.run(stream, control_rx, shutdown_rx).await;
                                    if conn.consuming {
                                        shared.consumers_active.fetch_sub(1, Ordering::SeqCst);
                                    }
                                    shared.connections_active.fetch_sub(1, Ordering::SeqCst);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop accepting connections and drop the live ones.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Port the broker is listening on, once started.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.address
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// Answer `connection.start-ok` with `ACCESS_REFUSED`.
    pub fn set_reject_login(&self, reject: bool) {
        self.shared.reject_login.store(reject, Ordering::SeqCst);
    }

    /// Answer `exchange.declare` with a channel close.
    pub fn set_fail_exchange_declare(&self, fail: bool) {
        self.shared.fail_exchange_declare.store(fail, Ordering::SeqCst);
    }

    /// Stop reading from connections that are not consuming, so their
    /// writes back up once the socket buffers fill. Checked whenever a
    /// connection wakes up, so clearing it takes effect on the next control
    /// message.
    pub fn set_stall_publishers(&self, stall: bool) {
        self.shared.stall_publishers.store(stall, Ordering::SeqCst);
    }

    /// Frame size offered in `connection.tune`. Applies to new connections.
    pub fn set_frame_max(&self, frame_max: u32) {
        self.shared.frame_max.store(frame_max, Ordering::SeqCst);
    }

    /// Get all recorded calls.
    pub async fn get_calls(&self) -> Vec<BrokerCall> {
        self.shared.calls.read().await.clone()
    }

    /// Names of the recorded methods, in arrival order.
    pub async fn method_names(&self) -> Vec<&'static str> {
        self.shared
            .calls
            .read()
            .await
            .iter()
            .map(|c| c.method.name())
            .collect()
    }

    /// Calls whose method has the given name, e.g. `"queue.declare"`.
    pub async fn get_calls_for_method(&self, name: &str) -> Vec<BrokerCall> {
        self.shared
            .calls
            .read()
            .await
            .iter()
            .filter(|c| c.method.name() == name)
            .cloned()
            .collect()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.shared.calls.write().await.clear();
    }

    /// Messages published so far.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.shared.published.read().await.clone()
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn connections_total(&self) -> usize {
        self.shared.connections_total.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connections_active(&self) -> usize {
        self.shared.connections_active.load(Ordering::SeqCst)
    }

    /// Connections that have issued `basic.consume`.
    #[must_use]
    pub fn consumers_active(&self) -> usize {
        self.shared.consumers_active.load(Ordering::SeqCst)
    }

    /// Close every live connection with `connection.close`.
    pub fn close_connections(&self, reply_code: u16, reply_text: &str) {
        let _ = self.control_tx.send(Control::CloseConnection(CloseArgs {
            reply_code,
            reply_text: reply_text.to_string(),
            class_id: 0,
            method_id: 0,
        }));
    }

    /// Close channel 1 on every live connection.
    pub fn close_channels(&self, reply_code: u16, reply_text: &str) {
        let _ = self.control_tx.send(Control::CloseChannel(CloseArgs {
            reply_code,
            reply_text: reply_text.to_string(),
            class_id: 0,
            method_id: 0,
        }));
    }

    /// Drop every live socket without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.control_tx.send(Control::Drop);
    }

    /// Deliver a message to every consumer, split by the negotiated frame
    /// size.
    pub fn deliver(&self, content_type: Option<&str>, correlation_id: Option<&str>, body: impl Into<Bytes>) {
        let _ = self.control_tx.send(Control::Deliver {
            content_type: content_type.map(str::to_string),
            correlation_id: correlation_id.map(str::to_string),
            body: body.into(),
        });
    }

    /// Deliver a JSON message to every consumer.
    pub fn deliver_json(&self, body: impl Into<Bytes>) {
        self.deliver(Some(crate::protocol::CONTENT_TYPE_JSON), None, body);
    }

    /// Send raw frames to every consumer.
    pub fn inject_frames(&self, frames: Vec<Frame>) {
        let _ = self.control_tx.send(Control::Frames(frames));
    }

    /// Wait until `predicate` holds or `timeout` passes. Returns whether it
    /// held.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` messages have been published.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.published().await;
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A publish being reassembled.
struct PendingPublish {
    exchange: String,
    routing_key: String,
    header: Option<ContentHeader>,
    body: BytesMut,
}

/// Server side of one client connection.
struct MockConnection {
    id: usize,
    shared: Arc<Shared>,
    frame_max: u32,
    consuming: bool,
    consumer_tag: String,
    delivery_tag: u64,
    pending: Option<PendingPublish>,
}

/// What to do after handling a frame.
enum Next {
    Continue,
    Hangup,
}

impl MockConnection {
    fn new(id: usize, shared: Arc<Shared>) -> Self {
        let frame_max = shared.frame_max.load(Ordering::SeqCst);
        Self {
            id,
            shared,
            frame_max,
            consuming: false,
            consumer_tag: String::new(),
            delivery_tag: 0,
            pending: None,
        }
    }

    async fn run(
        &mut self,
        mut stream: TcpStream,
        mut control_rx: broadcast::Receiver<Control>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        if &header != PROTOCOL_HEADER {
            stream.write_all(PROTOCOL_HEADER).await?;
            return Ok(());
        }

        let mut framed = Framed::new(stream, AmqpCodec::new());
        framed
            .send(Frame::method(
                0,
                Method::ConnectionStart {
                    version_major: 0,
                    version_minor: 9,
                    server_properties: Bytes::new(),
                    mechanisms: "PLAIN AMQPLAIN".to_string(),
                    locales: "en_US".to_string(),
                },
            ))
            .await?;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                control = control_rx.recv() => {
                    match control {
                        Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => return Ok(()),
                        Ok(control) => self.apply(&mut framed, control).await?,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
                frame = framed.next(), if !self.is_stalled() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    };
                    if let Next::Hangup = self.handle(&mut framed, frame).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn is_stalled(&self) -> bool {
        !self.consuming && self.shared.stall_publishers.load(Ordering::SeqCst)
    }

    async fn apply(
        &mut self,
        framed: &mut Framed<TcpStream, AmqpCodec>,
        control: Control,
    ) -> io::Result<()> {
        match control {
            Control::CloseConnection(args) => {
                framed.send(Frame::method(0, Method::ConnectionClose(args))).await
            }
            Control::CloseChannel(args) => {
                framed.send(Frame::method(1, Method::ChannelClose(args))).await
            }
            Control::Deliver {
                content_type,
                correlation_id,
                body,
            } if self.consuming => {
                self.delivery_tag += 1;
                let properties = BasicProperties {
                    content_type,
                    correlation_id,
                    ..BasicProperties::default()
                };
                framed
                    .feed(Frame::method(
                        1,
                        Method::BasicDeliver {
                            consumer_tag: self.consumer_tag.clone(),
                            delivery_tag: self.delivery_tag,
                            redelivered: false,
                            exchange: String::new(),
                            routing_key: String::new(),
                        },
                    ))
                    .await?;
                framed
                    .feed(Frame::Header {
                        channel: 1,
                        header: ContentHeader::basic(body.len() as u64, properties),
                    })
                    .await?;
                let chunk = self.frame_max.saturating_sub(FRAME_OVERHEAD).max(1) as usize;
                for part in body.chunks(chunk) {
                    framed
                        .feed(Frame::Body {
                            channel: 1,
                            payload: body.slice_ref(part),
                        })
                        .await?;
                }
                framed.flush().await
            }
            Control::Frames(frames) if self.consuming => {
                for frame in frames {
                    framed.feed(frame).await?;
                }
                framed.flush().await
            }
            Control::Deliver { .. } | Control::Frames(_) | Control::Drop => Ok(()),
        }
    }

    async fn handle(
        &mut self,
        framed: &mut Framed<TcpStream, AmqpCodec>,
        frame: Frame,
    ) -> io::Result<Next> {
        let (channel, method) = match frame {
            Frame::Method { channel, method } => (channel, method),
            Frame::Header { header, .. } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.header = Some(header);
                }
                self.complete_publish().await;
                return Ok(Next::Continue);
            }
            Frame::Body { payload, .. } => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.body.extend_from_slice(&payload);
                }
                self.complete_publish().await;
                return Ok(Next::Continue);
            }
            Frame::MalformedHeader { .. } => {
                self.pending = None;
                return Ok(Next::Continue);
            }
            Frame::Heartbeat => return Ok(Next::Continue),
        };

        self.shared.calls.write().await.push(BrokerCall {
            connection: self.id,
            channel,
            method: method.clone(),
        });

        let reply = match method {
            Method::ConnectionStartOk { .. } => {
                if self.shared.reject_login.load(Ordering::SeqCst) {
                    Method::ConnectionClose(CloseArgs {
                        reply_code: reply_codes::ACCESS_REFUSED,
                        reply_text: "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN".to_string(),
                        class_id: class::CONNECTION,
                        method_id: 11,
                    })
                } else {
                    Method::ConnectionTune {
                        channel_max: 2047,
                        frame_max: self.frame_max,
                        heartbeat: 0,
                    }
                }
            }
            Method::ConnectionTuneOk { frame_max, .. } => {
                if frame_max > 0 {
                    self.frame_max = frame_max;
                    *framed.codec_mut() = AmqpCodec::with_max_frame_size(frame_max as usize);
                }
                return Ok(Next::Continue);
            }
            Method::ConnectionOpen { .. } => Method::ConnectionOpenOk,
            Method::ConnectionClose(_) => {
                framed.send(Frame::method(0, Method::ConnectionCloseOk)).await?;
                return Ok(Next::Hangup);
            }
            Method::ConnectionCloseOk => return Ok(Next::Hangup),
            Method::ChannelOpen => Method::ChannelOpenOk,
            Method::ChannelClose(_) => Method::ChannelCloseOk,
            Method::ChannelCloseOk => return Ok(Next::Continue),
            Method::ExchangeDeclare { exchange, .. } => {
                if self.shared.fail_exchange_declare.load(Ordering::SeqCst) {
                    Method::ChannelClose(CloseArgs {
                        reply_code: reply_codes::PRECONDITION_FAILED,
                        reply_text: format!(
                            "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{exchange}'"
                        ),
                        class_id: class::EXCHANGE,
                        method_id: 10,
                    })
                } else {
                    Method::ExchangeDeclareOk
                }
            }
            Method::QueueDeclare { queue, .. } => {
                let queue = if queue.is_empty() {
                    format!("amq.gen-{}", self.id)
                } else {
                    queue
                };
                Method::QueueDeclareOk {
                    queue,
                    message_count: 0,
                    consumer_count: 0,
                }
            }
            Method::QueueBind { .. } => Method::QueueBindOk,
            Method::BasicConsume { consumer_tag, .. } => {
                self.consumer_tag = if consumer_tag.is_empty() {
                    format!("amq.ctag-{}", self.id)
                } else {
                    consumer_tag
                };
                if !self.consuming {
                    self.consuming = true;
                    self.shared.consumers_active.fetch_add(1, Ordering::SeqCst);
                }
                Method::BasicConsumeOk {
                    consumer_tag: self.consumer_tag.clone(),
                }
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                ..
            } => {
                self.pending = Some(PendingPublish {
                    exchange,
                    routing_key,
                    header: None,
                    body: BytesMut::new(),
                });
                return Ok(Next::Continue);
            }
            _ => return Ok(Next::Continue),
        };

        framed.send(Frame::method(channel, reply)).await?;
        Ok(Next::Continue)
    }

    /// Record the pending publish once its body is complete.
    async fn complete_publish(&mut self) {
        let complete = matches!(
            &self.pending,
            Some(PendingPublish { header: Some(h), body, .. }) if body.len() as u64 >= h.body_size
        );
        if !complete {
            return;
        }
        if let Some(pending) = self.pending.take() {
            let properties = pending
                .header
                .map(|h| h.properties)
                .unwrap_or_default();
            self.shared.published.write().await.push(PublishedMessage {
                exchange: pending.exchange,
                routing_key: pending.routing_key,
                properties,
                body: pending.body.freeze(),
            });
        }
    }
}
