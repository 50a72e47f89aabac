//! Frame-level message consumption.
//!
//! A delivery arrives as a `basic.deliver` method frame, one content header
//! frame and zero or more body frames whose payloads add up to the size the
//! header declared. [`DeliveryReader`] walks that sequence on any stream of
//! decoded frames:
//!
//! 1. Await method: everything but `basic.deliver` is discarded.
//! 2. Await header: must be a parseable content header with JSON content
//!    type and an acceptable size, otherwise the message is rejected before
//!    any body frame is read. The unread body frames are then discarded by
//!    step 1 of the next read.
//! 3. Await body: payloads are appended until the declared size is reached.
//!    A payload that would overrun it, or any other frame (heartbeats
//!    included), rejects the message.
//!
//! Rejections are per message. Read failures, broker closes and end of stream
//! are fatal and returned as errors.

use std::io;

use bytes::BytesMut;
use futures::{Stream, StreamExt};
use tracing::{debug, instrument, trace, warn};

use crate::error::{RelayError, Result, Step};
use crate::metrics::RelayMetrics;
use crate::protocol::{Frame, Method, CONTENT_TYPE_JSON};

use super::connection::{close_error, BrokerConnection};

/// Largest body accepted by default.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 16 * 1024 * 1024;

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub body: String,
}

/// Result of reading one message.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered(Delivery),
    /// The message was malformed and dropped; the stream is still usable.
    Rejected(RelayError),
}

/// Receives each decoded message body.
///
/// Called on the consumer task; the next message is not read until it
/// returns.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, body: &str);
}

impl<F> MessageHandler for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle(&self, body: &str) {
        self(body);
    }
}

/// Reads deliveries from a frame stream.
#[derive(Debug, Clone)]
pub struct DeliveryReader {
    max_body_size: u64,
}

impl Default for DeliveryReader {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_body_size(max_body_size: u64) -> Self {
        Self { max_body_size }
    }

    /// Read the next message from `frames`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or ends, or the broker closes the
    /// connection or channel. These end the consume loop.
    pub async fn read_delivery<S>(&self, frames: &mut S) -> Result<DeliveryOutcome>
    where
        S: Stream<Item = io::Result<Frame>> + Unpin,
    {
        let (delivery_tag, exchange, routing_key) = loop {
            match next_frame(frames).await? {
                Frame::Method {
                    method:
                        Method::BasicDeliver {
                            delivery_tag,
                            exchange,
                            routing_key,
                            ..
                        },
                    ..
                } => break (delivery_tag, exchange, routing_key),
                other => trace!(frame = %other.describe(), "discarding frame outside a delivery"),
            }
        };

        let header = match next_frame(frames).await? {
            Frame::Header { header, .. } => header,
            Frame::MalformedHeader { reason, .. } => {
                return Ok(reject(format!("malformed content header: {reason}")))
            }
            other => {
                return Ok(reject(format!(
                    "expected content header after basic.deliver, got {}",
                    other.describe()
                )))
            }
        };

        let content_type = header.properties.content_type.as_deref();
        if content_type != Some(CONTENT_TYPE_JSON) {
            return Ok(reject(format!(
                "unsupported content type {:?}, expected {CONTENT_TYPE_JSON}",
                content_type.unwrap_or("")
            )));
        }
        if header.body_size > self.max_body_size {
            return Ok(reject(format!(
                "body size {} exceeds maximum {}",
                header.body_size, self.max_body_size
            )));
        }

        let expected = header.body_size as usize;
        let mut body = BytesMut::with_capacity(expected);
        while body.len() < expected {
            match next_frame(frames).await? {
                Frame::Body { payload, .. } => {
                    if body.len() + payload.len() > expected {
                        return Ok(reject(format!(
                            "body frame overruns declared size {expected} ({} + {})",
                            body.len(),
                            payload.len()
                        )));
                    }
                    body.extend_from_slice(&payload);
                }
                other => {
                    return Ok(reject(format!(
                        "unexpected {} inside message body ({} of {expected} bytes read)",
                        other.describe(),
                        body.len()
                    )))
                }
            }
        }

        let body = match String::from_utf8(body.to_vec()) {
            Ok(body) => body,
            Err(_) => return Ok(reject("message body is not valid UTF-8")),
        };

        Ok(DeliveryOutcome::Delivered(Delivery {
            delivery_tag,
            exchange,
            routing_key,
            correlation_id: header.properties.correlation_id,
            body,
        }))
    }
}

fn reject(message: impl Into<String>) -> DeliveryOutcome {
    DeliveryOutcome::Rejected(RelayError::protocol(Step::Consume, message))
}

/// Next frame, with broker closes and end of stream turned into errors.
async fn next_frame<S>(frames: &mut S) -> Result<Frame>
where
    S: Stream<Item = io::Result<Frame>> + Unpin,
{
    let frame = match frames.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(RelayError::from_read(Step::Consume, e)),
        None => return Err(RelayError::eof(Step::Consume)),
    };
    match close_error(Step::Consume, &frame) {
        Some(err) => Err(err),
        None => Ok(frame),
    }
}

impl BrokerConnection {
    /// Deliver messages to `handler` until a fatal error, which is returned.
    ///
    /// Rejected messages are logged and skipped.
    #[instrument(skip_all, fields(address = %self.address(), queue = ?self.queue()))]
    pub async fn consume(
        &mut self,
        reader: &DeliveryReader,
        handler: &dyn MessageHandler,
        metrics: &RelayMetrics,
    ) -> RelayError {
        let debug_enabled = self.is_debug();
        loop {
            match reader.read_delivery(self.frames_mut()).await {
                Ok(DeliveryOutcome::Delivered(delivery)) => {
                    metrics.deliveries_total.inc();
                    metrics.bytes_consumed.inc_by(delivery.body.len() as f64);
                    if debug_enabled {
                        debug!(
                            delivery_tag = delivery.delivery_tag,
                            routing_key = %delivery.routing_key,
                            correlation_id = ?delivery.correlation_id,
                            bytes = delivery.body.len(),
                            "message received"
                        );
                    }
                    handler.handle(&delivery.body);
                }
                Ok(DeliveryOutcome::Rejected(reason)) => {
                    metrics.deliveries_rejected.inc();
                    warn!(error = %reason, "discarding malformed message");
                }
                Err(e) => return e,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseScope;
    use crate::protocol::{AmqpCodec, BasicProperties, CloseArgs, ContentHeader, CHANNEL};
    use bytes::{BufMut, Bytes};
    use futures::executor::block_on;
    use futures::stream;
    use tokio_util::codec::{Encoder, FramedRead};

    fn deliver(tag: u64) -> Frame {
        Frame::method(
            CHANNEL,
            Method::BasicDeliver {
                consumer_tag: "ctag".to_string(),
                delivery_tag: tag,
                redelivered: false,
                exchange: "checks".to_string(),
                routing_key: "check_results".to_string(),
            },
        )
    }

    fn header(content_type: &str, size: u64) -> Frame {
        Frame::Header {
            channel: CHANNEL,
            header: ContentHeader::basic(
                size,
                BasicProperties {
                    content_type: Some(content_type.to_string()),
                    correlation_id: Some("cid".to_string()),
                    ..BasicProperties::default()
                },
            ),
        }
    }

    fn body(data: &'static [u8]) -> Frame {
        Frame::Body {
            channel: CHANNEL,
            payload: Bytes::from_static(data),
        }
    }

    fn frames(list: Vec<Frame>) -> impl Stream<Item = io::Result<Frame>> + Unpin {
        stream::iter(list.into_iter().map(Ok))
    }

    fn read(stream: &mut (impl Stream<Item = io::Result<Frame>> + Unpin)) -> Result<DeliveryOutcome> {
        block_on(DeliveryReader::new().read_delivery(stream))
    }

    #[test]
    fn test_delivery_reassembled() {
        let mut s = frames(vec![
            deliver(7),
            header(CONTENT_TYPE_JSON, 11),
            body(b"{\"a\":"),
            body(b"\"xyz\"}"),
        ]);
        match read(&mut s).unwrap() {
            DeliveryOutcome::Delivered(d) => {
                assert_eq!(d.delivery_tag, 7);
                assert_eq!(d.body, "{\"a\":\"xyz\"}");
                assert_eq!(d.correlation_id.as_deref(), Some("cid"));
                assert_eq!(d.routing_key, "check_results");
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_frames_before_deliver_are_discarded() {
        let mut s = frames(vec![
            Frame::Heartbeat,
            body(b"stray"),
            Frame::method(CHANNEL, Method::BasicConsumeOk { consumer_tag: "x".into() }),
            deliver(1),
            header(CONTENT_TYPE_JSON, 2),
            body(b"{}"),
        ]);
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Delivered(_)));
    }

    #[test]
    fn test_wrong_content_type_rejected_before_body() {
        let mut s = frames(vec![deliver(1), header("text/plain", 2), body(b"hi")]);
        match read(&mut s).unwrap() {
            DeliveryOutcome::Rejected(RelayError::Protocol { step, message }) => {
                assert_eq!(step, Step::Consume);
                assert!(message.contains("text/plain"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        // The body frame is still unread.
        let next = block_on(s.next()).unwrap().unwrap();
        assert_eq!(next, body(b"hi"));
    }

    #[test]
    fn test_missing_content_type_rejected() {
        let mut s = frames(vec![
            deliver(1),
            Frame::Header {
                channel: CHANNEL,
                header: ContentHeader::basic(2, BasicProperties::default()),
            },
        ]);
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Rejected(_)));
    }

    #[test]
    fn test_non_header_after_deliver_rejected() {
        let mut s = frames(vec![deliver(1), body(b"{}")]);
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Rejected(_)));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut s = frames(vec![deliver(1), header(CONTENT_TYPE_JSON, 100)]);
        let outcome = block_on(DeliveryReader::with_max_body_size(10).read_delivery(&mut s)).unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Rejected(_)));
    }

    #[test]
    fn test_body_overrun_rejected() {
        let mut s = frames(vec![deliver(1), header(CONTENT_TYPE_JSON, 3), body(b"{}"), body(b"{}")]);
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Rejected(_)));
    }

    #[test]
    fn test_method_inside_body_rejected() {
        let mut s = frames(vec![deliver(1), header(CONTENT_TYPE_JSON, 4), body(b"{}"), deliver(2)]);
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Rejected(_)));
    }

    #[test]
    fn test_heartbeat_inside_body_rejected() {
        let mut s = frames(vec![
            deliver(1),
            header(CONTENT_TYPE_JSON, 4),
            body(b"{}"),
            Frame::Heartbeat,
            body(b"{}"),
        ]);
        match read(&mut s).unwrap() {
            DeliveryOutcome::Rejected(RelayError::Protocol { message, .. }) => {
                assert!(message.contains("heartbeat"), "message = {message}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    /// Wire bytes for `frames`, with one raw header frame spliced in at `at`.
    fn wire_with_raw_header(list: Vec<Frame>, at: usize, header_payload: &[u8]) -> Vec<u8> {
        let mut codec = AmqpCodec::new();
        let mut buf = BytesMut::new();
        for (i, frame) in list.into_iter().enumerate() {
            if i == at {
                buf.put_u8(2);
                buf.put_u16(CHANNEL);
                buf.put_u32(header_payload.len() as u32);
                buf.extend_from_slice(header_payload);
                buf.put_u8(0xCE);
            }
            codec.encode(frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn test_unparseable_header_rejects_only_that_message() {
        // class 60, weight 0, size 2, content type flag, shortstr ff fe
        let bad_header = [0, 60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0x80, 0x00, 2, 0xff, 0xfe];
        let wire = wire_with_raw_header(
            vec![
                deliver(1),
                body(b"{}"),
                deliver(2),
                header(CONTENT_TYPE_JSON, 7),
                body(b"{\"a\":1}"),
            ],
            1,
            &bad_header,
        );
        let mut s = FramedRead::new(&wire[..], AmqpCodec::new());

        match read(&mut s).unwrap() {
            DeliveryOutcome::Rejected(RelayError::Protocol { step, message }) => {
                assert_eq!(step, Step::Consume);
                assert!(message.contains("malformed content header"), "message = {message}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        match read(&mut s).unwrap() {
            DeliveryOutcome::Delivered(d) => {
                assert_eq!(d.delivery_tag, 2);
                assert_eq!(d.body, "{\"a\":1}");
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_flag_continuation_header_rejects_only_that_message() {
        let continuation = [0, 60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x01];
        let wire = wire_with_raw_header(
            vec![deliver(1), deliver(2), header(CONTENT_TYPE_JSON, 2), body(b"{}")],
            1,
            &continuation,
        );
        let mut s = FramedRead::new(&wire[..], AmqpCodec::new());

        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Rejected(_)));
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Delivered(_)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut s = frames(vec![deliver(1), header(CONTENT_TYPE_JSON, 2), body(b"\xff\xfe")]);
        assert!(matches!(read(&mut s).unwrap(), DeliveryOutcome::Rejected(_)));
    }

    #[test]
    fn test_empty_body_delivered() {
        let mut s = frames(vec![deliver(1), header(CONTENT_TYPE_JSON, 0)]);
        match read(&mut s).unwrap() {
            DeliveryOutcome::Delivered(d) => assert!(d.body.is_empty()),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_end_of_stream_is_fatal() {
        let mut s = frames(vec![deliver(1), header(CONTENT_TYPE_JSON, 4), body(b"{}")]);
        let err = read(&mut s).unwrap_err();
        assert!(matches!(err, RelayError::Transport { step: Step::Consume, .. }));
    }

    #[test]
    fn test_read_error_is_fatal() {
        let mut s = stream::iter(vec![Err::<Frame, _>(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame end marker",
        ))]);
        let err = read(&mut s).unwrap_err();
        assert!(matches!(err, RelayError::Protocol { step: Step::Consume, .. }));
    }

    #[test]
    fn test_broker_close_is_fatal() {
        let mut s = frames(vec![Frame::method(
            0,
            Method::ConnectionClose(CloseArgs {
                reply_code: 320,
                reply_text: "CONNECTION_FORCED".to_string(),
                class_id: 0,
                method_id: 0,
            }),
        )]);
        match read(&mut s).unwrap_err() {
            RelayError::BrokerReply { reply, .. } => {
                assert_eq!(reply.scope, CloseScope::Connection);
                assert_eq!(reply.code, 320);
            }
            other => panic!("expected broker reply, got {other}"),
        }
    }

    #[test]
    fn test_closure_is_a_handler() {
        let seen = std::sync::Mutex::new(Vec::new());
        let handler = |body: &str| seen.lock().unwrap().push(body.to_string());
        handler.handle("{\"x\":1}");
        assert_eq!(seen.lock().unwrap().as_slice(), ["{\"x\":1}".to_string()]);
    }
}

/// Property-based tests for body reassembly
#[cfg(test)]
mod proptests {
    use super::*;
    use crate::protocol::{BasicProperties, ContentHeader, CHANNEL};
    use bytes::Bytes;
    use futures::executor::block_on;
    use futures::stream;
    use proptest::prelude::*;

    fn split_at_cuts(body: &[u8], mut cuts: Vec<usize>) -> Vec<Bytes> {
        cuts.retain(|&c| c > 0 && c < body.len());
        cuts.sort_unstable();
        cuts.dedup();

        let mut parts = Vec::new();
        let mut start = 0;
        for cut in cuts.into_iter().chain(std::iter::once(body.len())) {
            parts.push(Bytes::copy_from_slice(&body[start..cut]));
            start = cut;
        }
        parts
    }

    proptest! {
        /// Any fragmentation of a body reassembles to the original bytes
        #[test]
        fn prop_fragmented_body_reassembles(
            body in "[a-z0-9 {}\":,]{1,2000}",
            cuts in proptest::collection::vec(0usize..2000, 0..20)
        ) {
            let mut list = vec![
                Frame::method(CHANNEL, Method::BasicDeliver {
                    consumer_tag: "ctag".to_string(),
                    delivery_tag: 1,
                    redelivered: false,
                    exchange: "checks".to_string(),
                    routing_key: "check_results".to_string(),
                }),
                Frame::Header {
                    channel: CHANNEL,
                    header: ContentHeader::basic(body.len() as u64, BasicProperties {
                        content_type: Some(CONTENT_TYPE_JSON.to_string()),
                        ..BasicProperties::default()
                    }),
                },
            ];
            for part in split_at_cuts(body.as_bytes(), cuts) {
                list.push(Frame::Body { channel: CHANNEL, payload: part });
            }

            let mut s = stream::iter(list.into_iter().map(Ok));
            let outcome = block_on(DeliveryReader::new().read_delivery(&mut s)).unwrap();
            match outcome {
                DeliveryOutcome::Delivered(d) => prop_assert_eq!(d.body, body),
                DeliveryOutcome::Rejected(e) => prop_assert!(false, "rejected: {}", e),
            }
        }

        /// A fragment that overruns the declared size is never delivered
        #[test]
        fn prop_overrun_never_delivered(
            declared in 1u64..512,
            extra in 1usize..64
        ) {
            let payload = Bytes::from(vec![b'x'; declared as usize + extra]);
            let list = vec![
                Frame::method(CHANNEL, Method::BasicDeliver {
                    consumer_tag: "ctag".to_string(),
                    delivery_tag: 1,
                    redelivered: false,
                    exchange: "checks".to_string(),
                    routing_key: "check_results".to_string(),
                }),
                Frame::Header {
                    channel: CHANNEL,
                    header: ContentHeader::basic(declared, BasicProperties {
                        content_type: Some(CONTENT_TYPE_JSON.to_string()),
                        ..BasicProperties::default()
                    }),
                },
                Frame::Body { channel: CHANNEL, payload },
            ];
            let mut s = stream::iter(list.into_iter().map(Ok));
            let outcome = block_on(DeliveryReader::new().read_delivery(&mut s)).unwrap();
            prop_assert!(matches!(outcome, DeliveryOutcome::Rejected(_)));
        }
    }
}
