//! Outbound messages.

use bytes::Bytes;

use crate::error::{RelayError, Result};
use crate::protocol::{
    BasicProperties, ContentHeader, Frame, Method, CHANNEL, CONTENT_TYPE_JSON,
};

use super::connection::body_chunk_size;

/// `app-id` property set on every published message.
pub const APP_ID: &str = "check-relay";

/// Non-persistent delivery.
const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// A message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub correlation_id: String,
    pub content_type: String,
    pub routing_key: String,
    /// Routing key results for this message should be sent back with.
    pub reply_to: Option<String>,
    pub body: Bytes,
}

impl MessageEnvelope {
    /// A JSON message for `routing_key`.
    #[must_use]
    pub fn json(
        routing_key: impl Into<String>,
        correlation_id: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            routing_key: routing_key.into(),
            reply_to: None,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Properties carried in the content header.
    #[must_use]
    pub fn properties(&self) -> BasicProperties {
        BasicProperties {
            content_type: Some(self.content_type.clone()),
            delivery_mode: Some(DELIVERY_MODE_TRANSIENT),
            correlation_id: Some(self.correlation_id.clone()),
            reply_to: self.reply_to.clone(),
            app_id: Some(APP_ID.to_string()),
            ..BasicProperties::default()
        }
    }

    /// Method, header and body frames for publishing to `exchange`.
    ///
    /// The body is split so no frame exceeds `frame_max`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Publish`] if the routing key or a property is
    /// longer than a short string allows.
    pub fn to_frames(&self, exchange: &str, frame_max: u32) -> Result<Vec<Frame>> {
        for (name, value) in [
            ("routing key", Some(&self.routing_key)),
            ("correlation id", Some(&self.correlation_id)),
            ("content type", Some(&self.content_type)),
            ("reply-to", self.reply_to.as_ref()),
        ] {
            if value.is_some_and(|v| v.len() > usize::from(u8::MAX)) {
                return Err(RelayError::Publish {
                    message: format!("{name} longer than 255 bytes"),
                });
            }
        }

        let chunk = body_chunk_size(frame_max);
        let mut frames = Vec::with_capacity(2 + self.body.len().div_ceil(chunk));

        frames.push(Frame::method(
            CHANNEL,
            Method::BasicPublish {
                exchange: exchange.to_string(),
                routing_key: self.routing_key.clone(),
                mandatory: false,
                immediate: false,
            },
        ));
        frames.push(Frame::Header {
            channel: CHANNEL,
            header: ContentHeader::basic(self.body.len() as u64, self.properties()),
        });

        let mut offset = 0;
        while offset < self.body.len() {
            let end = (offset + chunk).min(self.body.len());
            frames.push(Frame::Body {
                channel: CHANNEL,
                payload: self.body.slice(offset..end),
            });
            offset = end;
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties() {
        let envelope = MessageEnvelope::json("checks", "abc123", "{}").with_reply_to("check_results");
        let props = envelope.properties();
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.delivery_mode, Some(1));
        assert_eq!(props.correlation_id.as_deref(), Some("abc123"));
        assert_eq!(props.reply_to.as_deref(), Some("check_results"));
        assert_eq!(props.app_id.as_deref(), Some(APP_ID));
    }

    #[test]
    fn test_body_split_by_frame_max() {
        let body = vec![b'x'; 10_000];
        let envelope = MessageEnvelope::json("checks", "id", body);
        let frames = envelope.to_frames("checks", 4096).unwrap();

        // method + header + ceil(10000 / 4088) bodies
        assert_eq!(frames.len(), 2 + 3);
        let sizes: Vec<usize> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Body { payload, .. } => Some(payload.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![4088, 4088, 1824]);
        match &frames[1] {
            Frame::Header { header, .. } => assert_eq!(header.body_size, 10_000),
            other => panic!("expected header, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_body_has_no_body_frames() {
        let envelope = MessageEnvelope::json("checks", "id", Bytes::new());
        let frames = envelope.to_frames("checks", 4096).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_overlong_routing_key_rejected() {
        let envelope = MessageEnvelope::json("r".repeat(256), "id", "{}");
        assert!(matches!(
            envelope.to_frames("checks", 4096),
            Err(RelayError::Publish { .. })
        ));
    }
}
