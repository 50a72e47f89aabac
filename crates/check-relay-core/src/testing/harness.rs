//! Test harness for integration testing of the check relay.
//!
//! Provides a complete test environment with:
//! - A running mock broker
//! - A relay configuration pointing at it
//! - A handler that collects consumed message bodies

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broker::{BrokerConnection, MessageHandler};
use crate::config::{ConnectionDescriptor, RelayConfig};
use crate::error::Result;
use crate::metrics::RelayMetrics;
use crate::supervisor::CheckRelay;

use super::mock_broker::{MockBroker, PublishedMessage};

/// Message bodies received by a [`CollectingHandler`].
pub type Collected = Arc<Mutex<Vec<String>>>;

/// Handler that stores every body it is given.
#[derive(Debug, Clone, Default)]
pub struct CollectingHandler {
    bodies: Collected,
}

impl CollectingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

impl MessageHandler for CollectingHandler {
    fn handle(&self, body: &str) {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.push(body.to_string());
        }
    }
}

/// Test harness for integration testing.
pub struct RelayTestHarness {
    /// The mock broker
    pub broker: MockBroker,
    /// Configuration pointing at the mock broker
    pub config: RelayConfig,
    pub metrics: Arc<RelayMetrics>,
    pub handler: CollectingHandler,
}

impl RelayTestHarness {
    /// Create a new test harness with default configuration.
    ///
    /// Default config: one second retry wait, named consumer queue.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Get the mock broker address.
    #[must_use]
    pub fn broker_address(&self) -> &str {
        self.broker.address()
    }

    #[must_use]
    pub fn publisher_descriptor(&self) -> ConnectionDescriptor {
        self.config.publisher_descriptor()
    }

    #[must_use]
    pub fn consumer_descriptor(&self) -> ConnectionDescriptor {
        self.config.consumer_descriptor()
    }

    /// Open a publisher connection directly, without a supervisor.
    pub async fn connect_publisher(&self) -> Result<BrokerConnection> {
        BrokerConnection::connect(&self.publisher_descriptor()).await
    }

    /// Open a consumer connection directly, without a supervisor.
    pub async fn connect_consumer(&self) -> Result<BrokerConnection> {
        BrokerConnection::connect_consumer(&self.consumer_descriptor(), &self.config.queue_binding())
            .await
    }

    /// Start a relay against the mock broker with the collecting handler.
    #[must_use]
    pub fn start_relay(&self) -> CheckRelay {
        let handler: Arc<dyn MessageHandler> = Arc::new(self.handler.clone());
        CheckRelay::start(self.config.clone(), handler, Arc::clone(&self.metrics))
    }

    /// Bodies the collecting handler has received.
    #[must_use]
    pub fn received(&self) -> Vec<String> {
        self.handler.bodies()
    }

    /// Wait until the handler has received at least `count` bodies.
    pub async fn wait_for_received(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received();
            if received.len() >= count || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `count` messages reached the broker.
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<PublishedMessage> {
        self.broker.wait_for_published(count, timeout).await
    }

    /// Shutdown the test harness.
    pub async fn shutdown(&mut self) {
        self.broker.stop().await;
    }
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    retry_wait_time: u64,
    queue: String,
    frame_max: Option<u32>,
    debug: bool,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            retry_wait_time: 1,
            queue: "check_results".to_string(),
            frame_max: None,
            debug: false,
        }
    }

    /// Set the seconds between reconnect attempts.
    #[must_use]
    pub fn retry_wait_time(mut self, secs: u64) -> Self {
        self.retry_wait_time = secs;
        self
    }

    /// Set the consumer queue name; empty for a server-named queue.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the frame size the mock broker offers.
    #[must_use]
    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = Some(frame_max);
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Build the test harness.
    pub async fn build(self) -> RelayTestHarness {
        let mut broker = MockBroker::new("127.0.0.1:0");
        if let Some(frame_max) = self.frame_max {
            broker.set_frame_max(frame_max);
        }
        broker
            .start()
            .await
            .expect("Failed to start mock broker");

        let config = RelayConfig {
            host: "127.0.0.1".into(),
            port: broker.port(),
            consumer_queue: self.queue.as_str().into(),
            retry_wait_time: self.retry_wait_time,
            debug: self.debug,
            ..RelayConfig::default()
        };

        RelayTestHarness {
            broker,
            config,
            metrics: Arc::new(RelayMetrics::new()),
            handler: CollectingHandler::new(),
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_creation() {
        let harness = RelayTestHarness::new().await;

        assert!(!harness.broker_address().is_empty());
        assert_eq!(harness.config.port, harness.broker.port());
        assert_eq!(harness.config.retry_wait_time, 1);
    }

    #[tokio::test]
    async fn test_harness_builder() {
        let harness = TestHarnessBuilder::new()
            .retry_wait_time(2)
            .queue("")
            .build()
            .await;

        assert_eq!(harness.config.retry_wait_time, 2);
        assert!(harness.config.queue_binding().queue.is_none());
    }

    #[test]
    fn test_collecting_handler() {
        let handler = CollectingHandler::new();
        handler.handle("{}");
        handler.handle("[]");
        assert_eq!(handler.bodies(), vec!["{}".to_string(), "[]".to_string()]);
    }
}
