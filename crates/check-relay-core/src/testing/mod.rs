//! Test utilities for the check relay.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockBroker`] - A lightweight mock AMQP broker for testing
//! - [`RelayTestHarness`] - A mock broker plus a relay config pointing at it
//! - [`TestHarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use check_relay_core::testing::RelayTestHarness;
//!
//! #[tokio::test]
//! async fn test_publish() {
//!     let harness = RelayTestHarness::new().await;
//!     let mut conn = harness.connect_publisher().await.unwrap();
//!
//!     conn.publish(&MessageEnvelope::json("checks", "id", "{}")).await.unwrap();
//!
//!     let published = harness.wait_for_published(1, Duration::from_secs(1)).await;
//!     assert_eq!(published.len(), 1);
//! }
//! ```

pub mod harness;
pub mod mock_broker;

pub use harness::{CollectingHandler, RelayTestHarness, TestHarnessBuilder};
pub use mock_broker::{reply_codes, BrokerCall, MockBroker, PublishedMessage};
