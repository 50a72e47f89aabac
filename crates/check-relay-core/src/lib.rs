//! Check Relay Core Library
//!
//! This library dispatches host and service checks over an AMQP 0-9-1 broker.
//! Check requests are published to an exchange as JSON messages; check
//! results are consumed from a bound queue and handed to the host
//! application. Both broker connections are kept alive by supervisor tasks
//! that reconnect after any failure.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Table-driven configuration parsing and validation
//! - [`error`] - Domain-specific error types
//! - [`protocol`] - AMQP frame and method codec
//! - [`broker`] - Broker connection lifecycle, publishing and consumption
//! - [`supervisor`] - Reconnecting publisher and consumer tasks
//! - [`check`] - Check request and result messages
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use check_relay_core::{CheckRelay, RelayConfig, RelayMetrics};
//!
//! let config = RelayConfig::from_file("config.json")?;
//! let relay = CheckRelay::start(
//!     config,
//!     Arc::new(|body: &str| println!("{body}")),
//!     Arc::new(RelayMetrics::new()),
//! );
//!
//! relay.publisher().publish_check(&CheckRequest::host("web01", "check_ping")).await?;
//! relay.shutdown().await;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod check;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod supervisor;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{BrokerConnection, Delivery, DeliveryReader, MessageEnvelope, MessageHandler};
pub use check::{CheckKind, CheckRequest, CheckResult, Timestamp};
pub use config::{ConnectionDescriptor, QueueBinding, RelayConfig};
pub use error::{ConfigError, RelayError, Result, Step};
pub use metrics::RelayMetrics;
pub use supervisor::{CheckRelay, PublisherHandle, Role, RoleState};
