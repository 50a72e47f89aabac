//! Broker connection management.
//!
//! This module provides:
//! - The connect and disconnect sequences for one broker connection
//! - Publishing check requests as JSON messages
//! - Frame-level consumption of check results

pub mod connection;
pub mod consumer;
pub mod publisher;

pub use connection::BrokerConnection;
pub use consumer::{Delivery, DeliveryOutcome, DeliveryReader, MessageHandler};
pub use publisher::MessageEnvelope;
