//! Connection supervision.
//!
//! One task per role owns that role's [`BrokerConnection`] and keeps it
//! alive: connect, on failure wait `retry_wait_time` and try again, forever.
//! The host talks to the publisher task through a [`PublisherHandle`] and
//! reads connectivity from lock-free flags. A `watch` channel stops both
//! tasks; each disconnects cleanly on the way out.
//!
//! [`BrokerConnection`]: crate::broker::BrokerConnection

mod consumer;
mod publisher;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::broker::{MessageEnvelope, MessageHandler};
use crate::check::CheckRequest;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;

use consumer::ConsumerTask;
use publisher::PublisherTask;

/// Publish requests queued ahead of the publisher task.
const PUBLISH_QUEUE_DEPTH: usize = 64;

/// The two connection roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Consumer,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publisher => "publisher",
            Self::Consumer => "consumer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one role, shared with the host.
///
/// Only the owning task writes it.
#[derive(Debug)]
pub struct RoleState {
    role: Role,
    connected: AtomicBool,
    connects: AtomicU64,
    failures: AtomicU64,
}

impl RoleState {
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            connected: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Successful connect sequences so far.
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Failed connect attempts and lost connections so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn mark_connected(&self, metrics: &RelayMetrics) {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Release);
        metrics.set_connected(self.role.as_str(), true);
    }

    fn mark_disconnected(&self, metrics: &RelayMetrics) {
        self.connected.store(false, Ordering::Release);
        metrics.set_connected(self.role.as_str(), false);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// A message handed to the publisher task.
struct PublishRequest {
    envelope: MessageEnvelope,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable handle for publishing through the publisher task.
#[derive(Clone)]
pub struct PublisherHandle {
    requests: mpsc::Sender<PublishRequest>,
    state: Arc<RoleState>,
    routing_key: String,
    reply_to: Option<String>,
}

impl PublisherHandle {
    /// Whether the publisher currently holds a broker connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Publish `envelope` and wait until it has been written.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConnected`] without queueing anything if the
    /// publisher is disconnected, [`RelayError::Shutdown`] once the relay is
    /// stopping, or the publish error itself. A failed publish also drops the
    /// connection; the supervisor reconnects in the background.
    pub async fn publish(&self, envelope: MessageEnvelope) -> Result<()> {
        if !self.state.is_connected() {
            return Err(RelayError::NotConnected);
        }

        let (reply, response) = oneshot::channel();
        self.requests
            .send(PublishRequest { envelope, reply })
            .await
            .map_err(|_| RelayError::Shutdown)?;
        response.await.map_err(|_| RelayError::Shutdown)?
    }

    /// Publish a check request under the configured routing key, asking for
    /// the result on the consumer binding key.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish); a request that cannot be
    /// serialized is a [`RelayError::Publish`].
    pub async fn publish_check(&self, check: &CheckRequest) -> Result<()> {
        let envelope = check
            .to_envelope(&self.routing_key, self.reply_to.as_deref())
            .map_err(|e| RelayError::Publish {
                message: format!("failed to encode check request: {e}"),
            })?;
        self.publish(envelope).await
    }
}

impl fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("connected", &self.state.is_connected())
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// The running relay: both supervisor tasks and their shutdown signal.
pub struct CheckRelay {
    publisher: PublisherHandle,
    publisher_state: Arc<RoleState>,
    consumer_state: Arc<RoleState>,
    shutdown_tx: watch::Sender<bool>,
    publisher_task: JoinHandle<()>,
    consumer_task: JoinHandle<()>,
}

impl CheckRelay {
    /// Spawn the publisher and consumer supervisors.
    ///
    /// Must be called from within a tokio runtime. Returns immediately; the
    /// tasks connect in the background.
    #[must_use]
    pub fn start(
        config: RelayConfig,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let config = Arc::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);

        let publisher_state = Arc::new(RoleState::new(Role::Publisher));
        let consumer_state = Arc::new(RoleState::new(Role::Consumer));

        let reply_to = Some(config.consumer_binding_key.to_string()).filter(|k| !k.is_empty());
        let publisher = PublisherHandle {
            requests: requests_tx,
            state: Arc::clone(&publisher_state),
            routing_key: config.publisher_routing_key.to_string(),
            reply_to,
        };

        let publisher_task = tokio::spawn(
            PublisherTask {
                config: Arc::clone(&config),
                state: Arc::clone(&publisher_state),
                metrics: Arc::clone(&metrics),
                requests: requests_rx,
                shutdown: shutdown_rx.clone(),
            }
            .run(),
        );
        let consumer_task = tokio::spawn(
            ConsumerTask {
                config,
                state: Arc::clone(&consumer_state),
                metrics,
                handler,
                shutdown: shutdown_rx,
            }
            .run(),
        );

        info!("check relay started");

        Self {
            publisher,
            publisher_state,
            consumer_state,
            shutdown_tx,
            publisher_task,
            consumer_task,
        }
    }

    #[must_use]
    pub fn publisher(&self) -> PublisherHandle {
        self.publisher.clone()
    }

    #[must_use]
    pub fn is_publisher_connected(&self) -> bool {
        self.publisher_state.is_connected()
    }

    #[must_use]
    pub fn is_consumer_connected(&self) -> bool {
        self.consumer_state.is_connected()
    }

    #[must_use]
    pub fn publisher_state(&self) -> &RoleState {
        &self.publisher_state
    }

    #[must_use]
    pub fn consumer_state(&self) -> &RoleState {
        &self.consumer_state
    }

    /// Stop both supervisors and wait for them to finish disconnecting.
    pub async fn shutdown(self) {
        info!("check relay shutting down");
        let _ = self.shutdown_tx.send(true);

        for (role, task) in [
            (Role::Publisher, self.publisher_task),
            (Role::Consumer, self.consumer_task),
        ] {
            if let Err(e) = task.await {
                error!(role = %role, error = %e, "supervisor task failed");
            }
        }
        info!("check relay stopped");
    }
}

impl fmt::Debug for CheckRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRelay")
            .field("publisher_connected", &self.is_publisher_connected())
            .field("consumer_connected", &self.is_consumer_connected())
            .finish_non_exhaustive()
    }
}

/// Resolves once shutdown has been signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Why a connected role stopped.
enum Stop {
    Shutdown,
    /// Shutdown arrived while frames were half written. No close handshake
    /// is possible on that connection.
    Interrupted,
    Failed(RelayError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_role_state_flags() {
        let metrics = RelayMetrics::new();
        let state = RoleState::new(Role::Consumer);
        assert!(!state.is_connected());

        state.mark_connected(&metrics);
        assert!(state.is_connected());
        assert_eq!(state.connects(), 1);
        assert_eq!(metrics.connected.with_label_values(&["consumer"]).get(), 1);

        state.mark_disconnected(&metrics);
        state.record_failure();
        assert!(!state.is_connected());
        assert_eq!(state.failures(), 1);
        assert_eq!(metrics.connected.with_label_values(&["consumer"]).get(), 0);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected() {
        let (requests, mut rx) = mpsc::channel(1);
        let handle = PublisherHandle {
            requests,
            state: Arc::new(RoleState::new(Role::Publisher)),
            routing_key: "checks".to_string(),
            reply_to: None,
        };

        let err = handle
            .publish(MessageEnvelope::json("checks", "id", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotConnected));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_requested_on_dropped_sender() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), shutdown_requested(&mut rx))
            .await
            .unwrap();
    }
}
