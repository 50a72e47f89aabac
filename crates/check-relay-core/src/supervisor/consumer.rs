//! Consumer supervisor task.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerConnection, DeliveryReader, MessageHandler};
use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;

use super::{shutdown_requested, Role, RoleState, Stop};

const ROLE: Role = Role::Consumer;

pub(super) struct ConsumerTask {
    pub(super) config: Arc<RelayConfig>,
    pub(super) state: Arc<RoleState>,
    pub(super) metrics: Arc<RelayMetrics>,
    pub(super) handler: Arc<dyn MessageHandler>,
    pub(super) shutdown: watch::Receiver<bool>,
}

impl ConsumerTask {
    #[instrument(name = "consumer", skip_all, fields(role = ROLE.as_str()))]
    pub(super) async fn run(mut self) {
        info!("consumer supervisor started");
        let reader = DeliveryReader::new();

        while let Some(mut conn) = self.connect().await {
            self.state.mark_connected(&self.metrics);
            info!(
                address = %conn.address(),
                queue = conn.queue().unwrap_or(""),
                "consumer connected"
            );

            let stop = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => Stop::Shutdown,
                cause = conn.consume(&reader, self.handler.as_ref(), &self.metrics) => Stop::Failed(cause),
            };
            self.state.mark_disconnected(&self.metrics);

            match stop {
                Stop::Shutdown | Stop::Interrupted => {
                    if let Err(e) = conn.disconnect().await {
                        debug!(error = %e, "consumer disconnect failed");
                    }
                    break;
                }
                Stop::Failed(cause) => {
                    self.state.record_failure();
                    warn!(error = %cause, "consumer connection lost");
                    conn.abort(&cause).await;
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        info!("consumer supervisor stopped");
    }

    async fn connect(&mut self) -> Option<BrokerConnection> {
        loop {
            let desc = self.config.consumer_descriptor();
            let binding = self.config.queue_binding();
            self.metrics.record_connect_attempt(ROLE.as_str());

            let attempt = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => return None,
                result = BrokerConnection::connect_consumer(&desc, &binding) => result,
            };

            match attempt {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    self.state.record_failure();
                    self.metrics.record_connect_failure(
                        ROLE.as_str(),
                        e.step().map_or("unknown", |s| s.as_str()),
                    );
                    warn!(
                        address = %desc.address(),
                        error = %e,
                        retry_in_secs = self.config.retry_wait_time,
                        "consumer connect failed"
                    );
                }
            }

            if !self.backoff().await {
                return None;
            }
        }
    }

    async fn backoff(&mut self) -> bool {
        tokio::select! {
            biased;
            () = shutdown_requested(&mut self.shutdown) => false,
            () = tokio::time::sleep(self.config.retry_wait()) => true,
        }
    }
}
