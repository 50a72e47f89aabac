//! Publisher supervisor task.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::broker::BrokerConnection;
use crate::config::RelayConfig;
use crate::error::{RelayError, Step};
use crate::metrics::RelayMetrics;

use super::{shutdown_requested, PublishRequest, Role, RoleState, Stop};

const ROLE: Role = Role::Publisher;

pub(super) struct PublisherTask {
    pub(super) config: Arc<RelayConfig>,
    pub(super) state: Arc<RoleState>,
    pub(super) metrics: Arc<RelayMetrics>,
    pub(super) requests: mpsc::Receiver<PublishRequest>,
    pub(super) shutdown: watch::Receiver<bool>,
}

impl PublisherTask {
    #[instrument(name = "publisher", skip_all, fields(role = ROLE.as_str()))]
    pub(super) async fn run(mut self) {
        info!("publisher supervisor started");

        while let Some(mut conn) = self.connect().await {
            self.state.mark_connected(&self.metrics);
            info!(address = %conn.address(), "publisher connected");

            let stop = self.serve(&mut conn).await;
            self.state.mark_disconnected(&self.metrics);

            match stop {
                Stop::Shutdown => {
                    if let Err(e) = conn.disconnect().await {
                        debug!(error = %e, "publisher disconnect failed");
                    }
                    break;
                }
                Stop::Interrupted => {
                    let cause = RelayError::transport(
                        Step::Publish,
                        io::Error::new(io::ErrorKind::Interrupted, "publish interrupted by shutdown"),
                    );
                    conn.abort(&cause).await;
                    break;
                }
                Stop::Failed(cause) => {
                    self.state.record_failure();
                    warn!(error = %cause, "publisher connection lost");
                    conn.abort(&cause).await;
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(RelayError::Shutdown));
        }
        info!("publisher supervisor stopped");
    }

    /// Connect, retrying after every failure. `None` once shutdown is
    /// signalled.
    async fn connect(&mut self) -> Option<BrokerConnection> {
        loop {
            let desc = self.config.publisher_descriptor();
            self.metrics.record_connect_attempt(ROLE.as_str());

            let attempt = tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => return None,
                result = BrokerConnection::connect(&desc) => result,
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
                        "publisher connect failed"
                    );
                }
            }

            if !self.backoff().await {
                return None;
            }
        }
    }

    /// Sleep for the retry wait, refusing publish requests meanwhile.
    /// Returns `false` if shutdown was signalled instead.
    async fn backoff(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.config.retry_wait());
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => return false,
                () = &mut sleep => return true,
                Some(request) = self.requests.recv() => {
                    let _ = request.reply.send(Err(RelayError::NotConnected));
                }
            }
        }
    }

    /// Publish requests until the connection fails or shutdown.
    async fn serve(&mut self, conn: &mut BrokerConnection) -> Stop {
        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut self.shutdown) => return Stop::Shutdown,
                cause = conn.closed() => return Stop::Failed(cause),
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        return Stop::Shutdown;
                    };

                    let started = Instant::now();
                    let published = tokio::select! {
                        biased;
                        () = shutdown_requested(&mut self.shutdown) => None,
                        result = conn.publish(&request.envelope) => Some(result),
                    };
                    let Some(published) = published else {
                        debug!(
                            correlation_id = %request.envelope.correlation_id,
                            "publish interrupted by shutdown"
                        );
                        let _ = request.reply.send(Err(RelayError::Shutdown));
                        return Stop::Interrupted;
                    };

                    match published {
                        Ok(()) => {
                            self.metrics.record_publish(
                                request.envelope.body.len(),
                                started.elapsed().as_secs_f64(),
                            );
                            let _ = request.reply.send(Ok(()));
                        }
                        Err(e) => {
                            self.metrics.record_publish_error();
                            warn!(
                                correlation_id = %request.envelope.correlation_id,
                                error = %e,
                                "publish failed, dropping connection"
                            );
                            let _ = request.reply.send(Err(e.duplicate()));
                            return Stop::Failed(e);
                        }
                    }
                }
            }
        }
    }
}
