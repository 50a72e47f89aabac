//! Check Relay CLI
//!
//! Runs the check relay against an AMQP broker: keeps the publisher and
//! consumer connections alive, logs every check result received and can
//! publish check requests read from standard input.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use check_relay_core::broker::MessageHandler;
use check_relay_core::check::{CheckRequest, CheckResult};
use check_relay_core::config::RelayConfig;
use check_relay_core::metrics::RelayMetrics;
use check_relay_core::supervisor::{CheckRelay, PublisherHandle};

/// Check dispatch relay over AMQP.
#[derive(Parser)]
#[command(name = "check-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON, or YAML by extension).
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9090.
    #[arg(long)]
    metrics_address: Option<String>,

    /// Publish check requests read from stdin, one JSON object per line.
    #[arg(long)]
    stdin_checks: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = RelayConfig::from_file(&args.config)?;

    let level = match args.verbose {
        0 => config.log_level.to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    setup_tracing(&level, config.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %format!("{}:{}", config.host, config.port),
        vhost = %config.vhost,
        publisher_exchange = %config.publisher_exchange,
        consumer_exchange = %config.consumer_exchange,
        retry_wait_time = config.retry_wait_time,
        "starting check relay"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_relay(config, args).await })
}

fn setup_tracing(level: &str, json: bool) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_relay(config: RelayConfig, args: Args) -> anyhow::Result<()> {
    let metrics = Arc::new(RelayMetrics::new());

    if let Some(address) = args.metrics_address {
        let metrics_clone = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&address, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let handler: Arc<dyn MessageHandler> = Arc::new(log_check_result);
    let relay = CheckRelay::start(config, handler, metrics);

    if args.stdin_checks {
        let publisher = relay.publisher();
        tokio::select! {
            () = shutdown_signal() => {}
            () = publish_stdin_checks(publisher) => {
                info!("stdin closed, waiting for shutdown signal");
                shutdown_signal().await;
            }
        }
    } else {
        shutdown_signal().await;
    }

    info!("shutdown signal received, stopping relay");
    relay.shutdown().await;

    info!("relay shutdown complete");
    Ok(())
}

/// Log one consumed check result.
fn log_check_result(body: &str) {
    match CheckResult::from_json(body) {
        Ok(result) => log_result(&result, "check result received"),
        Err(e) => warn!(error = %e, "discarding invalid check result"),
    }
}

fn log_result(result: &CheckResult, message: &str) {
    info!(
        host = %result.host_name,
        service = result.service_description.as_deref().unwrap_or(""),
        return_code = result.return_code,
        start_time = %result.start_time,
        finish_time = %result.finish_time,
        latency = result.latency.unwrap_or(0.0),
        output = result.output.as_deref().unwrap_or(""),
        "{message}"
    );
}

async fn publish_stdin_checks(publisher: PublisherHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read stdin");
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let check: CheckRequest = match serde_json::from_str(line) {
            Ok(check) => check,
            Err(e) => {
                warn!(error = %e, "ignoring invalid check request");
                continue;
            }
        };

        match publisher.publish_check(&check).await {
            Ok(()) => debug!(
                host = %check.host_name,
                correlation_id = %check.correlation_id(),
                "check request published"
            ),
            Err(e) => {
                warn!(host = %check.host_name, error = %e, "check request not published");
                let orphaned =
                    CheckResult::orphaned(check.host_name.clone(), check.service_description.clone());
                log_result(&orphaned, "check orphaned");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<RelayMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut response = Response::new(Full::new(Bytes::new()));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, hyper::Error>(response);
                    }
                    let body = metrics.encode().unwrap_or_default();
                    Ok(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "metrics connection error");
            }
        });
    }
}
