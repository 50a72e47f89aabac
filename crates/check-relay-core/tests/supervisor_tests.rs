//! Reconnect supervisor tests.
//!
//! Runs a full [`CheckRelay`] against the mock broker and checks that both
//! roles connect, survive broker failures and stop promptly.

use std::time::Duration;

use check_relay_core::broker::MessageEnvelope;
use check_relay_core::check::{CheckRequest, CheckResult};
use check_relay_core::error::RelayError;
use check_relay_core::supervisor::CheckRelay;
use check_relay_core::testing::{reply_codes, RelayTestHarness, TestHarnessBuilder};

const WAIT: Duration = Duration::from_secs(5);

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Run other tasks without letting a paused clock move.
async fn settle<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..1_000 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}

async fn wait_connected(relay: &CheckRelay) -> bool {
    wait_for(WAIT, || relay.is_publisher_connected() && relay.is_consumer_connected()).await
}

#[tokio::test]
async fn test_relay_connects_both_roles() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();

    assert!(wait_connected(&relay).await);
    assert_eq!(harness.broker.connections_total(), 2);
    assert_eq!(harness.broker.consumers_active(), 1);
    assert_eq!(relay.publisher_state().connects(), 1);
    assert_eq!(
        harness.metrics.connected.with_label_values(&["publisher"]).get(),
        1
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn test_publish_check_through_relay() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    let check = CheckRequest::service("web01", "HTTP", "/usr/lib/nagios/plugins/check_http -H web01");
    relay.publisher().publish_check(&check).await.unwrap();

    let published = harness.wait_for_published(1, WAIT).await;
    assert_eq!(published.len(), 1);
    let message = &published[0];
    assert_eq!(message.routing_key, "checks");
    assert_eq!(message.properties.reply_to.as_deref(), Some("check_results"));
    assert_eq!(
        message.properties.correlation_id.as_deref(),
        Some(check.correlation_id().as_str())
    );

    let body: serde_json::Value = serde_json::from_slice(&message.body).unwrap();
    assert_eq!(body["type"], "service");
    assert_eq!(body["host_name"], "web01");
    assert_eq!(body["service_description"], "HTTP");

    assert_eq!(harness.metrics.published_total.get(), 1.0);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_consumer_hands_results_to_handler() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    harness.broker.deliver_json(
        r#"{"host_name":"web01","service_description":"HTTP","return_code":0,"start_time":1700000000.1,"finish_time":1700000000.4,"output":"HTTP OK"}"#,
    );
    harness.broker.deliver(Some("text/plain"), None, "not json");

    let received = harness.wait_for_received(1, WAIT).await;
    assert_eq!(received.len(), 1);
    let result = CheckResult::from_json(&received[0]).unwrap();
    assert_eq!(result.host_name, "web01");
    assert!(result.is_service_check());
    assert_eq!(result.output.as_deref(), Some("HTTP OK"));

    assert!(wait_for(WAIT, || harness.metrics.deliveries_rejected.get() >= 1.0).await);
    assert_eq!(harness.received().len(), 1);

    relay.shutdown().await;
}

/// A synthesized orphaned result survives the trip through the broker.
#[tokio::test]
async fn test_orphaned_result_round_trips_through_consumer() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    let orphaned = CheckResult::orphaned("web01", Some("HTTP".to_string()));
    harness
        .broker
        .deliver_json(serde_json::to_vec(&orphaned).unwrap());

    let received = harness.wait_for_received(1, WAIT).await;
    assert_eq!(received.len(), 1);
    let result = CheckResult::from_json(&received[0]).unwrap();
    assert_eq!(result.host_name, "web01");
    assert_eq!(result.return_code, 2);
    assert_eq!(result.output.as_deref(), Some("check is orphaned (no workers running?)"));
    assert_eq!(result.reschedule_check, Some(true));
    assert_eq!(result.early_timeout, Some(false));

    relay.shutdown().await;
}

/// With no broker listening, both roles keep retrying after the configured wait.
#[tokio::test]
async fn test_retries_while_broker_unreachable() {
    let mut harness = RelayTestHarness::new().await;
    harness.config.port = unused_port();
    let relay = harness.start_relay();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let attempts = harness
        .metrics
        .connect_attempts
        .with_label_values(&["publisher"])
        .get();
    assert!((2.0..=4.0).contains(&attempts), "attempts = {attempts}");
    assert!(
        harness
            .metrics
            .connect_failures
            .with_label_values(&["consumer", "socket"])
            .get()
            >= 2.0
    );
    assert!(!relay.is_publisher_connected());
    assert!(!relay.is_consumer_connected());

    let err = relay
        .publisher()
        .publish_check(&CheckRequest::host("web01", "check_ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotConnected));

    tokio::time::timeout(Duration::from_secs(2), relay.shutdown())
        .await
        .unwrap();
}

/// The next attempt starts exactly `retry_wait_time` after a failure.
#[tokio::test(start_paused = true)]
async fn test_retry_after_exact_wait() {
    let mut harness = TestHarnessBuilder::new().retry_wait_time(5).build().await;
    harness.config.port = unused_port();
    let relay = harness.start_relay();

    let attempts = || {
        harness
            .metrics
            .connect_attempts
            .with_label_values(&["publisher"])
            .get()
    };

    assert!(settle(|| relay.publisher_state().failures() == 1).await);
    assert_eq!(attempts(), 1.0);

    tokio::time::advance(Duration::from_secs(5) - Duration::from_millis(1)).await;
    settle(|| false).await;
    assert_eq!(attempts(), 1.0);
    assert_eq!(relay.publisher_state().failures(), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(settle(|| relay.publisher_state().failures() == 2).await);
    assert_eq!(attempts(), 2.0);

    relay.shutdown().await;
}

/// A refused login is retried until the broker accepts it.
#[tokio::test]
async fn test_recovers_after_login_refused() {
    let harness = RelayTestHarness::new().await;
    harness.broker.set_reject_login(true);
    let relay = harness.start_relay();

    assert!(
        wait_for(WAIT, || relay.publisher_state().failures() >= 1).await,
        "login refusal not observed"
    );
    assert!(!relay.is_publisher_connected());

    harness.broker.set_reject_login(false);
    assert!(wait_connected(&relay).await);
    assert!(
        harness
            .metrics
            .connect_failures
            .with_label_values(&["publisher", "login"])
            .get()
            >= 1.0
    );

    relay.shutdown().await;
}

/// A broker-initiated close drops both roles, which reconnect after the wait.
#[tokio::test]
async fn test_reconnects_after_broker_close() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    harness
        .broker
        .close_connections(reply_codes::CONNECTION_FORCED, "CONNECTION_FORCED - broker restart");

    assert!(wait_for(WAIT, || !relay.is_publisher_connected()).await);
    assert!(
        wait_for(WAIT, || harness.broker.connections_total() >= 4).await,
        "relay did not reconnect"
    );
    assert!(wait_connected(&relay).await);
    assert_eq!(relay.publisher_state().connects(), 2);
    assert_eq!(relay.consumer_state().connects(), 2);

    relay
        .publisher()
        .publish_check(&CheckRequest::host("web01", "check_ping"))
        .await
        .unwrap();
    assert_eq!(harness.wait_for_published(1, WAIT).await.len(), 1);

    harness.broker.deliver_json(
        r#"{"host_name":"web01","return_code":0,"start_time":1,"finish_time":2}"#,
    );
    assert_eq!(harness.wait_for_received(1, WAIT).await.len(), 1);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_dropped_socket() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    harness.broker.drop_connections();

    assert!(
        wait_for(WAIT, || harness.broker.connections_total() >= 4).await,
        "relay did not reconnect"
    );
    assert!(wait_connected(&relay).await);
    assert!(relay.consumer_state().failures() >= 1);

    relay.shutdown().await;
}

/// Shutdown closes both connections with a handshake.
#[tokio::test]
async fn test_shutdown_disconnects_cleanly() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    tokio::time::timeout(WAIT, relay.shutdown()).await.unwrap();

    assert!(harness.broker.wait_until(WAIT, |b| b.connections_active() == 0).await);
    let closes = harness.broker.get_calls_for_method("connection.close").await;
    assert_eq!(closes.len(), 2);
    let channel_closes = harness.broker.get_calls_for_method("channel.close").await;
    assert_eq!(channel_closes.len(), 2);
    assert_eq!(
        harness.metrics.connected.with_label_values(&["consumer"]).get(),
        0
    );
}

/// Shutdown interrupts the retry wait instead of sleeping it out.
#[tokio::test]
async fn test_shutdown_interrupts_backoff() {
    let mut harness = TestHarnessBuilder::new().retry_wait_time(30).build().await;
    harness.config.port = unused_port();
    let relay = harness.start_relay();

    tokio::time::sleep(Duration::from_millis(200)).await;
    tokio::time::timeout(Duration::from_secs(1), relay.shutdown())
        .await
        .expect("shutdown waited out the retry interval");
}

/// A publish the broker has stopped reading does not hold up shutdown.
#[tokio::test]
async fn test_shutdown_interrupts_stalled_publish() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);
    harness.broker.set_stall_publishers(true);

    let publisher = relay.publisher();
    let envelope = MessageEnvelope::json("checks", "stalled", vec![b' '; 32 * 1024 * 1024]);
    let pending = tokio::spawn(async move { publisher.publish(envelope).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pending.is_finished(), "publish finished against a broker that stopped reading");

    tokio::time::timeout(WAIT, relay.shutdown())
        .await
        .expect("shutdown blocked behind a stalled publish");
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RelayError::Shutdown)), "got {result:?}");
}

/// Publishing after shutdown fails instead of hanging.
#[tokio::test]
async fn test_publish_after_shutdown() {
    let harness = RelayTestHarness::new().await;
    let relay = harness.start_relay();
    assert!(wait_connected(&relay).await);

    let publisher = relay.publisher();
    relay.shutdown().await;

    let err = publisher
        .publish_check(&CheckRequest::host("web01", "check_ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotConnected | RelayError::Shutdown));
}
