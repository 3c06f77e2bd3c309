//! Test helpers and utilities for integration tests

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use topicmux::config::{BrokerSection, BusConfig, ReconnectSection};
use topicmux::connection::ConnectionState;
use topicmux::service::MessagingService;
use topicmux::testing::MockBroker;

/// Configuration with short timeouts so reconnection tests finish quickly
#[allow(dead_code)]
pub fn fast_config() -> BusConfig {
    BusConfig {
        broker: BrokerSection {
            connect_timeout_ms: 200,
            ..Default::default()
        },
        reconnect: ReconnectSection {
            initial_delay_ms: 10,
            max_delay_ms: 40,
            multiplier: 2,
            max_attempts: None,
        },
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn service_with(broker: Arc<MockBroker>) -> MessagingService {
    MessagingService::new(&fast_config(), broker).unwrap()
}

/// Listener that forwards every payload into a channel
#[allow(dead_code)]
pub fn channel_listener() -> (
    mpsc::UnboundedReceiver<String>,
    impl Fn(&str) + Send + Sync + 'static,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (rx, move |payload: &str| {
        let _ = tx.send(payload.to_string());
    })
}

/// Next delivered payload, or None after two seconds
#[allow(dead_code)]
pub async fn next_payload(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

#[allow(dead_code)]
pub async fn wait_for_state(service: &MessagingService, expected: ConnectionState) {
    let mut rx = service.connection().watch_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        while *rx.borrow_and_update() != expected {
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {expected}"));
}

/// Poll `broker` until it has recorded subscriptions to all of `topics`
#[allow(dead_code)]
pub async fn wait_for_subscriptions(broker: &MockBroker, topics: &[&str]) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let subscribed = broker.get_subscribed().await;
            if topics.iter().all(|t| subscribed.iter().any(|s| s == t)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("broker never subscribed to {topics:?}"));
}
