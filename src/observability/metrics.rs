//! Thread-safe metrics collection
//!
//! Atomic counters for connection lifecycle, inbound delivery and outbound
//! publishing. One global collector per process.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    connection_start_time: AtomicU64,
    state_transitions: AtomicU64,
    connection_state: Mutex<String>,

    // Inbound
    messages_received: AtomicU64,
    messages_delivered: AtomicU64,
    messages_unrouted: AtomicU64,
    messages_rejected: AtomicU64,
    listener_panics: AtomicU64,

    // Subscriptions
    broker_subscribes: AtomicU64,
    broker_unsubscribes: AtomicU64,
    subscribe_failures: AtomicU64,

    // Outbound
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            connection_state: Mutex::new("disconnected".to_string()),
            messages_received: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_unrouted: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
            broker_subscribes: AtomicU64::new(0),
            broker_unsubscribes: AtomicU64::new(0),
            subscribe_failures: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connection_state(&self, state: &str) {
        if let Ok(mut current) = self.connection_state.lock() {
            if *current != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current = state.to_string();
            }
        }
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_delivered(&self, count: u64) {
        self.messages_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn message_unrouted(&self) {
        self.messages_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn listener_panicked(&self) {
        self.listener_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_subscribed(&self) {
        self.broker_subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_unsubscribed(&self) {
        self.broker_unsubscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_failed(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let started = self.connection_start_time.load(Ordering::Relaxed);
        let connection_state = self
            .connection_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            timestamp: now,
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                state: connection_state,
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                connected_for_secs: if started > 0 { now.saturating_sub(started) } else { 0 },
            },
            delivery: DeliveryMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                delivered: self.messages_delivered.load(Ordering::Relaxed),
                unrouted: self.messages_unrouted.load(Ordering::Relaxed),
                rejected: self.messages_rejected.load(Ordering::Relaxed),
                listener_panics: self.listener_panics.load(Ordering::Relaxed),
                broker_subscribes: self.broker_subscribes.load(Ordering::Relaxed),
                broker_unsubscribes: self.broker_unsubscribes.load(Ordering::Relaxed),
                subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            },
            publishing: PublishMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                failures: self.publish_failures.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connection: ConnectionMetrics,
    pub delivery: DeliveryMetrics,
    pub publishing: PublishMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub state: String,
    pub attempts: u64,
    pub established: u64,
    pub failures: u64,
    pub reconnect_attempts: u64,
    pub state_transitions: u64,
    pub connected_for_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetrics {
    pub received: u64,
    pub delivered: u64,
    pub unrouted: u64,
    pub rejected: u64,
    pub listener_panics: u64,
    pub broker_subscribes: u64,
    pub broker_unsubscribes: u64,
    pub subscribe_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub published: u64,
    pub failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
