//! Mock implementations for testing
//!
//! [`MockBroker`] records every broker call and lets a test drive the
//! session: acknowledge it, deliver messages, drop it, or make calls fail.

use crate::transport::{Broker, BrokerError, BrokerEvent, BrokerEventSender};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedMessage = (String, Vec<u8>);

/// In-memory broker
#[derive(Debug)]
pub struct MockBroker {
    pub subscribed: Arc<Mutex<Vec<String>>>,
    pub unsubscribed: Arc<Mutex<Vec<String>>>,
    pub published: Arc<Mutex<Vec<PublishedMessage>>>,
    pub opened_client_ids: Arc<Mutex<Vec<String>>>,
    session: Mutex<Option<BrokerEventSender>>,
    auto_ack: AtomicBool,
    open_delay_ms: AtomicU32,
    failing_opens: AtomicU32,
    fail_subscribes: AtomicBool,
    fail_publishes: AtomicBool,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            subscribed: Arc::default(),
            unsubscribed: Arc::default(),
            published: Arc::default(),
            opened_client_ids: Arc::default(),
            session: Mutex::new(None),
            auto_ack: AtomicBool::new(true),
            open_delay_ms: AtomicU32::new(0),
            failing_opens: AtomicU32::new(0),
            fail_subscribes: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }
}

impl MockBroker {
    /// Acknowledges every session as soon as it is opened
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens sessions but never acknowledges them on its own
    pub fn silent() -> Self {
        let broker = Self::default();
        broker.set_auto_ack(false);
        broker
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    /// Delay inside `open`, to widen races in concurrency tests
    pub fn set_open_delay(&self, delay: Duration) {
        let millis = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        self.open_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// The next `count` calls to `open` are refused
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_subscribes(&self, enabled: bool) {
        self.fail_subscribes.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, enabled: bool) {
        self.fail_publishes.store(enabled, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Acknowledge the current session
    pub async fn ack(&self) -> bool {
        self.emit(BrokerEvent::Connected).await
    }

    /// Deliver a message on the current session
    pub async fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.emit(BrokerEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        })
        .await
    }

    /// End the current session as if the network dropped it
    pub async fn drop_connection(&self, reason: &str) -> bool {
        match self.session.lock().await.take() {
            Some(events) => events
                .send(BrokerEvent::Disconnected(reason.to_string()))
                .is_ok(),
            None => false,
        }
    }

    pub async fn get_subscribed(&self) -> Vec<String> {
        self.subscribed.lock().await.clone()
    }

    pub async fn get_unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().await.clone()
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.subscribed.lock().await.clear();
        self.unsubscribed.lock().await.clear();
        self.published.lock().await.clear();
    }

    async fn emit(&self, event: BrokerEvent) -> bool {
        match self.session.lock().await.as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    async fn require_session(&self) -> Result<(), BrokerError> {
        if self.session.lock().await.is_some() {
            Ok(())
        } else {
            Err(BrokerError::NoSession)
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn open(&self, client_id: &str, events: BrokerEventSender) -> Result<(), BrokerError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.opened_client_ids
            .lock()
            .await
            .push(client_id.to_string());

        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }

        let refused = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::ConnectionFailed(
                "mock broker refused connection".to_string(),
            ));
        }

        if self.auto_ack.load(Ordering::SeqCst) {
            let _ = events.send(BrokerEvent::Connected);
        }
        *self.session.lock().await = Some(events);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.require_session().await?;
        if self.fail_subscribes.load(Ordering::SeqCst) {
            return Err(BrokerError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "mock subscribe failure".to_string(),
            });
        }
        self.subscribed.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.require_session().await?;
        self.unsubscribed.lock().await.push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.require_session().await?;
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: "mock publish failure".to_string(),
            });
        }
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.session.lock().await.take();
        Ok(())
    }
}
