//! Outbound publishing
//!
//! Publishing never queues and never retries: without a confirmed session
//! the call resolves `false` at once. Failures are reported as `false` and
//! the latest one is kept for inspection.

use crate::connection::ConnectionManager;
use crate::observability::metrics;
use crate::protocol::{
    validate_topic, FieldError, MessageValidator, OutboundEnvelope, SchemaKind, Validation,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn, Instrument};

/// Why the last publish returned `false`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PublishError {
    #[error("Not connected to the broker")]
    NotConnected,
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Envelope failed validation with {} error(s)", .0.len())]
    InvalidEnvelope(Vec<FieldError>),
    #[error("Message {0} is already being published")]
    DuplicateMessageId(String),
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("Broker rejected publish: {0}")]
    Broker(String),
}

pub struct PublishGateway {
    connection: Arc<ConnectionManager>,
    validator: Arc<MessageValidator>,
    in_flight: Mutex<HashSet<String>>,
    last_error: Mutex<Option<PublishError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Message id held in the in-flight set until dropped
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    message_id: String,
}

impl<'a> InFlight<'a> {
    fn reserve(set: &'a Mutex<HashSet<String>>, message_id: &str) -> Option<Self> {
        lock(set).insert(message_id.to_string()).then(|| Self {
            set,
            message_id: message_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.message_id);
    }
}

impl PublishGateway {
    pub fn new(connection: Arc<ConnectionManager>, validator: Arc<MessageValidator>) -> Self {
        Self {
            connection,
            validator,
            in_flight: Mutex::new(HashSet::new()),
            last_error: Mutex::new(None),
        }
    }

    /// Publish a raw payload. `false` when not connected or when the broker
    /// call fails; see [`last_error`](Self::last_error).
    pub async fn publish_message(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let payload = payload.into();
        let span = crate::publish_span!(topic = %topic, bytes = payload.len());

        async move {
            if let Err(e) = validate_topic(topic) {
                self.fail(PublishError::InvalidTopic(e.to_string()));
                return false;
            }

            if !self.connection.is_connected() {
                debug!(state = %self.connection.state(), "Publish rejected, not connected");
                self.fail(PublishError::NotConnected);
                return false;
            }

            match self.connection.publish(topic, payload).await {
                Ok(()) => {
                    metrics().message_published();
                    debug!("Message published");
                    true
                }
                Err(e) => {
                    warn!("Publish failed: {}", e);
                    self.fail(PublishError::Broker(e.to_string()));
                    false
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Validate, serialize and publish an envelope. An envelope whose
    /// `messageId` is already being published is rejected.
    pub async fn publish_envelope(&self, topic: &str, envelope: &OutboundEnvelope) -> bool {
        let value = match serde_json::to_value(envelope) {
            Ok(value) => value,
            Err(e) => {
                self.fail(PublishError::Serialization(e.to_string()));
                return false;
            }
        };

        if let Validation::Invalid(errors) =
            self.validator.validate_kind(SchemaKind::Outbound, &value)
        {
            warn!(
                message_id = %envelope.message_id,
                errors = ?errors,
                "Outbound envelope failed validation"
            );
            self.fail(PublishError::InvalidEnvelope(errors));
            return false;
        }

        let Some(_reservation) = InFlight::reserve(&self.in_flight, &envelope.message_id) else {
            warn!(message_id = %envelope.message_id, "Duplicate in-flight message id");
            self.fail(PublishError::DuplicateMessageId(envelope.message_id.clone()));
            return false;
        };

        self.publish_message(topic, value.to_string()).await
    }

    pub fn last_error(&self) -> Option<PublishError> {
        lock(&self.last_error).clone()
    }

    pub fn clear_last_error(&self) {
        lock(&self.last_error).take();
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    fn fail(&self, error: PublishError) {
        metrics().publish_failed();
        *lock(&self.last_error) = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerSection, ReconnectSection};
    use crate::protocol::OutboundMessage;
    use crate::testing::MockBroker;

    fn gateway(broker: Arc<MockBroker>) -> (Arc<ConnectionManager>, PublishGateway) {
        let connection = ConnectionManager::new(
            broker,
            &BrokerSection::default(),
            ReconnectSection::default(),
        );
        let validator = Arc::new(MessageValidator::new().unwrap());
        (connection.clone(), PublishGateway::new(connection, validator))
    }

    fn envelope() -> OutboundEnvelope {
        OutboundEnvelope::new(
            "client-1",
            "user-42",
            "bot",
            "web",
            "https://hooks.example.com/in",
            OutboundMessage::text("hello"),
        )
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let broker = Arc::new(MockBroker::new());
        let (_connection, gateway) = gateway(broker.clone());

        assert!(!gateway.publish_message("user-42-messages", "hi").await);
        assert_eq!(gateway.last_error(), Some(PublishError::NotConnected));
        // no lazy connect and no queuing
        assert_eq!(broker.open_count(), 0);
        assert!(broker.get_published().await.is_empty());

        gateway.clear_last_error();
        assert_eq!(gateway.last_error(), None);
    }

    #[tokio::test]
    async fn test_publish_when_connected() {
        let broker = Arc::new(MockBroker::new());
        let (connection, gateway) = gateway(broker.clone());
        assert!(connection.connect(None).await);

        assert!(gateway.publish_message("user-42-messages", "hi").await);
        assert_eq!(
            broker.get_published().await,
            vec![("user-42-messages".to_string(), b"hi".to_vec())]
        );
        assert_eq!(gateway.last_error(), None);
    }

    #[tokio::test]
    async fn test_broker_failure_becomes_false() {
        let broker = Arc::new(MockBroker::new());
        let (connection, gateway) = gateway(broker.clone());
        assert!(connection.connect(None).await);
        broker.set_fail_publishes(true);

        assert!(!gateway.publish_message("user-42-messages", "hi").await);
        assert!(matches!(gateway.last_error(), Some(PublishError::Broker(_))));
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_topic() {
        let broker = Arc::new(MockBroker::new());
        let (connection, gateway) = gateway(broker);
        assert!(connection.connect(None).await);

        assert!(!gateway.publish_message("user/+/messages", "hi").await);
        assert!(matches!(
            gateway.last_error(),
            Some(PublishError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_envelope() {
        let broker = Arc::new(MockBroker::new());
        let (connection, gateway) = gateway(broker.clone());
        assert!(connection.connect(None).await);

        let envelope = envelope();
        assert!(gateway.publish_envelope("user-42-messages", &envelope).await);
        assert_eq!(gateway.in_flight_count(), 0);

        let published = broker.get_published().await;
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["messageId"], envelope.message_id.as_str());
        assert_eq!(body["webhookUrl"], "https://hooks.example.com/in");
        assert_eq!(body["message"]["text"], "hello");
    }

    #[tokio::test]
    async fn test_publish_envelope_rejects_invalid() {
        let broker = Arc::new(MockBroker::new());
        let (connection, gateway) = gateway(broker.clone());
        assert!(connection.connect(None).await);

        let mut envelope = envelope();
        envelope.webhook_url.clear();

        assert!(!gateway.publish_envelope("user-42-messages", &envelope).await);
        match gateway.last_error() {
            Some(PublishError::InvalidEnvelope(errors)) => {
                assert!(errors.iter().any(|e| e.path == "/webhookUrl"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(broker.get_published().await.is_empty());
    }

    #[test]
    fn test_in_flight_reservation() {
        let set = Mutex::new(HashSet::new());

        let first = InFlight::reserve(&set, "m-1");
        assert!(first.is_some());
        assert!(InFlight::reserve(&set, "m-1").is_none());
        assert!(InFlight::reserve(&set, "m-2").is_some());

        drop(first);
        assert!(InFlight::reserve(&set, "m-1").is_some());
    }
}
