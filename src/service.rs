//! The messaging service
//!
//! One [`MessagingService`] per process owns the shared connection, the
//! topic registry and the publish gateway. Consumers attach and detach
//! listeners at any time; only [`MessagingService::shutdown`] closes the
//! connection.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use topicmux::config::BusConfig;
//! use topicmux::protocol::user_messages_topic;
//! use topicmux::service::MessagingService;
//! use topicmux::testing::MockBroker;
//!
//! # tokio_test::block_on(async {
//! let service = MessagingService::new(&BusConfig::default(), Arc::new(MockBroker::new()))?;
//! service.start(None).await;
//!
//! let handle = service.add_message_listener(&user_messages_topic("42"), |payload| {
//!     println!("received {payload}");
//! })?;
//! // ...
//! handle.dispose();
//! service.shutdown().await;
//! # Ok::<(), topicmux::error::BusError>(())
//! # });
//! ```

use crate::config::BusConfig;
use crate::connection::{ConnectionListenerHandle, ConnectionManager, ConnectionState};
use crate::error::BusResult;
use crate::protocol::{EnvelopeSchema, MessageValidator, OutboundEnvelope, Validation};
use crate::publish::{PublishError, PublishGateway};
use crate::subscription::{MessageListenerHandle, SubscriptionRegistry};
use crate::transport::mqtt::MqttBroker;
use crate::transport::Broker;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct MessagingService {
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    gateway: PublishGateway,
    validator: Arc<MessageValidator>,
    started: AtomicBool,
}

impl MessagingService {
    /// Wire the components around `broker`. Must be called inside a tokio
    /// runtime; nothing connects until [`start`](Self::start) or the first
    /// listener.
    pub fn new(config: &BusConfig, broker: Arc<dyn Broker>) -> BusResult<Self> {
        let connection =
            ConnectionManager::new(broker, &config.broker, config.reconnect.clone());
        let registry = SubscriptionRegistry::new(connection.clone(), &config.delivery)?;
        let validator = Arc::new(MessageValidator::new()?);
        let gateway = PublishGateway::new(connection.clone(), validator.clone());

        Ok(Self {
            connection,
            registry,
            gateway,
            validator,
            started: AtomicBool::new(false),
        })
    }

    /// Service over MQTT, configured from `config.broker`
    pub fn from_config(config: &BusConfig) -> BusResult<Self> {
        config.validate()?;
        let broker = MqttBroker::new(config.broker.clone())?;
        Self::new(config, Arc::new(broker))
    }

    /// Connect the shared session. Calling it again only reports whether
    /// the service is connected.
    pub async fn start(&self, client_id: Option<String>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Messaging service already started");
            return self.connection.is_connected();
        }

        info!(broker = %self.connection.broker_url(), "Starting messaging service");
        self.connection.connect(client_id).await
    }

    /// Close the connection and stop reconnecting. Listeners stay registered
    /// and their topics are restored if the service is started again.
    pub async fn shutdown(&self) {
        info!("Shutting down messaging service");
        self.connection.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn add_message_listener<F>(
        &self,
        topic: &str,
        callback: F,
    ) -> BusResult<MessageListenerHandle>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Ok(self.registry.add_message_listener(topic, callback)?)
    }

    pub fn add_connection_listener<F>(&self, callback: F) -> ConnectionListenerHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.connection.add_connection_listener(callback)
    }

    pub async fn publish_message(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.gateway.publish_message(topic, payload).await
    }

    pub async fn publish_envelope(&self, topic: &str, envelope: &OutboundEnvelope) -> bool {
        self.gateway.publish_envelope(topic, envelope).await
    }

    pub fn last_publish_error(&self) -> Option<PublishError> {
        self.gateway.last_error()
    }

    pub fn validate<S: EnvelopeSchema>(&self, data: &Value) -> BusResult<Validation<S>> {
        Ok(self.validator.validate::<S>(data)?)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &PublishGateway {
        &self.gateway
    }
}
