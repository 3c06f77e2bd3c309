//! topicmux
//!
//! A shared publish/subscribe client: many independent consumers listen on
//! broker topics through one MQTT session, with reference-counted
//! subscriptions, automatic reconnection and base64/JSON payload decoding.
//!
//! # Overview
//!
//! - [`connection`]: the single broker session, its state machine and
//!   reconnection with exponential backoff
//! - [`subscription`]: topic reference counting and message fan-out
//! - [`publish`]: fail-fast publishing of raw payloads and envelopes
//! - [`protocol`]: envelope types, topic conventions and schema validation
//! - [`codec`]: payload decoding before delivery
//! - [`api`]: bearer-authenticated REST client for the messaging backend
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use topicmux::{BusConfig, MessagingService};
//! use topicmux::testing::MockBroker;
//!
//! # tokio_test::block_on(async {
//! let broker = Arc::new(MockBroker::new());
//! let service = MessagingService::new(&BusConfig::default(), broker.clone()).unwrap();
//! assert!(service.start(None).await);
//!
//! let handle = service
//!     .add_message_listener("user-42-messages", |payload| println!("{payload}"))
//!     .unwrap();
//! service.registry().flush().await;
//! assert_eq!(broker.get_subscribed().await, vec!["user-42-messages"]);
//!
//! handle.dispose();
//! service.shutdown().await;
//! # });
//! ```

pub mod api;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod observability;
pub mod protocol;
pub mod publish;
pub mod service;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use api::{ApiClient, ApiClientConfig, ApiError};
pub use codec::PayloadDecoder;
pub use config::*;
pub use connection::{ConnectionListenerHandle, ConnectionManager, ConnectionState};
pub use error::{BusError, BusResult};
pub use protocol::*;
pub use publish::{PublishError, PublishGateway};
pub use service::MessagingService;
pub use subscription::{MessageListenerHandle, SubscriptionRegistry};
pub use transport::mqtt::MqttBroker;
pub use transport::{Broker, BrokerError, BrokerEvent};
