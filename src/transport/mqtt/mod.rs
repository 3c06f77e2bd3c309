//! MQTT v5 broker backed by rumqttc
//!
//! - [`connection`] - broker URL parsing and session options
//! - [`message_handler`] - pure routing of rumqttc events to
//!   [`BrokerEvent`](crate::transport::BrokerEvent)
//! - [`client`] - the [`MqttBroker`] session and its poll task
//!
//! ```rust,no_run
//! use topicmux::config::BrokerSection;
//! use topicmux::transport::mqtt::MqttBroker;
//!
//! let broker = MqttBroker::new(BrokerSection {
//!     url: "mqtt://localhost:1883".to_string(),
//!     ..Default::default()
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttBroker;
pub use connection::{configure_mqtt_options, parse_broker_url};
pub use message_handler::{EventRoute, MessageHandler};
