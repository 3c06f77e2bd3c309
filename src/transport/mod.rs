//! Broker transport abstraction
//!
//! [`Broker`] is the seam between the connection manager and the wire. The
//! manager owns all session policy (state machine, retries, resubscription);
//! a broker implementation only opens a session, performs the four broker
//! operations and reports what happens on the wire as [`BrokerEvent`]s.

use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Something the broker session reported
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Session acknowledged by the broker (ConnAck)
    Connected,
    /// Message published on a subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// Session ended; the sender is dropped right after this event
    Disconnected(String),
}

pub type BrokerEventSender = mpsc::UnboundedSender<BrokerEvent>;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No open broker session")]
    NoSession,
    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Unsubscribe from {topic} failed: {reason}")]
    UnsubscribeFailed { topic: String, reason: String },
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
}

/// One physical broker session at a time
///
/// `open` replaces any previous session. Subscribing to a topic that is
/// already subscribed must be harmless, since the manager replays every
/// active topic after each (re)connection.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Start a new session and stream its events to `events`. Returning `Ok`
    /// only means the attempt started; acknowledgment arrives as
    /// [`BrokerEvent::Connected`].
    async fn open(&self, client_id: &str, events: BrokerEventSender) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Close the current session, if any
    async fn close(&self) -> Result<(), BrokerError>;
}
