//! rumqttc-backed [`Broker`]
//!
//! Each `open` builds a fresh client and event loop and spawns a poll task
//! that forwards routed events until the session ends. Reconnection policy
//! lives in the connection manager; this type never retries on its own.

use super::connection::configure_mqtt_options;
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::BrokerSection;
use crate::transport::{Broker, BrokerError, BrokerEvent, BrokerEventSender};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request queue capacity between the client handle and its event loop
const REQUEST_CAPACITY: usize = 64;

struct Session {
    client: AsyncClient,
    poll_handle: JoinHandle<()>,
}

pub struct MqttBroker {
    config: BrokerSection,
    session: Mutex<Option<Session>>,
}

impl MqttBroker {
    pub fn new(config: BrokerSection) -> Result<Self, BrokerError> {
        // fail on a bad URL at construction rather than on first connect
        super::connection::parse_broker_url(&config.url)?;
        Ok(Self {
            config,
            session: Mutex::new(None),
        })
    }

    pub fn broker_url(&self) -> &str {
        &self.config.url
    }

    async fn poll_session(mut event_loop: EventLoop, events: BrokerEventSender, client_id: String) {
        debug!(client_id = %client_id, "MQTT poll loop started");
        loop {
            let route = match event_loop.poll().await {
                Ok(event) => MessageHandler::route_mqtt_event(&event),
                Err(e) => MessageHandler::route_poll_error(&e),
            };

            match route {
                EventRoute::Forward(event) => {
                    if events.send(event).is_err() {
                        debug!("event receiver dropped, stopping poll loop");
                        break;
                    }
                }
                EventRoute::Terminal(event) => {
                    let _ = events.send(event);
                    break;
                }
                EventRoute::Infrastructure(description) => {
                    tracing::trace!(target: "mqtt_transport", "MQTT event: {}", description);
                }
                EventRoute::Outgoing => {}
            }
        }
        debug!(client_id = %client_id, "MQTT poll loop stopped");
    }

    async fn client(&self) -> Result<AsyncClient, BrokerError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(BrokerError::NoSession)
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn open(&self, client_id: &str, events: BrokerEventSender) -> Result<(), BrokerError> {
        let mqtt_options = configure_mqtt_options(client_id, &self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let poll_handle = tokio::spawn(Self::poll_session(
            event_loop,
            events,
            client_id.to_string(),
        ));

        let previous = self.session.lock().await.replace(Session {
            client,
            poll_handle,
        });
        if let Some(previous) = previous {
            debug!("replacing previous MQTT session");
            previous.poll_handle.abort();
        }

        info!(broker = %self.config.url, client_id = %client_id, "MQTT session opened");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client()
            .await?
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.client()
            .await?
            .unsubscribe(topic)
            .await
            .map_err(|e| BrokerError::UnsubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client()
            .await?
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.client.disconnect().await {
            warn!("MQTT disconnect request failed: {}", e);
        }

        // let the poll loop flush the Disconnect packet before giving up on it
        let mut poll_handle = session.poll_handle;
        if tokio::time::timeout(Duration::from_secs(2), &mut poll_handle)
            .await
            .is_err()
        {
            warn!("MQTT poll loop did not stop in time, aborting");
            poll_handle.abort();
        }

        info!("MQTT session closed");
        Ok(())
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.poll_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config(url: &str) -> BrokerSection {
        BrokerSection {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        assert!(matches!(
            MqttBroker::new(config("invalid-url")),
            Err(BrokerError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_without_session_fail() {
        let broker = MqttBroker::new(config("mqtt://localhost:1883")).unwrap();
        assert!(matches!(
            broker.subscribe("user-1-messages").await,
            Err(BrokerError::NoSession)
        ));
        assert!(matches!(
            broker.publish("user-1-messages", b"x".to_vec()).await,
            Err(BrokerError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_close_without_session_is_noop() {
        let broker = MqttBroker::new(config("mqtt://localhost:1883")).unwrap();
        assert!(broker.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_unreachable_broker_reports_disconnect() {
        // nothing listens on port 1 locally; the poll loop fails fast
        let broker = MqttBroker::new(config("mqtt://127.0.0.1:1")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        broker.open("test-unreachable", tx).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("poll loop should report promptly");
        assert!(matches!(event, Some(BrokerEvent::Disconnected(_))));
        broker.close().await.unwrap();
    }
}
