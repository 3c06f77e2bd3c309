//! Pure routing of rumqttc events

use crate::transport::BrokerEvent;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// What the poll loop should do with one event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Forward to the manager
    Forward(BrokerEvent),
    /// Forward, then stop polling this session
    Terminal(BrokerEvent),
    /// Broker housekeeping (SubAck, PingResp, ...), logged only
    Infrastructure(String),
    /// Outgoing packet, nothing to do
    Outgoing,
}

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => EventRoute::Forward(BrokerEvent::Connected),
            Event::Incoming(Packet::Publish(publish)) => {
                EventRoute::Forward(BrokerEvent::Message {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                })
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => EventRoute::Terminal(
                BrokerEvent::Disconnected(format!(
                    "broker disconnected: {:?}",
                    disconnect.reason_code
                )),
            ),
            Event::Incoming(other) => EventRoute::Infrastructure(format!("{other:?}")),
            Event::Outgoing(_) => EventRoute::Outgoing,
        }
    }

    /// Event for a poll error; always ends the session
    pub fn route_poll_error(error: &rumqttc::v5::ConnectionError) -> EventRoute {
        EventRoute::Terminal(BrokerEvent::Disconnected(error.to_string()))
    }
}
