//! MQTT session options
//!
//! Pure translation from [`BrokerSection`] to rumqttc options.

use crate::config::BrokerSection;
use crate::transport::BrokerError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Large enough for form and list messages with attachments metadata
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// `(host, port, tls)` for a broker URL
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), BrokerError> {
    let url = Url::parse(broker_url).map_err(|_| BrokerError::InvalidUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(BrokerError::InvalidUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .ok_or_else(|| BrokerError::InvalidUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok((host.to_string(), port, tls))
}

pub fn configure_mqtt_options(
    client_id: &str,
    config: &BrokerSection,
) -> Result<MqttOptions, BrokerError> {
    let (host, port, tls) = parse_broker_url(&config.url)?;
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some((username, password)) = config.credentials() {
        mqtt_options.set_credentials(&username, &password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}
