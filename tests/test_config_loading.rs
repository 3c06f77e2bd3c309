//! Configuration loading and validation tests
//!
//! Tests what a caller observes when loading a file: defaults filled in,
//! invalid values rejected, and secrets resolved from the environment.

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use topicmux::config::{BusConfig, ConfigError};

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_minimal_config_fills_defaults() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://broker.local:1883"
"#,
    );

    let config = BusConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.broker.url, "mqtt://broker.local:1883");
    assert_eq!(config.broker.client_id_prefix, "topicmux");
    assert_eq!(config.broker.connect_timeout(), Duration::from_secs(10));
    assert_eq!(config.reconnect.initial_delay_ms, 500);
    assert_eq!(config.reconnect.max_delay_ms, 30_000);
    assert_eq!(config.reconnect.max_attempts, None);
    assert!(!config.delivery.validate_inbound);
    assert!(config.api.is_none());
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BusConfig::load_from_file(std::path::Path::new("/nonexistent/topicmux.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[broker\nurl = ");
    let result = BusConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_broker_section_is_rejected() {
    let file = write_config(
        r#"
[reconnect]
initial_delay_ms = 100
"#,
    );
    assert!(matches!(
        BusConfig::load_from_file(file.path()),
        Err(ConfigError::TomlParse(_))
    ));
}

#[test]
fn test_non_mqtt_scheme_is_rejected() {
    let file = write_config(
        r#"
[broker]
url = "http://broker.local:1883"
"#,
    );
    assert!(matches!(
        BusConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidBrokerUrl(_))
    ));
}

#[test]
fn test_inverted_backoff_bounds_are_rejected() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://broker.local:1883"

[reconnect]
initial_delay_ms = 5000
max_delay_ms = 1000
"#,
    );
    assert!(matches!(
        BusConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_zero_max_attempts_is_rejected() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://broker.local:1883"

[reconnect]
max_attempts = 0
"#,
    );
    assert!(matches!(
        BusConfig::load_from_file(file.path()),
        Err(ConfigError::InvalidConfig(_))
    ));
}

#[test]
fn test_credentials_resolve_from_environment() {
    std::env::set_var("TOPICMUX_IT_BROKER_USER", "svc-web");
    std::env::set_var("TOPICMUX_IT_BROKER_PASS", "hunter2");
    let file = write_config(
        r#"
[broker]
url = "mqtts://broker.example.com:8883"
username_env = "TOPICMUX_IT_BROKER_USER"
password_env = "TOPICMUX_IT_BROKER_PASS"
"#,
    );

    let config = BusConfig::load_from_file(file.path()).unwrap();
    assert_eq!(
        config.broker.credentials(),
        Some(("svc-web".to_string(), "hunter2".to_string()))
    );
}

#[test]
fn test_unset_username_means_anonymous() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://broker.local:1883"
username_env = "TOPICMUX_IT_DEFINITELY_UNSET"
"#,
    );

    let config = BusConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.broker.credentials(), None);
}

#[test]
fn test_config_round_trips_through_toml() {
    let file = write_config(
        r#"
[broker]
url = "mqtt://broker.local:1883"
client_id_prefix = "mobile"

[api]
base_url = "https://api.example.com/v1"
public_paths = ["/public"]
"#,
    );
    let config = BusConfig::load_from_file(file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    assert_eq!(BusConfig::from_toml_str(&rendered).unwrap(), config);
}
