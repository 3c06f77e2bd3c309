//! Crate-level error type
//!
//! Each concern has its own error enum next to the code that raises it;
//! [`BusError`] gathers them for callers that just want `?`.

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::protocol::{TopicError, ValidatorError};
use crate::publish::PublishError;
use crate::transport::BrokerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Validator error: {0}")]
    Validator(#[from] ValidatorError),

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_source_message() {
        let error: BusError = BrokerError::NoSession.into();
        assert_eq!(error.to_string(), "Broker error: No open broker session");

        let error: BusError = PublishError::NotConnected.into();
        assert!(matches!(error, BusError::Publish(PublishError::NotConnected)));

        let error: BusError = ConfigError::InvalidConfig("bad".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Configuration error: Invalid configuration: bad"
        );
    }

    #[test]
    fn test_question_mark_propagation() {
        fn parse(input: &str) -> BusResult<serde_json::Value> {
            Ok(serde_json::from_str(input)?)
        }
        assert!(parse("{}").is_ok());
        assert!(matches!(parse("{"), Err(BusError::Serialization(_))));
    }
}
