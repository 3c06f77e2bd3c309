//! Topic naming and validation
//!
//! Topics are matched by exact string comparison. Broker wildcards (`+`,
//! `#`) are rejected so a listener can never subscribe to more than one
//! logical stream.

use thiserror::Error;

/// Per-user inbound channel: `user-<userId>-messages`
pub fn user_messages_topic(user_id: &str) -> String {
    format!("user-{user_id}-messages")
}

/// Extract the user id from a `user-<userId>-messages` topic
pub fn parse_user_messages_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix("user-")
        .and_then(|rest| rest.strip_suffix("-messages"))
        .filter(|id| !id.is_empty())
}

pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    for ch in topic.chars() {
        if ch == '+' || ch == '#' {
            return Err(TopicError::Wildcard(ch));
        }
        if ch == '\0' {
            return Err(TopicError::NulCharacter);
        }
    }

    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains wildcard character '{0}'; only exact topics are supported")]
    Wildcard(char),
    #[error("Topic contains a NUL character")]
    NulCharacter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_user_messages_topic() {
        assert_eq!(user_messages_topic("42"), "user-42-messages");
        assert_eq!(parse_user_messages_topic("user-42-messages"), Some("42"));
        assert_eq!(
            parse_user_messages_topic("user-a-b-messages"),
            Some("a-b")
        );
        assert_eq!(parse_user_messages_topic("user--messages"), None);
        assert_eq!(parse_user_messages_topic("room-42-messages"), None);
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("user-42-messages").is_ok());
        assert!(validate_topic("a/b/c").is_ok());
        assert_eq!(validate_topic(""), Err(TopicError::Empty));
        assert_eq!(validate_topic("a/+/c"), Err(TopicError::Wildcard('+')));
        assert_eq!(validate_topic("a/#"), Err(TopicError::Wildcard('#')));
        assert_eq!(validate_topic("a\0b"), Err(TopicError::NulCharacter));
    }

    proptest! {
        #[test]
        fn user_topic_round_trips(id in "[a-zA-Z0-9_-]{1,32}") {
            let topic = user_messages_topic(&id);
            prop_assert!(validate_topic(&topic).is_ok());
            prop_assert_eq!(parse_user_messages_topic(&topic), Some(id.as_str()));
        }
    }
}
