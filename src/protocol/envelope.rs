//! Envelope types carried over the broker
//!
//! Field names on the wire are camelCase (`clientId`, `sendedAt`, ...); the
//! message body keeps the snake_case keys (`type_request`) publishers use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Envelope delivered to subscribers on `user-<id>-messages`
///
/// # Examples
/// ```
/// use topicmux::protocol::InboundEnvelope;
///
/// let envelope: InboundEnvelope = serde_json::from_str(r#"{
///     "clientId": "c1", "from": "a", "to": "b", "integrationType": "bot",
///     "messageId": "m1", "sendedAt": "2024-01-01T00:00:00Z",
///     "message": {"type": "text", "text": "hi"}
/// }"#).unwrap();
/// assert_eq!(envelope.message.kind, "text");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    pub client_id: String,
    pub from: String,
    pub to: String,
    pub integration_type: String,
    pub message_id: String,
    /// RFC 3339 timestamp
    pub sended_at: DateTime<Utc>,
    pub message: InboundMessage,
}

/// Application-level message, discriminated by `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<Vec<Button>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<ListItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FormField>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Coordinate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Coordinate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Button {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Whether a list accepts one or several choices
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    Unique,
    Multiple,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormField {
    pub id: String,
    pub name: String,
    pub required: bool,
    pub value: Value,
    #[serde(rename = "type")]
    pub kind: FieldType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldType {
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "string")]
    Text,
    Date,
    Datetime,
    Image,
}

/// Latitude/longitude as sent by publishers: numeric or textual
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Coordinate::Number(n) => Some(*n),
            Coordinate::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Envelope published by this client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub client_id: String,
    pub from: String,
    pub to: String,
    pub integration_type: String,
    pub message_id: String,
    pub sended_at: DateTime<Utc>,
    pub webhook_url: String,
    pub message: OutboundMessage,
}

impl OutboundEnvelope {
    /// Build an envelope with a fresh message id and the current time
    pub fn new(
        client_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        integration_type: impl Into<String>,
        webhook_url: impl Into<String>,
        message: OutboundMessage,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            from: from.into(),
            to: to.into(),
            integration_type: integration_type.into(),
            message_id: Uuid::new_v4().to_string(),
            sended_at: Utc::now(),
            webhook_url: webhook_url.into(),
            message,
        }
    }
}

/// Outbound message: `type` plus any publisher-specific fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            extra: Map::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text").with_field("text", Value::String(text.into()))
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}
