//! Structural validation of envelopes
//!
//! Both envelope shapes are described as JSON Schema documents and compiled
//! once. Validation failures come back as data (`Validation::Invalid`);
//! `ValidatorError` is reserved for failures that indicate a programming
//! error, such as a schema that does not compile.

use chrono::DateTime;
use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::envelope::{InboundEnvelope, OutboundEnvelope};

/// The two envelope shapes known to the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Inbound,
    Outbound,
}

/// Typed envelope bound to its schema
pub trait EnvelopeSchema: DeserializeOwned {
    const KIND: SchemaKind;
}

impl EnvelopeSchema for InboundEnvelope {
    const KIND: SchemaKind = SchemaKind::Inbound;
}

impl EnvelopeSchema for OutboundEnvelope {
    const KIND: SchemaKind = SchemaKind::Outbound;
}

/// One schema violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// JSON pointer to the offending value (empty for the root)
    pub path: String,
    pub message: String,
}

/// Outcome of validating one document
#[derive(Debug, Clone, PartialEq)]
pub enum Validation<T> {
    Valid(T),
    Invalid(Vec<FieldError>),
}

impl<T> Validation<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }

    pub fn errors(&self) -> &[FieldError] {
        match self {
            Validation::Valid(_) => &[],
            Validation::Invalid(errors) => errors,
        }
    }

    pub fn into_result(self) -> Result<T, Vec<FieldError>> {
        match self {
            Validation::Valid(data) => Ok(data),
            Validation::Invalid(errors) => Err(errors),
        }
    }
}

/// Non-validation failures; these propagate to the caller
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("Schema compilation error: {0}")]
    SchemaCompilation(String),
    #[error("Document passed schema validation but could not be decoded: {0}")]
    Decode(#[source] serde_json::Error),
}

pub struct MessageValidator {
    inbound: Validator,
    outbound: Validator,
}

impl MessageValidator {
    pub fn new() -> Result<Self, ValidatorError> {
        Ok(Self {
            inbound: compile(&inbound_schema())?,
            outbound: compile(&outbound_schema())?,
        })
    }

    /// Validate `data` against `S`'s schema and decode it on success
    pub fn validate<S: EnvelopeSchema>(
        &self,
        data: &Value,
    ) -> Result<Validation<S>, ValidatorError> {
        match self.validate_kind(S::KIND, data) {
            Validation::Valid(value) => serde_json::from_value(value)
                .map(Validation::Valid)
                .map_err(ValidatorError::Decode),
            Validation::Invalid(errors) => Ok(Validation::Invalid(errors)),
        }
    }

    /// Validate `data` against one schema, returning the data untouched on success
    pub fn validate_kind(&self, kind: SchemaKind, data: &Value) -> Validation<Value> {
        let validator = match kind {
            SchemaKind::Inbound => &self.inbound,
            SchemaKind::Outbound => &self.outbound,
        };

        let mut errors: Vec<FieldError> = match validator.validate(data) {
            Ok(()) => Vec::new(),
            Err(schema_errors) => schema_errors
                .map(|e| FieldError {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect(),
        };

        if let Some(Value::String(sended_at)) = data.get("sendedAt") {
            if DateTime::parse_from_rfc3339(sended_at).is_err() {
                errors.push(FieldError {
                    path: "/sendedAt".to_string(),
                    message: format!("\"{sended_at}\" is not a valid RFC 3339 datetime"),
                });
            }
        }

        if errors.is_empty() {
            Validation::Valid(data.clone())
        } else {
            Validation::Invalid(errors)
        }
    }
}

fn compile(schema: &Value) -> Result<Validator, ValidatorError> {
    jsonschema::validator_for(schema)
        .map_err(|e| ValidatorError::SchemaCompilation(e.to_string()))
}

fn envelope_core_properties() -> serde_json::Map<String, Value> {
    let mut properties = serde_json::Map::new();
    for key in ["clientId", "from", "to", "integrationType", "messageId", "sendedAt"] {
        properties.insert(key.to_string(), json!({"type": "string"}));
    }
    properties
}

const CORE_REQUIRED: [&str; 7] = [
    "clientId",
    "from",
    "integrationType",
    "messageId",
    "sendedAt",
    "to",
    "message",
];

/// JSON Schema for envelopes delivered to subscribers
pub fn inbound_schema() -> Value {
    let mut properties = envelope_core_properties();
    properties.insert(
        "message".to_string(),
        json!({
            "type": "object",
            "required": ["type"],
            "properties": {
                "type": {"type": "string"},
                "content": {"type": "string"},
                "text": {"type": "string"},
                "caption": {"type": "string"},
                "buttons": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["id", "title", "type"],
                        "properties": {
                            "id": {"type": "string"},
                            "title": {"type": "string"},
                            "type": {"type": "string"}
                        }
                    }
                },
                "list": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["id", "title"],
                        "properties": {
                            "id": {"type": "string"},
                            "title": {"type": "string"},
                            "description": {"type": "string"}
                        }
                    }
                },
                "selector": {"enum": ["unique", "multiple"]},
                "fields": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["id", "name", "required", "value", "type"],
                        "properties": {
                            "id": {"type": "string"},
                            "name": {"type": "string"},
                            "required": {"type": "boolean"},
                            "type": {"enum": ["number", "string", "Date", "Datetime", "Image"]}
                        }
                    }
                },
                "type_request": {"type": "string"},
                "status": {"type": "string"},
                "url": {"type": "string"},
                "latitude": {"type": ["number", "string"]},
                "longitude": {"type": ["number", "string"]}
            }
        }),
    );

    json!({
        "type": "object",
        "required": CORE_REQUIRED,
        "properties": properties
    })
}

/// JSON Schema for envelopes published by this client
pub fn outbound_schema() -> Value {
    let mut properties = envelope_core_properties();
    properties.insert("webhookUrl".to_string(), json!({"type": "string", "minLength": 1}));
    properties.insert(
        "message".to_string(),
        json!({
            "type": "object",
            "required": ["type"],
            "properties": {"type": {"type": "string"}},
            "additionalProperties": true
        }),
    );

    let mut required: Vec<&str> = CORE_REQUIRED.to_vec();
    required.push("webhookUrl");

    json!({
        "type": "object",
        "required": required,
        "properties": properties
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inbound() -> Value {
        json!({
            "clientId": "c1",
            "from": "a",
            "integrationType": "bot",
            "messageId": "m1",
            "sendedAt": "2024-01-01T00:00:00Z",
            "to": "b",
            "message": {"type": "text"}
        })
    }

    fn validator() -> MessageValidator {
        MessageValidator::new().unwrap()
    }

    #[test]
    fn test_inbound_sample_is_valid() {
        let result = validator().validate::<InboundEnvelope>(&sample_inbound()).unwrap();
        assert!(result.is_success());
        let envelope = result.into_result().unwrap();
        assert_eq!(envelope.message_id, "m1");
        assert_eq!(envelope.message.kind, "text");
    }

    #[test]
    fn test_missing_message_id_is_structured_failure() {
        let mut data = sample_inbound();
        data.as_object_mut().unwrap().remove("messageId");

        let result = validator().validate::<InboundEnvelope>(&data).unwrap();
        assert!(!result.is_success());
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("messageId"), "{errors:?}");
    }

    #[test]
    fn test_missing_message_type_reports_nested_path() {
        let mut data = sample_inbound();
        data["message"] = json!({"text": "hi"});

        let result = validator().validate_kind(SchemaKind::Inbound, &data);
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/message");
    }

    #[test]
    fn test_invalid_selector_and_field_type() {
        let mut data = sample_inbound();
        data["message"] = json!({
            "type": "list",
            "selector": "several",
            "fields": [{"id": "1", "name": "n", "required": true, "value": 1, "type": "bool"}]
        });

        let result = validator().validate_kind(SchemaKind::Inbound, &data);
        let paths: Vec<&str> = result.errors().iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"/message/selector"), "{paths:?}");
        assert!(paths.contains(&"/message/fields/0/type"), "{paths:?}");
    }

    #[test]
    fn test_unparsable_sended_at_is_rejected() {
        let mut data = sample_inbound();
        data["sendedAt"] = json!("yesterday");

        let result = validator().validate::<InboundEnvelope>(&data).unwrap();
        assert_eq!(result.errors()[0].path, "/sendedAt");
    }

    #[test]
    fn test_outbound_requires_webhook_url_and_allows_extras() {
        let mut data = sample_inbound();
        data["message"] = json!({"type": "text", "text": "hi", "anything": {"nested": [1, 2]}});

        let result = validator().validate_kind(SchemaKind::Outbound, &data);
        assert!(result.errors().iter().any(|e| e.message.contains("webhookUrl")));

        data["webhookUrl"] = json!("https://hooks.example.com/in");
        let result = validator().validate::<OutboundEnvelope>(&data).unwrap();
        let envelope = result.into_result().unwrap();
        assert_eq!(envelope.message.extra["anything"]["nested"][1], 2);
    }

    #[test]
    fn test_non_object_document_is_invalid_not_error() {
        let result = validator().validate::<InboundEnvelope>(&json!("just a string")).unwrap();
        assert!(!result.is_success());
    }
}
