//! Envelope types, topic conventions and envelope validation
//!
//! This module describes what travels over the broker. It has no I/O.

pub mod envelope;
pub mod topics;
pub mod validation;

pub use envelope::*;
pub use topics::*;
pub use validation::{
    EnvelopeSchema, FieldError, MessageValidator, SchemaKind, Validation, ValidatorError,
};
