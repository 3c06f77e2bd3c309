//! Testing utilities and mock implementations
//!
//! Lets the connection, subscription and publish layers be exercised without
//! a running MQTT broker.

pub mod mocks;

pub use mocks::*;
