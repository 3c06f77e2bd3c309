//! Connection lifecycle
//!
//! [`state`] holds the pure rules (state machine, backoff, retry decision);
//! [`manager`] applies them to the one broker session of a service.

pub mod manager;
pub mod state;

pub use manager::{
    ConnectionCallback, ConnectionListenerHandle, ConnectionManager, MessageDispatcher,
};
pub use state::{ConnectionEvent, ConnectionState, ReconnectionDecision, StateMachine};
