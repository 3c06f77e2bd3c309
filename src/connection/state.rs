//! Pure connection lifecycle rules
//!
//! Everything here is free of I/O so the manager's behavior can be tested
//! without a broker: the state machine, backoff and the retry decision.

use crate::config::ReconnectSection;
use std::fmt;
use tracing::{error, info, warn};

/// Lifecycle of the single shared broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`StateMachine::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A session is being opened
    ConnectRequested,
    /// Broker acknowledged the session
    AckReceived,
    /// An attempt timed out or the broker refused it
    AttemptFailed,
    /// An acknowledged session dropped unexpectedly
    ConnectionLost,
    /// Reconnection gave up after `max_attempts`
    RetriesExhausted,
    /// Explicit close
    Closed,
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

pub struct StateMachine;

impl StateMachine {
    /// Next state for `event`. Attempts made while reconnecting keep the
    /// state at `Reconnecting` until the loop either succeeds or gives up.
    pub fn transition(current: ConnectionState, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (current, event) {
            (_, E::Closed) => S::Disconnected,
            (_, E::AckReceived) => S::Connected,
            (S::Reconnecting, E::ConnectRequested | E::AttemptFailed) => S::Reconnecting,
            (_, E::ConnectRequested) => S::Connecting,
            (_, E::AttemptFailed) => S::Failed,
            (_, E::ConnectionLost) => S::Reconnecting,
            (_, E::RetriesExhausted) => S::Failed,
        }
    }

    /// Backoff before reconnection attempt `attempt` (1-based):
    /// `initial * multiplier^(attempt-1)`, capped at `max_delay_ms`
    pub fn backoff_delay_ms(config: &ReconnectSection, attempt: u32) -> u64 {
        let factor = u64::from(config.multiplier).saturating_pow(attempt.saturating_sub(1));
        config
            .initial_delay_ms
            .saturating_mul(factor)
            .min(config.max_delay_ms)
    }

    /// Unlimited retries when `max_attempts` is `None`
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectSection,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: Self::backoff_delay_ms(config, attempt),
        }
    }

    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting) => {
                warn!("Broker connection lost, reconnecting");
            }
            (_, ConnectionState::Failed) => {
                error!("Broker connection failed (from {})", from);
            }
            _ => {
                info!("Connection state: {} -> {}", from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    fn reconnect(max_attempts: Option<u32>) -> ReconnectSection {
        ReconnectSection {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2,
            max_attempts,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let state = StateMachine::transition(S::Disconnected, E::ConnectRequested);
        assert_eq!(state, S::Connecting);
        let state = StateMachine::transition(state, E::AckReceived);
        assert_eq!(state, S::Connected);
        let state = StateMachine::transition(state, E::ConnectionLost);
        assert_eq!(state, S::Reconnecting);
        let state = StateMachine::transition(state, E::AckReceived);
        assert_eq!(state, S::Connected);
    }

    #[test]
    fn test_failed_attempt_then_retry() {
        let state = StateMachine::transition(S::Connecting, E::AttemptFailed);
        assert_eq!(state, S::Failed);
        assert_eq!(
            StateMachine::transition(state, E::ConnectRequested),
            S::Connecting
        );
    }

    #[test]
    fn test_reconnect_attempts_stay_reconnecting() {
        assert_eq!(
            StateMachine::transition(S::Reconnecting, E::ConnectRequested),
            S::Reconnecting
        );
        assert_eq!(
            StateMachine::transition(S::Reconnecting, E::AttemptFailed),
            S::Reconnecting
        );
        assert_eq!(
            StateMachine::transition(S::Reconnecting, E::RetriesExhausted),
            S::Failed
        );
    }

    #[test]
    fn test_close_from_any_state() {
        for state in [
            S::Disconnected,
            S::Connecting,
            S::Connected,
            S::Reconnecting,
            S::Failed,
        ] {
            assert_eq!(StateMachine::transition(state, E::Closed), S::Disconnected);
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = reconnect(None);
        assert_eq!(StateMachine::backoff_delay_ms(&config, 1), 100);
        assert_eq!(StateMachine::backoff_delay_ms(&config, 2), 200);
        assert_eq!(StateMachine::backoff_delay_ms(&config, 3), 400);
        assert_eq!(StateMachine::backoff_delay_ms(&config, 4), 800);
        assert_eq!(StateMachine::backoff_delay_ms(&config, 5), 1000);
        assert_eq!(StateMachine::backoff_delay_ms(&config, 200), 1000);
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = reconnect(None);

        assert_eq!(
            StateMachine::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 100
            }
        );
        assert_eq!(
            StateMachine::should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 400
            }
        );
        assert_eq!(
            StateMachine::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );

        // unlimited retries never abort on count
        assert!(matches!(
            StateMachine::should_attempt_reconnection(10_000, &config, false),
            ReconnectionDecision::Proceed { .. }
        ));
    }

    #[test]
    fn test_max_attempts_exceeded() {
        let config = reconnect(Some(3));
        assert!(matches!(
            StateMachine::should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::Proceed { attempt: 3, .. }
        ));
        assert_eq!(
            StateMachine::should_attempt_reconnection(3, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_can_publish() {
        assert!(StateMachine::can_publish(S::Connected));
        assert!(!StateMachine::can_publish(S::Connecting));
        assert!(!StateMachine::can_publish(S::Reconnecting));
        assert!(!StateMachine::can_publish(S::Disconnected));
        assert!(!StateMachine::can_publish(S::Failed));
    }
}
