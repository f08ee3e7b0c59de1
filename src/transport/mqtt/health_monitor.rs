//! Pure connection status transitions for the broker session
//!
//! The rumqttc event loop reports raw outcomes (CONNACK, socket errors, a
//! requested disconnect); this module turns them into [`ConnectionStatus`]
//! transitions without touching the network.

use super::connection::ConnectionStatus;
use tracing::{debug, info, warn};

/// Pure status transition logic
pub struct HealthMonitor;

/// Inputs that drive status transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// `connect()` was called
    ConnectRequested,
    /// Broker acknowledged the connection
    ConnAckReceived,
    /// Socket, TLS or protocol error on the live session
    ConnectionLost(String),
    /// The reconnect delay elapsed and a new attempt begins
    RetryStarted,
    /// `disconnect()` was called
    DisconnectRequested,
    /// The event loop has stopped
    Stopped,
}

impl HealthMonitor {
    /// Determine next status after a connection event (pure function)
    pub fn next_status(current: ConnectionStatus, event: &ConnectionEvent) -> ConnectionStatus {
        match event {
            ConnectionEvent::ConnectRequested => ConnectionStatus::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionStatus::Connected,
            ConnectionEvent::ConnectionLost(_) => match current {
                ConnectionStatus::Disconnecting | ConnectionStatus::Disconnected => {
                    ConnectionStatus::Disconnected
                }
                _ => ConnectionStatus::Reconnecting,
            },
            ConnectionEvent::RetryStarted => match current {
                ConnectionStatus::Reconnecting => ConnectionStatus::Connecting,
                other => other,
            },
            ConnectionEvent::DisconnectRequested => match current {
                ConnectionStatus::Disconnected => ConnectionStatus::Disconnected,
                _ => ConnectionStatus::Disconnecting,
            },
            ConnectionEvent::Stopped => ConnectionStatus::Disconnected,
        }
    }

    /// Check if the status allows publishing (pure function)
    pub fn can_publish(status: ConnectionStatus) -> bool {
        matches!(status, ConnectionStatus::Connected)
    }

    /// Check if the status allows subscribing (pure function)
    pub fn can_subscribe(status: ConnectionStatus) -> bool {
        matches!(status, ConnectionStatus::Connected)
    }

    /// Whether the transport should treat this status as "offline"
    pub fn is_offline(status: ConnectionStatus) -> bool {
        !matches!(status, ConnectionStatus::Connected)
    }

    /// Log a status transition
    pub fn log_transition(from: ConnectionStatus, to: ConnectionStatus) {
        match (from, to) {
            (ConnectionStatus::Connecting, ConnectionStatus::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionStatus::Connected, ConnectionStatus::Reconnecting) => {
                warn!("Broker connection lost");
            }
            (ConnectionStatus::Reconnecting, ConnectionStatus::Connecting) => {
                info!("Retrying broker connection");
            }
            (_, ConnectionStatus::Disconnected) => {
                info!(from = ?from, "Broker connection closed");
            }
            _ => {
                debug!(from = ?from, to = ?to, "Broker connection status changed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_flow() {
        let status = HealthMonitor::next_status(
            ConnectionStatus::Disconnected,
            &ConnectionEvent::ConnectRequested,
        );
        assert_eq!(status, ConnectionStatus::Connecting);

        let status = HealthMonitor::next_status(status, &ConnectionEvent::ConnAckReceived);
        assert_eq!(status, ConnectionStatus::Connected);
        assert!(HealthMonitor::can_publish(status));
    }

    #[test]
    fn test_unexpected_drop_goes_through_reconnecting() {
        let status = HealthMonitor::next_status(
            ConnectionStatus::Connected,
            &ConnectionEvent::ConnectionLost("reset by peer".into()),
        );
        assert_eq!(status, ConnectionStatus::Reconnecting);
        assert!(!HealthMonitor::can_publish(status));

        let status = HealthMonitor::next_status(status, &ConnectionEvent::RetryStarted);
        assert_eq!(status, ConnectionStatus::Connecting);
    }

    #[test]
    fn test_failed_attempt_while_connecting_also_reconnects() {
        let status = HealthMonitor::next_status(
            ConnectionStatus::Connecting,
            &ConnectionEvent::ConnectionLost("tls handshake".into()),
        );
        assert_eq!(status, ConnectionStatus::Reconnecting);
    }

    #[test]
    fn test_requested_disconnect() {
        let status = HealthMonitor::next_status(
            ConnectionStatus::Connected,
            &ConnectionEvent::DisconnectRequested,
        );
        assert_eq!(status, ConnectionStatus::Disconnecting);

        // Errors raised while tearing down do not trigger a reconnect
        let status = HealthMonitor::next_status(
            status,
            &ConnectionEvent::ConnectionLost("closed".into()),
        );
        assert_eq!(status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_retry_only_applies_when_reconnecting() {
        assert_eq!(
            HealthMonitor::next_status(ConnectionStatus::Disconnected, &ConnectionEvent::RetryStarted),
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_offline_statuses() {
        for status in [
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Disconnecting,
            ConnectionStatus::Reconnecting,
        ] {
            assert!(HealthMonitor::is_offline(status));
            assert!(!HealthMonitor::can_subscribe(status));
        }
        assert!(!HealthMonitor::is_offline(ConnectionStatus::Connected));
    }
}
