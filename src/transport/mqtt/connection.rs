//! Pure connection configuration for the broker session
//!
//! This module contains pure functions for building rumqttc options from the
//! broker URL and the device TLS identity, plus the connection status and
//! error types shared by every [`super::MqttClient`] implementation.

use crate::pairing::TlsIdentity;
use crate::protocol::Qos;
use rumqttc::{MqttOptions, QoS, TlsConfiguration, Transport};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// MQTT keep-alive negotiated with the broker
pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Capacity of the rumqttc request channel
pub const REQUEST_CAPACITY: usize = 64;

/// Broker session status as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current status: {status:?}")]
    NotConnected { status: ConnectionStatus },
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("MQTT client already closed")]
    ClientClosed,
}

/// Map the transport QoS onto rumqttc's.
pub fn to_rumqttc_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Pure function to configure MQTT options for a mutual-TLS broker session
///
/// `mqtts://` and `ssl://` URLs use TLS with the device certificate as client
/// authentication; `mqtt://` and `tcp://` are accepted for local brokers.
pub fn configure_mqtt_options(
    broker_url: &str,
    client_id: &str,
    identity: &TlsIdentity,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let tls = match url.scheme() {
        "mqtts" | "ssl" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    if client_id.is_empty() {
        return Err(MqttError::Tls("certificate has an empty common name".to_string()));
    }

    let mut mqtt_options = MqttOptions::new(client_id, host, port);
    mqtt_options.set_clean_session(false);
    mqtt_options.set_keep_alive(KEEP_ALIVE);

    if tls {
        if identity.ca.is_empty() {
            return Err(MqttError::Tls("broker CA bundle is empty".to_string()));
        }
        mqtt_options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca: identity.ca.clone(),
            alpn: None,
            client_auth: Some((identity.certificate.clone(), identity.private_key.clone())),
        }));
    } else {
        warn!(broker_url = %broker_url, "Connecting to broker without TLS");
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> TlsIdentity {
        TlsIdentity {
            ca: b"-----BEGIN CERTIFICATE-----".to_vec(),
            certificate: b"cert".to_vec(),
            private_key: b"key".to_vec(),
        }
    }

    #[test]
    fn test_mqtts_uses_tls_and_default_port() {
        let options =
            configure_mqtt_options("mqtts://broker.example.com", "realm/device", &identity())
                .unwrap();

        assert_eq!(options.broker_address(), ("broker.example.com".to_string(), 8883));
        assert_eq!(options.client_id(), "realm/device");
        assert!(!options.clean_session());
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(matches!(options.transport(), Transport::Tls(_)));
    }

    #[test]
    fn test_plain_mqtt_keeps_explicit_port() {
        let options =
            configure_mqtt_options("mqtt://localhost:11883", "realm/device", &identity()).unwrap();

        assert_eq!(options.broker_address(), ("localhost".to_string(), 11883));
        assert!(matches!(options.transport(), Transport::Tcp));
    }

    #[test]
    fn test_invalid_broker_url() {
        assert!(matches!(
            configure_mqtt_options("not a url", "realm/device", &identity()),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            configure_mqtt_options("http://broker", "realm/device", &identity()),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_empty_ca_is_rejected_for_tls() {
        let mut identity = identity();
        identity.ca.clear();

        assert!(matches!(
            configure_mqtt_options("mqtts://broker:8883", "realm/device", &identity),
            Err(MqttError::Tls(_))
        ));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_rumqttc_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_rumqttc_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_rumqttc_qos(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }
}
