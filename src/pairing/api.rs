//! Pairing API calls
//!
//! Each method performs exactly one HTTP request against the realm-scoped
//! pairing endpoint; retry policy belongs to [`super::PairingClient`]. All
//! request and response bodies use the `{"data": ...}` envelope.

use super::{BrokerInfo, PairingError};
use crate::config::TransportConfig;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Timeout applied to every pairing request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const MQTT_PROTOCOL: &str = "astarte_mqtt_v1";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
struct RegistrationRequest<'a> {
    hw_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    credentials_secret: String,
}

#[derive(Debug, Serialize)]
struct CsrRequest<'a> {
    csr: &'a str,
}

#[derive(Debug, Serialize)]
struct CertificateRequest<'a> {
    client_crt: &'a str,
}

#[derive(Debug, Deserialize)]
struct CertificateResponse {
    client_crt: String,
}

/// Verification outcome as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub until: Option<String>,
    pub cause: Option<String>,
    pub details: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    version: String,
    protocols: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MqttProtocolInfo {
    broker_url: String,
}

/// Thin HTTP client for the pairing endpoint.
#[derive(Debug, Clone)]
pub struct PairingApi {
    client: Client,
    base_url: String,
}

impl PairingApi {
    /// Build a client honouring the endpoint TLS options.
    pub fn new(config: &TransportConfig) -> Result<Self, PairingError> {
        let mut builder = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("astarte-transport/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(config.ignore_ssl_errors);

        if let Some(ca_path) = &config.pairing_ca {
            let pem = std::fs::read(ca_path).map_err(|source| PairingError::Io {
                path: ca_path.clone(),
                source,
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(certificate);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn device_url(&self, hardware_id: &str, suffix: &str) -> String {
        self.url(&format!("/devices/{hardware_id}{suffix}"))
    }

    /// `POST /agent/devices`, authenticated with the agent key
    pub async fn register_device(
        &self,
        hardware_id: &str,
        agent_key: &str,
    ) -> Result<String, PairingError> {
        let request = self
            .client
            .post(self.url("/agent/devices"))
            .header(AUTHORIZATION, format!("Bearer {agent_key}"))
            .json(&Envelope {
                data: RegistrationRequest { hw_id: hardware_id },
            });

        let response: RegistrationResponse = send(request).await?;
        Ok(response.credentials_secret)
    }

    /// `POST /devices/{hw}/protocols/astarte_mqtt_v1/credentials` with a CSR
    pub async fn request_certificate(
        &self,
        hardware_id: &str,
        secret: &str,
        csr: &str,
    ) -> Result<String, PairingError> {
        let request = self
            .client
            .post(self.device_url(
                hardware_id,
                &format!("/protocols/{MQTT_PROTOCOL}/credentials"),
            ))
            .header(AUTHORIZATION, format!("Bearer {secret}"))
            .json(&Envelope {
                data: CsrRequest { csr },
            });

        let response: CertificateResponse = send(request).await?;
        Ok(response.client_crt)
    }

    /// `POST /devices/{hw}/protocols/astarte_mqtt_v1/credentials/verify`
    pub async fn verify_certificate(
        &self,
        hardware_id: &str,
        secret: &str,
        certificate: &str,
    ) -> Result<VerifyResponse, PairingError> {
        let request = self
            .client
            .post(self.device_url(
                hardware_id,
                &format!("/protocols/{MQTT_PROTOCOL}/credentials/verify"),
            ))
            .header(AUTHORIZATION, format!("Bearer {secret}"))
            .json(&Envelope {
                data: CertificateRequest {
                    client_crt: certificate,
                },
            });

        send(request).await
    }

    /// `GET /devices/{hw}`: broker URL for the MQTT v1 protocol.
    ///
    /// Fails with [`PairingError::UnsupportedProtocol`] when the endpoint does
    /// not offer `astarte_mqtt_v1`.
    pub async fn broker_info(
        &self,
        hardware_id: &str,
        secret: &str,
    ) -> Result<BrokerInfo, PairingError> {
        let request = self
            .client
            .get(self.device_url(hardware_id, ""))
            .header(AUTHORIZATION, format!("Bearer {secret}"));

        let mut info: DeviceInfo = send(request).await?;
        let Some(protocol) = info.protocols.remove(MQTT_PROTOCOL) else {
            let offered = info.protocols.keys().cloned().collect::<Vec<_>>();
            return Err(PairingError::UnsupportedProtocol(offered.join(", ")));
        };
        let protocol: MqttProtocolInfo =
            serde_json::from_value(protocol).map_err(|e| PairingError::Parse(e.to_string()))?;

        Ok(BrokerInfo {
            url: protocol.broker_url,
            version: info.version,
        })
    }
}

/// Send a request and unwrap the `data` envelope of a 2xx response.
async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, PairingError> {
    let response = request.send().await?;
    let status = response.status();
    let url = response.url().path().to_string();
    let body = response.bytes().await?;

    debug!(status = status.as_u16(), path = %url, "Pairing endpoint replied");

    if !status.is_success() {
        return Err(PairingError::Http {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    let envelope: Envelope<T> =
        serde_json::from_slice(&body).map_err(|e| PairingError::Parse(e.to_string()))?;
    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn api_for(server: &MockServer) -> PairingApi {
        let config = TransportConfig::new(format!("{}/pairing/v1/test/", server.uri()), "/tmp");
        PairingApi::new(&config).unwrap()
    }

    #[tokio::test]
    async fn registration_sends_hardware_id_with_agent_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pairing/v1/test/agent/devices"))
            .and(header("authorization", "Bearer agent-key"))
            .and(body_json(json!({"data": {"hw_id": "hw-1"}})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"data": {"credentials_secret": "s3cr3t"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = api_for(&server).await;
        let secret = api.register_device("hw-1", "agent-key").await.unwrap();

        assert_eq!(secret, "s3cr3t");
    }

    #[tokio::test]
    async fn broker_info_reads_mqtt_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pairing/v1/test/devices/hw-1"))
            .and(header("authorization", "Bearer s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "version": "1.1.0",
                    "status": "confirmed",
                    "protocols": {
                        "astarte_mqtt_v1": { "broker_url": "mqtts://broker.example.com:8883" }
                    }
                }
            })))
            .mount(&server)
            .await;

        let info = api_for(&server).await.broker_info("hw-1", "s3cr3t").await.unwrap();

        assert_eq!(info.url, "mqtts://broker.example.com:8883");
        assert_eq!(info.version, "1.1.0");
    }

    #[tokio::test]
    async fn broker_info_without_mqtt_protocol_is_unsupported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pairing/v1/test/devices/hw-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "version": "2.0.0",
                    "protocols": {
                        "astarte_mqtt_v2": { "broker_url": "mqtts://broker.example.com:8883" }
                    }
                }
            })))
            .mount(&server)
            .await;

        let result = api_for(&server).await.broker_info("hw-1", "s3cr3t").await;

        match result {
            Err(PairingError::UnsupportedProtocol(offered)) => assert_eq!(offered, "astarte_mqtt_v2"),
            other => panic!("expected UnsupportedProtocol, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn verify_reports_invalid_certificate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/pairing/v1/test/devices/hw-1/protocols/astarte_mqtt_v1/credentials/verify",
            ))
            .and(body_json(json!({"data": {"client_crt": "PEM"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "valid": false, "cause": "EXPIRED", "details": "expired yesterday" }
            })))
            .mount(&server)
            .await;

        let response = api_for(&server)
            .await
            .verify_certificate("hw-1", "s3cr3t", "PEM")
            .await
            .unwrap();

        assert!(!response.valid);
        assert_eq!(response.cause.as_deref(), Some("EXPIRED"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let error = api_for(&server)
            .await
            .register_device("hw-1", "agent-key")
            .await
            .unwrap_err();

        assert!(matches!(error, PairingError::Http { status: 503, .. }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn missing_envelope_is_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"credentials_secret": "x"})),
            )
            .mount(&server)
            .await;

        let error = api_for(&server)
            .await
            .register_device("hw-1", "agent-key")
            .await
            .unwrap_err();

        assert!(matches!(error, PairingError::Parse(_)));
    }
}
