//! Test helpers and utilities for integration tests
//!
//! A [`Fixture`] bundles a temporary persistency directory, a wiremock
//! pairing endpoint and an in-memory broker. Credentials can be provisioned
//! on disk so that a transport connects without pairing first.

use astarte_transport::interface::{Direction, InterfaceMetadata, Introspection};
use astarte_transport::protocol::InterfaceType;
use astarte_transport::retry::RetryPolicy;
use astarte_transport::testing::MockBroker;
use astarte_transport::transport::{Transport, TransportOptions};
use astarte_transport::TransportConfig;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const HARDWARE_ID: &str = "hw-1";
pub const ROOT: &str = "test/hw-1";

pub const SENSORS: &str = "org.example.Sensors";
pub const SETTINGS: &str = "org.example.Settings";
pub const COMMANDS: &str = "org.example.Commands";
pub const CONFIGURATION: &str = "org.example.Configuration";

const API_PREFIX: &str = "/pairing/v1/test";

/// Two producer and two consumer interfaces, one of each type.
#[allow(dead_code)]
pub fn introspection() -> Introspection {
    Introspection::new()
        .with(InterfaceMetadata::new(
            SENSORS,
            1,
            0,
            Direction::Producer,
            InterfaceType::DataStream,
        ))
        .with(InterfaceMetadata::new(
            SETTINGS,
            0,
            2,
            Direction::Producer,
            InterfaceType::Properties,
        ))
        .with(InterfaceMetadata::new(
            COMMANDS,
            1,
            1,
            Direction::Consumer,
            InterfaceType::DataStream,
        ))
        .with(InterfaceMetadata::new(
            CONFIGURATION,
            2,
            0,
            Direction::Consumer,
            InterfaceType::Properties,
        ))
}

/// Self-signed certificate for `common_name`, valid for `days` from now.
#[allow(dead_code)]
pub fn certificate_pem(common_name: &str, days: i64) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    params.distinguished_name = name;
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(days);
    params.self_signed(&key).unwrap().pem()
}

/// Millisecond retries so failing setups loop quickly.
#[allow(dead_code)]
pub fn fast_options() -> TransportOptions {
    TransportOptions {
        pairing_retry: RetryPolicy::new(Duration::from_millis(5), 0.0),
        endpoint_retry: RetryPolicy::new(Duration::from_millis(5), 0.0),
        reboot_retry: None,
    }
}

pub struct Fixture {
    pub server: MockServer,
    pub dir: TempDir,
    pub config: TransportConfig,
    pub broker: MockBroker,
}

#[allow(dead_code)]
impl Fixture {
    /// Pairing endpoint with broker discovery mounted; nothing provisioned.
    pub async fn new() -> Self {
        let fixture = Self::without_broker_info().await;
        fixture.mount_broker_info("astarte_mqtt_v1").await;
        fixture
    }

    /// Pairing endpoint with nothing mounted.
    pub async fn without_broker_info() -> Self {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        let broker_ca = dir.path().join("broker-ca.pem");
        std::fs::write(&broker_ca, certificate_pem("Test Broker CA", 365)).unwrap();

        let mut config = TransportConfig::new(format!("{}{API_PREFIX}", server.uri()), dir.path());
        config.agent_key = Some("agent-key".to_string());
        config.broker_ca = broker_ca;

        Self {
            server,
            dir,
            config,
            broker: MockBroker::new(),
        }
    }

    pub fn broker_info_path(&self) -> String {
        format!("{API_PREFIX}/devices/{HARDWARE_ID}")
    }

    /// Broker discovery offering a single `protocol`.
    pub async fn mount_broker_info(&self, protocol: &str) {
        Mock::given(method("GET"))
            .and(path(self.broker_info_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "version": "1.0",
                    "protocols": {
                        protocol: {"broker_url": "mqtts://broker.example.com:8883"}
                    }
                }
            })))
            .mount(&self.server)
            .await;
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.config.endpoint_dir().unwrap()
    }

    /// Write a secret, a device key and a certificate for `ROOT`.
    pub fn provision(&self, days: i64) -> String {
        let dir = self.credentials_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("credentials_secret"), "stored-secret").unwrap();
        std::fs::write(
            dir.join("device.key"),
            KeyPair::generate().unwrap().serialize_pem(),
        )
        .unwrap();
        let pem = certificate_pem(ROOT, days);
        std::fs::write(dir.join("mqtt_broker.crt"), &pem).unwrap();
        pem
    }

    /// Registration returning a secret.
    pub async fn mount_registration(&self) {
        Mock::given(method("POST"))
            .and(path(format!("{API_PREFIX}/agent/devices")))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"data": {"credentials_secret": "issued-secret"}})),
            )
            .mount(&self.server)
            .await;
    }

    /// Certificate signing returning a fresh certificate for `ROOT`.
    pub async fn mount_certificate(&self) -> String {
        let pem = certificate_pem(ROOT, 90);
        Mock::given(method("POST"))
            .and(path(self.credentials_path()))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"data": {"client_crt": pem}})),
            )
            .mount(&self.server)
            .await;
        pem
    }

    pub async fn mount_verify(&self, valid: bool) {
        let body = if valid {
            json!({"data": {"valid": true, "until": "2030-01-01T00:00:00Z"}})
        } else {
            json!({"data": {"valid": false, "cause": "REVOKED", "details": "by operator"}})
        };
        Mock::given(method("POST"))
            .and(path(format!("{}/verify", self.credentials_path())))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    pub fn credentials_path(&self) -> String {
        format!("{API_PREFIX}/devices/{HARDWARE_ID}/protocols/astarte_mqtt_v1/credentials")
    }

    /// Requests received on `path`.
    pub async fn requests_to(&self, path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|request| request.url.path() == path)
            .count()
    }

    pub fn transport(&self) -> Transport {
        Transport::new(
            &self.config,
            HARDWARE_ID,
            introspection(),
            self.broker.factory(),
        )
        .unwrap()
        .with_options(fast_options())
    }

    /// Establish a session and complete the handshake.
    pub async fn connect(&self, transport: &mut Transport, session_present: bool) {
        transport.connect(false).await;
        self.broker.accept_connection(session_present);
        transport.process_pending_events().await;
    }

    /// Confirm everything published so far and apply the confirmations.
    pub async fn confirm_all(&self, transport: &mut Transport) {
        self.broker.confirm_all();
        transport.process_pending_events().await;
    }
}
