//! Device pairing and certificate lifecycle
//!
//! [`PairingClient`] owns the device's cryptographic identity on disk:
//!
//! ```text
//! {persistency_dir}/endpoint/{host}/
//!     credentials_secret   long-lived secret issued at registration
//!     device.key           ECDSA P-256 private key
//!     mqtt_broker.crt      client certificate issued by the endpoint
//! ```
//!
//! Pairing walks `Unpaired → AcquiringSecret → Pairing → Paired`. Secret
//! acquisition, certificate verification and broker discovery retry transient
//! failures forever with the endpoint retry policy; the certificate request
//! itself reports failures to the caller, which owns the pairing retry loop.

pub mod api;
pub mod crypto;

pub use api::{PairingApi, VerifyResponse};
pub use crypto::CertificateInfo;

use crate::config::{ConfigError, TransportConfig};
use crate::error::sanitize_error_message;
use crate::retry::RetryPolicy;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

const CERTIFICATE_FILE: &str = "mqtt_broker.crt";
const SECRET_FILE: &str = "credentials_secret";
const KEY_FILE: &str = "device.key";

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Pairing request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Pairing endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Invalid pairing response: {0}")]
    Parse(String),
    #[error("Pairing endpoint offers no astarte_mqtt_v1 broker (offered: {0})")]
    UnsupportedProtocol(String),
    #[error("Device is already paired")]
    AlreadyPaired,
    #[error("Certificate rejected by the pairing endpoint: {cause} {details}")]
    InvalidCertificate { cause: String, details: String },
    #[error("No client certificate to verify")]
    EmptyCertificate,
    #[error("No credentials secret stored and no agent key configured")]
    MissingAgentKey,
    #[error("No credentials secret stored")]
    MissingSecret,
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid pairing configuration: {0}")]
    Config(#[from] ConfigError),
}

impl PairingError {
    /// Network-class failures worth retrying with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PairingError::Network(_) | PairingError::Http { .. } | PairingError::Parse(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Unpaired,
    AcquiringSecret,
    Pairing,
    Paired,
}

/// Where the `astarte_mqtt_v1` broker lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    pub url: String,
    /// Platform version reported by the endpoint; logged only.
    pub version: String,
}

/// Positive outcome of a certificate verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStatus {
    pub valid_until: Option<String>,
}

/// PEM material for mutual TLS with the broker.
#[derive(Clone)]
pub struct TlsIdentity {
    pub ca: Vec<u8>,
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("ca_bytes", &self.ca.len())
            .field("certificate_bytes", &self.certificate.len())
            .field("private_key", &"***")
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CredentialPaths {
    dir: PathBuf,
    certificate: PathBuf,
    secret: PathBuf,
    key: PathBuf,
}

impl CredentialPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            certificate: dir.join(CERTIFICATE_FILE),
            secret: dir.join(SECRET_FILE),
            key: dir.join(KEY_FILE),
            dir,
        }
    }
}

/// Cloneable handle on the device identity and the pairing endpoint.
#[derive(Clone)]
pub struct PairingClient {
    api: PairingApi,
    hardware_id: String,
    agent_key: Option<String>,
    paths: CredentialPaths,
    broker_ca: PathBuf,
    endpoint_retry: RetryPolicy,
    state: Arc<watch::Sender<PairingState>>,
}

impl PairingClient {
    pub fn new(config: &TransportConfig, hardware_id: &str) -> Result<Self, PairingError> {
        crate::config::validate_hardware_id(hardware_id)?;
        let paths = CredentialPaths::new(config.endpoint_dir()?);
        let initial = if paths.certificate.is_file() {
            PairingState::Paired
        } else {
            PairingState::Unpaired
        };
        let (state, _) = watch::channel(initial);

        Ok(Self {
            api: PairingApi::new(config)?,
            hardware_id: hardware_id.to_string(),
            agent_key: config.agent_key.clone(),
            paths,
            broker_ca: config.broker_ca.clone(),
            endpoint_retry: RetryPolicy::endpoint(),
            state: Arc::new(state),
        })
    }

    /// Override the retry policy used for registration, verification and
    /// broker discovery.
    pub fn with_endpoint_retry(mut self, policy: RetryPolicy) -> Self {
        self.endpoint_retry = policy;
        self
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.paths.dir
    }

    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PairingState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PairingState) {
        self.state.send_replace(state);
    }

    /// A device is paired when its client certificate file can be opened.
    pub fn is_paired(&self) -> bool {
        std::fs::File::open(&self.paths.certificate).is_ok()
    }

    pub fn has_secret(&self) -> bool {
        self.paths.secret.is_file()
    }

    /// Obtain a secret if needed, then a fresh client certificate.
    ///
    /// Without `force`, an already paired device is left untouched and
    /// [`PairingError::AlreadyPaired`] is returned.
    pub async fn pair(&self, force: bool) -> Result<(), PairingError> {
        if !force && self.is_paired() {
            return Err(PairingError::AlreadyPaired);
        }

        let span = crate::pairing_span!(hardware_id = %self.hardware_id, force);
        let result = async {
            self.set_state(PairingState::AcquiringSecret);
            self.acquire_secret().await?;
            self.set_state(PairingState::Pairing);
            self.request_certificate().await
        }
        .instrument(span)
        .await;

        match &result {
            Ok(()) => self.set_state(PairingState::Paired),
            Err(e) => {
                warn!(error = %sanitize_error_message(&e.to_string()), "Pairing failed");
                self.set_state(PairingState::Unpaired);
            }
        }
        result
    }

    /// Return the stored credentials secret, registering the device first
    /// when none is stored.
    pub async fn acquire_secret(&self) -> Result<String, PairingError> {
        if let Some(secret) = self.load_secret()? {
            debug!("Using stored credentials secret");
            return Ok(secret);
        }

        let agent_key = self
            .agent_key
            .as_deref()
            .ok_or(PairingError::MissingAgentKey)?;
        info!(hardware_id = %self.hardware_id, "Registering device");

        let api = &self.api;
        let hardware_id = self.hardware_id.as_str();
        let secret = self
            .retry_endpoint("registration", move || {
                api.register_device(hardware_id, agent_key)
            })
            .await?;

        self.ensure_dir()?;
        crypto::write_private(&self.paths.secret, secret.as_bytes())?;
        info!("Credentials secret stored");
        Ok(secret)
    }

    /// Submit a CSR and store the issued certificate. Not retried.
    pub async fn request_certificate(&self) -> Result<(), PairingError> {
        let secret = self.load_secret()?.ok_or(PairingError::MissingSecret)?;
        let csr = {
            let key = self.load_or_generate_key()?;
            crypto::certificate_request(&key, &self.hardware_id)?
        };

        let certificate = self
            .api
            .request_certificate(&self.hardware_id, &secret, &csr)
            .await?;
        let info = crypto::inspect_certificate(certificate.as_bytes())?;

        std::fs::write(&self.paths.certificate, certificate.as_bytes()).map_err(|source| {
            PairingError::Io {
                path: self.paths.certificate.clone(),
                source,
            }
        })?;
        info!(
            common_name = %info.common_name,
            not_after = %info.not_after,
            "Client certificate stored"
        );
        Ok(())
    }

    /// Ask the endpoint whether the stored certificate is still valid.
    ///
    /// Transient failures are retried until a definitive answer arrives; an
    /// invalid certificate is returned as [`PairingError::InvalidCertificate`].
    pub async fn verify_certificate(&self) -> Result<CertificateStatus, PairingError> {
        let certificate = match std::fs::read_to_string(&self.paths.certificate) {
            Ok(pem) if !pem.trim().is_empty() => pem,
            _ => return Err(PairingError::EmptyCertificate),
        };
        let secret = self.load_secret()?.ok_or(PairingError::MissingSecret)?;

        let api = &self.api;
        let hardware_id = self.hardware_id.as_str();
        let secret = secret.as_str();
        let pem = certificate.as_str();
        let response = self
            .retry_endpoint("verify", move || {
                api.verify_certificate(hardware_id, secret, pem)
            })
            .await?;

        if response.valid {
            debug!(until = ?response.until, "Certificate is valid");
            Ok(CertificateStatus {
                valid_until: response.until,
            })
        } else {
            let cause = response.cause.unwrap_or_default();
            let details = response.details.unwrap_or_default();
            warn!(cause = %cause, details = %details, "Certificate rejected");
            Err(PairingError::InvalidCertificate { cause, details })
        }
    }

    /// Broker URL for the MQTT v1 protocol, retried until the endpoint answers.
    pub async fn broker_info(&self) -> Result<BrokerInfo, PairingError> {
        let secret = self.load_secret()?.ok_or(PairingError::MissingSecret)?;

        let api = &self.api;
        let hardware_id = self.hardware_id.as_str();
        let secret = secret.as_str();
        let info = self
            .retry_endpoint("broker_info", move || api.broker_info(hardware_id, secret))
            .await?;
        info!(broker_url = %info.url, version = %info.version, "Broker info received");
        Ok(info)
    }

    pub fn certificate_info(&self) -> Result<CertificateInfo, PairingError> {
        let pem = read(&self.paths.certificate)?;
        crypto::inspect_certificate(&pem)
    }

    pub fn tls_identity(&self) -> Result<TlsIdentity, PairingError> {
        Ok(TlsIdentity {
            ca: read(&self.broker_ca)?,
            certificate: read(&self.paths.certificate)?,
            private_key: read(&self.paths.key)?,
        })
    }

    fn load_secret(&self) -> Result<Option<String>, PairingError> {
        match std::fs::read_to_string(&self.paths.secret) {
            Ok(secret) if !secret.trim().is_empty() => Ok(Some(secret.trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PairingError::Io {
                path: self.paths.secret.clone(),
                source,
            }),
        }
    }

    fn load_or_generate_key(&self) -> Result<rcgen::KeyPair, PairingError> {
        if self.paths.key.is_file() {
            let pem = std::fs::read_to_string(&self.paths.key).map_err(|source| {
                PairingError::Io {
                    path: self.paths.key.clone(),
                    source,
                }
            })?;
            return crypto::load_key(&pem);
        }

        self.ensure_dir()?;
        let key = crypto::generate_key()?;
        crypto::write_private(&self.paths.key, key.serialize_pem().as_bytes())?;
        info!(path = %self.paths.key.display(), "Generated device key");
        Ok(key)
    }

    fn ensure_dir(&self) -> Result<(), PairingError> {
        std::fs::create_dir_all(&self.paths.dir).map_err(|source| PairingError::Io {
            path: self.paths.dir.clone(),
            source,
        })
    }

    async fn retry_endpoint<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, PairingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PairingError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    let delay = self.endpoint_retry.next_delay();
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %sanitize_error_message(&e.to_string()),
                        "Pairing endpoint call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>, PairingError> {
    std::fs::read(path).map_err(|source| PairingError::Io {
        path: path.to_path_buf(),
        source,
    })
}
