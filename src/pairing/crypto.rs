//! Device key, CSR and certificate inspection
//!
//! Keys are ECDSA P-256. The CSR subject carries the hardware id as common
//! name; the certificate issued by the pairing endpoint carries the MQTT
//! client id (`{realm}/{hardware_id}`) as its common name.

use super::PairingError;
use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use x509_parser::pem::parse_x509_pem;

/// Fields of the client certificate the transport depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: String,
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// True when the certificate expires within `window` of `now`.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        match now.checked_add_signed(window) {
            Some(limit) => self.not_after <= limit,
            None => true,
        }
    }
}

/// Generate a fresh P-256 key pair.
pub fn generate_key() -> Result<KeyPair, PairingError> {
    KeyPair::generate().map_err(|e| PairingError::Crypto(e.to_string()))
}

pub fn load_key(pem: &str) -> Result<KeyPair, PairingError> {
    KeyPair::from_pem(pem).map_err(|e| PairingError::Crypto(e.to_string()))
}

/// PEM-encoded CSR with `CN=<common_name>`.
pub fn certificate_request(key: &KeyPair, common_name: &str) -> Result<String, PairingError> {
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| PairingError::Crypto(e.to_string()))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    params.distinguished_name = name;

    params
        .serialize_request(key)
        .and_then(|csr| csr.pem())
        .map_err(|e| PairingError::Crypto(e.to_string()))
}

/// Parse a PEM certificate and extract its common name and expiry.
pub fn inspect_certificate(pem: &[u8]) -> Result<CertificateInfo, PairingError> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| PairingError::Crypto(format!("{e:?}")))?;
    let certificate = pem
        .parse_x509()
        .map_err(|e| PairingError::Crypto(format!("{e:?}")))?;

    let common_name = certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| PairingError::Crypto("certificate has no common name".to_string()))?
        .to_string();

    let not_after = Utc
        .timestamp_opt(certificate.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| PairingError::Crypto("certificate expiry out of range".to_string()))?;

    Ok(CertificateInfo {
        common_name,
        not_after,
    })
}

/// Write a file readable by the owner only.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<(), PairingError> {
    let io_error = |source| PairingError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    file.sync_all().map_err(io_error)
}


#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::FromDer;

    #[test]
    fn csr_carries_hardware_id() {
        let key = generate_key().unwrap();
        let csr = certificate_request(&key, "2TBn-jNESuuHamE2Zo1anA").unwrap();

        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));

        let (_, pem) = parse_x509_pem(csr.as_bytes()).unwrap();
        let (_, request) =
            x509_parser::certification_request::X509CertificationRequest::from_der(&pem.contents)
                .unwrap();
        let cn = request
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .unwrap()
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(cn, "2TBn-jNESuuHamE2Zo1anA");
    }

    #[test]
    fn key_survives_pem_round_trip() {
        let key = generate_key().unwrap();
        let restored = load_key(&key.serialize_pem()).unwrap();
        assert_eq!(key.serialize_pem(), restored.serialize_pem());
    }

    #[test]
    fn inspect_reads_common_name_and_expiry() {
        let pem = test_support::certificate_pem("test/hw-1", 30);

        let info = inspect_certificate(pem.as_bytes()).unwrap();

        assert_eq!(info.common_name, "test/hw-1");
        let days_left = (info.not_after - Utc::now()).num_days();
        assert!((29..=30).contains(&days_left));
    }

    #[test]
    fn renewal_window() {
        let now = Utc::now();
        let info = CertificateInfo {
            common_name: "x".to_string(),
            not_after: now + chrono::Duration::days(5),
        };
        assert!(info.expires_within(crate::retry::CERTIFICATE_RENEWAL_WINDOW, now));
        assert!(!info.expires_within(Duration::from_secs(24 * 60 * 60), now));
    }

    #[test]
    fn garbage_is_a_crypto_error() {
        assert!(matches!(
            inspect_certificate(b"not a certificate"),
            Err(PairingError::Crypto(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("device.key");
        write_private(&path, b"secret").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"secret");
    }
}
