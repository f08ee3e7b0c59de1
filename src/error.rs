//! Transport error taxonomy
//!
//! Every failure the transport can report falls into one of four classes:
//!
//! - **Fatal**: the transport cannot start (configuration, durable store)
//! - **Transient**: network and broker trouble, retried internally
//! - **Terminal but recoverable**: the certificate was rejected and a new
//!   pairing is forced
//! - **Data policy**: a publish was refused or could not be retained
//!
//! Only Fatal errors ever leave [`crate::transport::Transport::run`]; the
//! others are logged and handled where they occur.

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::interface::InterfaceError;
use crate::pairing::PairingError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Broker error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Invalid publish: {reason}")]
    InvalidPublish { reason: String },

    #[error("Transport is no longer running")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the transport reacts to an error class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Process exits with a diagnostic
    Fatal,
    /// Logged and retried with randomized backoff
    Transient,
    /// Triggers a forced re-pairing
    TerminalRecoverable,
    /// Reported to the originating adapter, never retried
    DataPolicy,
}

impl TransportError {
    pub fn invalid_publish<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPublish {
            reason: reason.into(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransportError::Config(_)
            | TransportError::Interface(_)
            | TransportError::Cache(_)
            | TransportError::Io(_)
            | TransportError::ChannelClosed => ErrorSeverity::Fatal,
            TransportError::Pairing(e) => match e {
                PairingError::InvalidCertificate { .. } | PairingError::EmptyCertificate => {
                    ErrorSeverity::TerminalRecoverable
                }
                PairingError::Config(_) => ErrorSeverity::Fatal,
                _ => ErrorSeverity::Transient,
            },
            TransportError::Mqtt(_) => ErrorSeverity::Transient,
            TransportError::InvalidPublish { .. } => ErrorSeverity::DataPolicy,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+\S+").expect("valid bearer pattern"));

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path pattern")
});

/// Redact credentials from a message before it reaches the logs.
///
/// Covers `key=value` secrets, bearer tokens and paths below well-known
/// secret directories, then caps the length.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let sanitized = BEARER_PATTERN.replace_all(&sanitized, "Bearer ***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::ConnectionStatus;

    #[test]
    fn test_severity_classes() {
        let fatal = TransportError::Config(ConfigError::MissingField("endpoint"));
        assert_eq!(fatal.severity(), ErrorSeverity::Fatal);
        assert!(fatal.is_fatal());

        let transient = TransportError::Mqtt(MqttError::NotConnected {
            status: ConnectionStatus::Reconnecting,
        });
        assert_eq!(transient.severity(), ErrorSeverity::Transient);

        let rejected = TransportError::Pairing(PairingError::InvalidCertificate {
            cause: "EXPIRED".to_string(),
            details: String::new(),
        });
        assert_eq!(rejected.severity(), ErrorSeverity::TerminalRecoverable);

        let refused = TransportError::invalid_publish("unknown interface");
        assert_eq!(refused.severity(), ErrorSeverity::DataPolicy);
        assert_eq!(refused.to_string(), "Invalid publish: unknown interface");
    }

    #[test]
    fn test_network_pairing_errors_are_transient() {
        let error = TransportError::Pairing(PairingError::Http {
            status: 503,
            body: "unavailable".to_string(),
        });
        assert_eq!(error.severity(), ErrorSeverity::Transient);
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_bearer_tokens_are_redacted() {
        let sanitized = sanitize_error_message("401 for Authorization: Bearer s3cr3t-value");

        assert!(!sanitized.contains("s3cr3t-value"));
        assert!(sanitized.contains("Bearer ***"));
    }

    #[test]
    fn test_sanitize_case_insensitive() {
        let sanitized = sanitize_error_message("SECRET=abc Key: xyz");

        assert!(!sanitized.contains("abc"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_file_path_redaction() {
        let message = "Failed to read /home/device/.config/astarte/credentials_secret";
        let sanitized = sanitize_error_message(message);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("credentials_secret"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));

        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATE_SUFFIX));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));

        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with(TRUNCATE_SUFFIX));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let sanitized = sanitize_error_message(&"x".repeat(500));
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }
}
