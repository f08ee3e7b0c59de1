//! Device transport
//!
//! - [`mqtt`] - broker session wrapper over rumqttc
//! - [`orchestrator`] - the [`Transport`] state machine
//! - [`handle`] - [`TransportHandle`] and [`PublishRequest`] for adapters
//! - [`adapter`] - the [`InterfaceAdapter`] callback trait
//! - [`sync_state`] - the persisted `synced` flag
//! - [`watchdog`] - the optional reboot watchdog

pub mod adapter;
pub mod handle;
pub mod mqtt;
pub mod orchestrator;
pub mod sync_state;
pub mod watchdog;

pub use adapter::InterfaceAdapter;
pub use handle::{PublishRequest, TransportHandle, TransportSnapshot};
pub use orchestrator::{EventOutcome, Session, Transport};
pub use sync_state::SyncState;
pub use watchdog::{LoggingRebootHandler, RebootHandler, RebootWatchdog};

use crate::config::TransportConfig;
use crate::retry::RetryPolicy;

/// Retry timing used by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportOptions {
    /// Between failed pairing or session setup attempts
    pub pairing_retry: RetryPolicy,
    /// Between failed registration, verification and broker-info calls
    pub endpoint_retry: RetryPolicy,
    /// Reboot watchdog; `None` disables it
    pub reboot_retry: Option<RetryPolicy>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            pairing_retry: RetryPolicy::pairing(),
            endpoint_retry: RetryPolicy::endpoint(),
            reboot_retry: None,
        }
    }
}

impl TransportOptions {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            reboot_retry: config
                .reboot_when_connection_fails
                .then(|| RetryPolicy::reboot(config.reboot_delay_minutes)),
            ..Self::default()
        }
    }
}
