//! Reboot watchdog
//!
//! When enabled, the watchdog is armed every time the broker session leaves
//! `Connected` and disarmed when it comes back. If it fires, the device has
//! been offline for too long and a reboot is requested from the host.

use crate::retry::RetryPolicy;
use tokio::time::Instant;
use tracing::{debug, error};

/// Host integration for the reboot request.
pub trait RebootHandler: Send + Sync {
    fn request_reboot(&self);
}

/// Default handler: the reboot itself is left to the host supervisor, which
/// is expected to act on this log event.
#[derive(Debug, Default)]
pub struct LoggingRebootHandler;

impl RebootHandler for LoggingRebootHandler {
    fn request_reboot(&self) {
        error!("Connection with Astarte was lost for too long, requesting reboot");
    }
}

/// Deadline tracking for the reboot request.
#[derive(Debug)]
pub struct RebootWatchdog {
    policy: Option<RetryPolicy>,
    deadline: Option<Instant>,
}

impl RebootWatchdog {
    /// A watchdog that never fires.
    pub fn disabled() -> Self {
        Self {
            policy: None,
            deadline: None,
        }
    }

    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Some(policy),
            deadline: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_some()
    }

    /// Start the countdown unless it is already running.
    pub fn arm(&mut self) {
        let Some(policy) = self.policy else {
            return;
        };
        if self.deadline.is_none() {
            let delay = policy.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reboot watchdog armed");
            self.deadline = Some(Instant::now() + delay);
        }
    }

    pub fn disarm(&mut self) {
        if self.deadline.take().is_some() {
            debug!("Reboot watchdog stopped");
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume an elapsed deadline. Returns `true` exactly once per expiry.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(60), 0.1)
    }

    #[test]
    fn test_disabled_watchdog_never_arms() {
        let mut watchdog = RebootWatchdog::disabled();
        watchdog.arm();

        assert!(!watchdog.is_enabled());
        assert_eq!(watchdog.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_within_jitter_bounds() {
        let mut watchdog = RebootWatchdog::new(policy());
        let before = Instant::now();
        watchdog.arm();

        let deadline = watchdog.deadline().unwrap();
        assert!(deadline >= before + Duration::from_secs(60));
        assert!(deadline <= before + policy().max_delay());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_keeps_the_running_countdown() {
        let mut watchdog = RebootWatchdog::new(policy());
        watchdog.arm();
        let first = watchdog.deadline();

        tokio::time::advance(Duration::from_secs(10)).await;
        watchdog.arm();

        assert_eq!(watchdog.deadline(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_then_disarms() {
        let mut watchdog = RebootWatchdog::new(policy());
        watchdog.arm();

        assert!(!watchdog.fire_if_due(Instant::now()));
        tokio::time::advance(policy().max_delay()).await;
        assert!(watchdog.fire_if_due(Instant::now()));
        assert!(!watchdog.fire_if_due(Instant::now()));
        assert_eq!(watchdog.deadline(), None);
    }

    #[test]
    fn test_disarm_cancels() {
        let mut watchdog = RebootWatchdog::new(policy());
        watchdog.arm();
        watchdog.disarm();

        assert_eq!(watchdog.deadline(), None);
    }
}
