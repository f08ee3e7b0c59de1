//! Randomized retry intervals
//!
//! Every retrying operation in the transport waits a fixed base interval
//! stretched by a random jitter factor. There is no exponential growth: a
//! device that has been offline for a week retries exactly as often as one
//! that went offline a minute ago.

use rand::Rng;
use std::time::Duration;

/// Base interval between pairing attempts.
pub const PAIRING_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Base interval between broker-info, registration and verification attempts.
pub const ENDPOINT_RETRY_INTERVAL: Duration = Duration::from_secs(15);
/// Base interval between broker reconnection attempts.
pub const CONNECTION_RETRY_INTERVAL: Duration = Duration::from_secs(15);
/// Base duration of the CONNACK watchdog.
pub const CONNACK_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Certificates expiring within this window are renewed before connecting.
pub const CERTIFICATE_RENEWAL_WINDOW: Duration = Duration::from_secs(8 * 24 * 60 * 60);

/// Compute `base + base * coefficient * r` with `r` uniform in `[0, 1)`.
pub fn randomized_interval(base: Duration, coefficient: f64) -> Duration {
    if coefficient <= 0.0 || base.is_zero() {
        return base;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
    base + base.mul_f64(coefficient * factor)
}

/// Fixed-base, jittered retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub coefficient: f64,
}

impl RetryPolicy {
    pub const fn new(base: Duration, coefficient: f64) -> Self {
        Self { base, coefficient }
    }

    pub const fn pairing() -> Self {
        Self::new(PAIRING_RETRY_INTERVAL, 1.0)
    }

    pub const fn endpoint() -> Self {
        Self::new(ENDPOINT_RETRY_INTERVAL, 1.0)
    }

    pub const fn connection() -> Self {
        Self::new(CONNECTION_RETRY_INTERVAL, 1.0)
    }

    pub const fn connack() -> Self {
        Self::new(CONNACK_TIMEOUT, 0.5)
    }

    /// Reboot watchdog: the operator-configured delay with 10% jitter.
    pub fn reboot(delay_minutes: u64) -> Self {
        Self::new(Duration::from_secs(delay_minutes * 60), 0.1)
    }

    /// Draw the next delay.
    pub fn next_delay(&self) -> Duration {
        randomized_interval(self.base, self.coefficient)
    }

    /// Upper bound on any delay this policy can produce.
    pub fn max_delay(&self) -> Duration {
        self.base + self.base.mul_f64(self.coefficient.max(0.0))
    }
}
