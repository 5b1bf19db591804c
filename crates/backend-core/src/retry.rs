use std::time::Duration;

use crate::error::SyncFailureClass;

/// Delay policy for re-arming sync cycles after a failure.
///
/// Transient failures retry the identical request with no backoff growth;
/// protocol failures wait a fixed delay. The delay is deliberately
/// non-exponential.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    transient_delay_ms: u64,
    protocol_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(transient_delay_ms: u64, protocol_delay_ms: u64) -> Self {
        Self {
            transient_delay_ms,
            protocol_delay_ms,
        }
    }

    pub fn protocol_delay_ms(&self) -> u64 {
        self.protocol_delay_ms
    }

    /// Delay before the next attempt, or `None` when the failure class does
    /// not permit a retry.
    pub fn delay_for(&self, class: SyncFailureClass) -> Option<Duration> {
        match class {
            SyncFailureClass::Transient => Some(Duration::from_millis(self.transient_delay_ms)),
            SyncFailureClass::Protocol => Some(Duration::from_millis(self.protocol_delay_ms)),
            SyncFailureClass::AuthInvalid => None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(0, 10_000)
    }
}
