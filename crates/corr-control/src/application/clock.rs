//! Wall-clock port used by the synchronisation protocols.

use std::time::Duration;

use async_trait::async_trait;
use corr_core::timing::Timestamp;

/// Source of wall-clock time and of sleeps measured against it.
///
/// Production code uses the system clock; tests use a manual clock that
/// advances only when slept on.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Suspends the caller for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Suspends the caller until `deadline`; returns at once if it has passed.
    async fn sleep_until(&self, deadline: Timestamp) {
        if let Some(remaining) = deadline.duration_since(self.now()) {
            self.sleep(remaining).await;
        }
    }
}
