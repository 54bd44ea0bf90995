//! Watchdog seam for long blocking operations.
//!
//! Secure handshakes and secure reads can outlast the watchdog period, so they run inside
//! [`guarded`], which kicks and suspends the watchdog for the duration and restores it even
//! if the guarded future is dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hardware or software watchdog
pub trait Watchdog: Send + Sync {
    /// Kick the watchdog
    fn notify(&self);
    /// Stop counting (nestable)
    fn suspend(&self);
    /// Resume counting after a matching `suspend`
    fn resume(&self);
}

/// Watchdog that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWatchdog;

impl Watchdog for NullWatchdog {
    fn notify(&self) {}
    fn suspend(&self) {}
    fn resume(&self) {}
}

/// Software watchdog that records kicks and reports expiry
#[derive(Debug)]
pub struct SoftWatchdog {
    timeout: Duration,
    last_kick: Mutex<Instant>,
    suspended: AtomicU32,
    kicks: AtomicU64,
}

impl SoftWatchdog {
    /// Create a watchdog that expires after `timeout` without a kick
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_kick: Mutex::new(Instant::now()),
            suspended: AtomicU32::new(0),
            kicks: AtomicU64::new(0),
        }
    }

    /// True when not suspended and not kicked within the timeout
    pub fn expired(&self) -> bool {
        if self.is_suspended() {
            return false;
        }
        let last = *self.last_kick.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed() > self.timeout
    }

    /// Number of kicks so far
    pub fn kicks(&self) -> u64 {
        self.kicks.load(Ordering::SeqCst)
    }

    /// Whether any suspension is outstanding
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst) > 0
    }
}

impl Watchdog for SoftWatchdog {
    fn notify(&self) {
        *self.last_kick.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }

    fn suspend(&self) {
        let depth = self.suspended.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Watchdog suspended depth={}", depth);
    }

    fn resume(&self) {
        let result = self
            .suspended
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
        if result.is_err() {
            warn!("Watchdog resume without matching suspend");
        }
    }
}

struct Suspension<'a>(&'a dyn Watchdog);

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        self.0.notify();
        self.0.resume();
    }
}

/// Run `fut` with the watchdog kicked and suspended, then kick and resume it
pub async fn guarded<F: Future>(watchdog: &dyn Watchdog, fut: F) -> F::Output {
    watchdog.notify();
    watchdog.suspend();
    let _suspension = Suspension(watchdog);
    fut.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_guarded_suspends_and_resumes() {
        let watchdog = Arc::new(SoftWatchdog::new(Duration::from_millis(5)));

        let inner = watchdog.clone();
        let value = guarded(watchdog.as_ref(), async move {
            assert!(inner.is_suspended());
            tokio::time::sleep(Duration::from_millis(20)).await;
            // Suspended watchdogs never expire
            assert!(!inner.expired());
            42
        })
        .await;

        assert_eq!(value, 42);
        assert!(!watchdog.is_suspended());
        assert_eq!(watchdog.kicks(), 2);
    }

    #[tokio::test]
    async fn test_dropped_future_resumes() {
        let watchdog = SoftWatchdog::new(Duration::from_secs(1));
        let result = tokio::time::timeout(
            Duration::from_millis(10),
            guarded(&watchdog, std::future::pending::<()>()),
        )
        .await;

        assert!(result.is_err());
        assert!(!watchdog.is_suspended());
    }

    #[test]
    fn test_expiry() {
        let watchdog = SoftWatchdog::new(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(80));
        assert!(watchdog.expired());
        watchdog.notify();
        assert!(!watchdog.expired());
    }
}
