//! RTC timer service.
//!
//! Timers are identified by a numeric [`TimerId`] and an owner name rather than by a
//! callback pointer, so the set of armed timers can be persisted and re-armed after a
//! wake with callbacks resolved again by name.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Milliseconds on the RTC clock since the service layer started
pub fn rtc_ticks() -> u64 {
    static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
    START.elapsed().as_millis() as u64
}

/// First id handed out without a hint; lower ids are reserved for callers that pin ids
pub const FIRST_DYNAMIC_ID: u32 = 0x100;

/// Timer identifier
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u32);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked from the timer context when a timer fires
pub type TimerCallback = Arc<dyn Fn(TimerId) + Send + Sync>;

/// Persistable description of an armed timer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEntry {
    /// Timer identifier
    pub id: TimerId,
    /// Owner (module) name
    pub owner: String,
    /// Interval in milliseconds
    pub interval_ms: u64,
    /// Re-arms after firing
    pub periodic: bool,
}

/// Timer errors
#[derive(Error, Debug)]
pub enum TimerError {
    /// Interval of zero
    #[error("timer interval must be non-zero")]
    ZeroInterval,
    /// No such timer
    #[error("timer {0} not found")]
    NotFound(TimerId),
    /// Called outside a tokio runtime
    #[error("no runtime available to drive timers")]
    NoRuntime,
}

struct ArmedTimer {
    entry: TimerEntry,
    callback: TimerCallback,
    armed_at: Instant,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Periodic and one-shot timers driven by the tokio clock
pub struct RtcTimerService {
    timers: Arc<DashMap<TimerId, ArmedTimer>>,
    next_id: AtomicU32,
    generation: AtomicU64,
}

impl RtcTimerService {
    /// Create an empty timer service
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            next_id: AtomicU32::new(FIRST_DYNAMIC_ID),
            generation: AtomicU64::new(0),
        }
    }

    fn allocate_id(&self) -> TimerId {
        loop {
            let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
            if id.0 >= FIRST_DYNAMIC_ID && !self.timers.contains_key(&id) {
                return id;
            }
        }
    }

    /// Arm a timer.
    ///
    /// `id_hint` keeps a previously returned id stable: if a timer with that id is armed it
    /// is replaced. Without a hint a fresh id is assigned.
    pub fn register(
        &self,
        interval_ms: u64,
        owner: &str,
        id_hint: Option<TimerId>,
        periodic: bool,
        callback: TimerCallback,
    ) -> Result<TimerId, TimerError> {
        if interval_ms == 0 {
            return Err(TimerError::ZeroInterval);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TimerError::NoRuntime)?;

        let id = match id_hint {
            Some(hint) if hint.0 != 0 => {
                if self.cancel(hint) {
                    debug!("Timer {} replaced by new registration", hint);
                }
                hint
            }
            _ => self.allocate_id(),
        };

        let entry = TimerEntry {
            id,
            owner: owner.to_string(),
            interval_ms,
            periodic,
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let armed_at = Instant::now();
        let handle = runtime.spawn(run_timer(
            entry.clone(),
            callback.clone(),
            armed_at,
            generation,
            self.timers.clone(),
        ));

        info!(
            "Timer registered id={} owner={} interval={}ms periodic={}",
            id, owner, interval_ms, periodic
        );
        self.timers.insert(
            id,
            ArmedTimer {
                entry,
                callback,
                armed_at,
                generation,
                handle,
            },
        );
        Ok(id)
    }

    /// Disarm a timer; returns false if it was not armed
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some((_, timer)) => {
                timer.handle.abort();
                debug!("Timer cancelled id={} owner={}", id, timer.entry.owner);
                true
            }
            None => false,
        }
    }

    /// Re-arm a timer with a new interval, keeping id, owner and callback
    pub fn change(&self, id: TimerId, interval_ms: u64) -> Result<(), TimerError> {
        let (owner, periodic, callback) = {
            let timer = self.timers.get(&id).ok_or(TimerError::NotFound(id))?;
            (
                timer.entry.owner.clone(),
                timer.entry.periodic,
                timer.callback.clone(),
            )
        };
        self.register(interval_ms, &owner, Some(id), periodic, callback)?;
        Ok(())
    }

    /// Time until the timer next fires
    pub fn remaining(&self, id: TimerId) -> Option<Duration> {
        let timer = self.timers.get(&id)?;
        let interval = timer.entry.interval_ms;
        let elapsed = timer.armed_at.elapsed().as_millis() as u64;
        let left = if timer.entry.periodic {
            interval - (elapsed % interval)
        } else {
            interval.saturating_sub(elapsed)
        };
        Some(Duration::from_millis(left))
    }

    /// Whether a timer is armed
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// All armed timers, ordered by id
    pub fn entries(&self) -> Vec<TimerEntry> {
        let mut entries: Vec<TimerEntry> =
            self.timers.iter().map(|t| t.value().entry.clone()).collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    /// Re-arm persisted timers after a wake.
    ///
    /// `resolve` maps each entry back to its callback; entries it cannot resolve are skipped.
    /// Returns the number of timers armed.
    pub fn rearm<F>(&self, entries: &[TimerEntry], resolve: F) -> Result<usize, TimerError>
    where
        F: Fn(&TimerEntry) -> Option<TimerCallback>,
    {
        let mut armed = 0;
        for entry in entries {
            match resolve(entry) {
                Some(callback) => {
                    self.register(
                        entry.interval_ms,
                        &entry.owner,
                        Some(entry.id),
                        entry.periodic,
                        callback,
                    )?;
                    armed += 1;
                }
                None => warn!("No callback for timer id={} owner={}", entry.id, entry.owner),
            }
        }
        Ok(armed)
    }

    /// Disarm every timer
    pub fn cancel_all(&self) {
        let ids: Vec<TimerId> = self.timers.iter().map(|t| *t.key()).collect();
        for id in ids {
            self.cancel(id);
        }
    }
}

impl Default for RtcTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RtcTimerService {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.handle.abort();
        }
    }
}

async fn run_timer(
    entry: TimerEntry,
    callback: TimerCallback,
    armed_at: Instant,
    generation: u64,
    timers: Arc<DashMap<TimerId, ArmedTimer>>,
) {
    let interval = Duration::from_millis(entry.interval_ms);
    let mut deadline = armed_at + interval;

    loop {
        tokio::time::sleep_until(deadline).await;
        debug!("Timer fired id={} owner={}", entry.id, entry.owner);
        callback(entry.id);

        if !entry.periodic {
            timers.remove_if(&entry.id, |_, timer| timer.generation == generation);
            break;
        }
        deadline += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counter() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let callback: TimerCallback = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer() {
        let service = RtcTimerService::new();
        let (count, callback) = counter();

        let id = service.register(100, "user_timer", None, true, callback).unwrap();
        sleep(Duration::from_millis(350)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(service.is_armed(id));
        assert!(service.remaining(id).unwrap() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_timer() {
        let service = RtcTimerService::new();
        let (count, callback) = counter();

        let id = service.register(200, "one_shot", None, false, callback).unwrap();
        sleep(Duration::from_millis(1000)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!service.is_armed(id));
        assert!(service.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_hint() {
        let service = RtcTimerService::new();
        let (count, callback) = counter();

        let id = service
            .register(100, "keepalive", Some(TimerId(11)), true, callback.clone())
            .unwrap();
        assert_eq!(id, TimerId(11));

        // Re-registering under the same id replaces the timer
        let again = service
            .register(500, "keepalive", Some(id), true, callback)
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(service.entries().len(), 1);
        assert_eq!(service.entries()[0].interval_ms, 500);

        assert!(service.cancel(id));
        assert!(!service.cancel(id));
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_interval() {
        let service = RtcTimerService::new();
        let (count, callback) = counter();

        let id = service.register(1000, "user_timer", None, true, callback).unwrap();
        service.change(id, 100).unwrap();
        sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(matches!(
            service.change(TimerId(999), 10),
            Err(TimerError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_wake() {
        let before = RtcTimerService::new();
        let (_, callback) = counter();
        before.register(100, "timer1", Some(TimerId(1)), true, callback.clone()).unwrap();
        before.register(300, "timer2", Some(TimerId(2)), false, callback).unwrap();
        let persisted = before.entries();
        drop(before);

        let after = RtcTimerService::new();
        let (count, callback) = counter();
        let armed = after
            .rearm(&persisted, |entry| {
                (entry.owner == "timer1").then(|| callback.clone())
            })
            .unwrap();

        assert_eq!(armed, 1);
        assert_eq!(after.entries()[0].id, TimerId(1));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let service = RtcTimerService::new();
        let (_, callback) = counter();
        assert!(matches!(
            service.register(0, "bad", None, true, callback),
            Err(TimerError::ZeroInterval)
        ));
    }

    #[test]
    fn test_rtc_ticks_monotonic() {
        let a = rtc_ticks();
        std::thread::sleep(Duration::from_millis(2));
        assert!(rtc_ticks() >= a + 1);
    }
}
