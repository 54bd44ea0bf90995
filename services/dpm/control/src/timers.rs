//! User timers 1..=4.
//!
//! The RTC timer of user timer `n` is pinned to `TimerId(n)` and only posts
//! `EventBits::timer(n)`; the handler is looked up by the event manager at dispatch time,
//! so a wake can re-arm the timer before the application has registered its handler again.

use dpm_power::{EventBits, EventGroup, RtcTimerService, TimerCallback, TimerEntry, TimerId};
use dpm_session::{DpmError, TimerHandler, MAX_TIMER_CNT};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::ControlError;
use crate::persist::UserTimer;

/// RTC owner name of user timer `n`
pub fn timer_owner(n: u8) -> String {
    format!("dpm_timer{}", n)
}

fn check_id(n: u8) -> Result<usize, ControlError> {
    if n == 0 || n as usize > MAX_TIMER_CNT {
        return Err(DpmError::TimerType(n).into());
    }
    Ok(n as usize - 1)
}

fn post(events: &Arc<EventGroup>, n: u8) -> Option<TimerCallback> {
    let bit = EventBits::timer(n)?;
    let events = events.clone();
    Some(Arc::new(move |_id: TimerId| {
        events.set(bit);
    }))
}

/// Handlers of the user timers, shared with the event manager
#[derive(Clone, Default)]
pub struct TimerHandlers {
    slots: Arc<RwLock<[Option<Arc<dyn TimerHandler>>; MAX_TIMER_CNT]>>,
}

impl TimerHandlers {
    /// Handler of user timer `n`
    pub fn get(&self, n: u8) -> Option<Arc<dyn TimerHandler>> {
        let index = check_id(n).ok()?;
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots[index].clone()
    }

    fn set(&self, index: usize, handler: Option<Arc<dyn TimerHandler>>) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots[index] = handler;
    }
}

/// Configured user timers and their RTC registrations
pub struct UserTimers {
    rtc: Arc<RtcTimerService>,
    events: Arc<EventGroup>,
    handlers: TimerHandlers,
    configs: [Option<UserTimer>; MAX_TIMER_CNT],
}

impl UserTimers {
    /// No timers configured
    pub fn new(rtc: Arc<RtcTimerService>, events: Arc<EventGroup>) -> Self {
        Self {
            rtc,
            events,
            handlers: TimerHandlers::default(),
            configs: [None; MAX_TIMER_CNT],
        }
    }

    /// Handler table for the event manager
    pub fn handlers(&self) -> TimerHandlers {
        self.handlers.clone()
    }

    /// Arm user timer `n` and install its handler
    pub fn set<H>(&mut self, n: u8, periodic: bool, interval_ms: u64, handler: H) -> Result<(), ControlError>
    where
        H: TimerHandler + 'static,
    {
        let index = check_id(n)?;
        self.arm(UserTimer {
            id: n,
            periodic,
            interval_ms,
        })?;
        self.handlers.set(index, Some(Arc::new(handler)));
        Ok(())
    }

    /// Install the handler of user timer `n` without touching its RTC timer
    pub fn bind<H>(&mut self, n: u8, handler: H) -> Result<(), ControlError>
    where
        H: TimerHandler + 'static,
    {
        let index = check_id(n)?;
        self.handlers.set(index, Some(Arc::new(handler)));
        Ok(())
    }

    /// Disarm user timer `n`; true if it was armed
    pub fn unset(&mut self, n: u8) -> Result<bool, ControlError> {
        let index = check_id(n)?;
        self.configs[index] = None;
        self.handlers.set(index, None);
        let cancelled = self.rtc.cancel(TimerId(n as u32));
        info!("User timer {} unset", n);
        Ok(cancelled)
    }

    fn arm(&mut self, timer: UserTimer) -> Result<(), ControlError> {
        let index = check_id(timer.id)?;
        let callback = post(&self.events, timer.id).ok_or(DpmError::TimerType(timer.id))?;
        self.rtc
            .register(
                timer.interval_ms,
                &timer_owner(timer.id),
                Some(TimerId(timer.id as u32)),
                timer.periodic,
                callback,
            )
            .map_err(DpmError::TimerCreate)?;
        self.configs[index] = Some(timer);
        info!(
            "User timer {} armed every {} ms (periodic: {})",
            timer.id, timer.interval_ms, timer.periodic
        );
        Ok(())
    }

    /// Re-arm persisted timers after a wake; returns the number armed
    pub fn rearm(&mut self, timers: &[UserTimer]) -> Result<usize, ControlError> {
        let mut entries = Vec::new();
        for timer in timers {
            let index = check_id(timer.id)?;
            self.configs[index] = Some(*timer);
            entries.push(TimerEntry {
                id: TimerId(timer.id as u32),
                owner: timer_owner(timer.id),
                interval_ms: timer.interval_ms,
                periodic: timer.periodic,
            });
        }
        let events = self.events.clone();
        let armed = self
            .rtc
            .rearm(&entries, |entry| {
                let n = u8::try_from(entry.id.0).ok()?;
                post(&events, n)
            })
            .map_err(DpmError::TimerCreate)?;
        debug!("Re-armed {} user timers", armed);
        Ok(armed)
    }

    /// Timers to persist
    pub fn snapshot(&self) -> Vec<UserTimer> {
        self.configs.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn timers() -> UserTimers {
        UserTimers::new(Arc::new(RtcTimerService::new()), Arc::new(EventGroup::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_posts_timer_bit() {
        let mut timers = timers();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        timers
            .set(2, true, 1000, move |n: u8| {
                counter.fetch_add(n as u32, Ordering::SeqCst);
            })
            .unwrap();
        assert!(timers.rtc.is_armed(TimerId(2)));

        let bits = timers
            .events
            .wait_any_timeout(EventBits::TIMERS, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(bits, EventBits::TIMER2);
        timers.handlers().get(2).unwrap().on_timer(2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(timers.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_id_is_timer_type() {
        let mut timers = timers();
        let err = timers.set(5, false, 100, |_n: u8| {}).unwrap_err();
        assert!(matches!(err, ControlError::Session(DpmError::TimerType(5))));
        assert!(timers.unset(0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_keeps_ids() {
        let mut timers = timers();
        let persisted = vec![
            UserTimer {
                id: 1,
                periodic: true,
                interval_ms: 500,
            },
            UserTimer {
                id: 4,
                periodic: false,
                interval_ms: 800,
            },
        ];
        assert_eq!(timers.rearm(&persisted).unwrap(), 2);
        assert!(timers.rtc.is_armed(TimerId(1)));
        assert!(timers.rtc.is_armed(TimerId(4)));
        assert_eq!(timers.snapshot(), persisted);

        assert!(timers.unset(4).unwrap());
        assert!(!timers.rtc.is_armed(TimerId(4)));
    }
}
