//! Event manager: single dispatcher for timer and keep-alive events.

use dpm_power::{guarded, EventBits, EventGroup, SleepGate, Watchdog};
use dpm_session::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::control::DoneFlag;
use crate::timers::TimerHandlers;

/// Sleep gate module of the event manager
pub const EVENT_MODULE: &str = "dpm_event";
/// Polls of the done flag before pending bits are discarded
pub const DONE_POLL_COUNT: u32 = 20;
/// Interval between done flag polls (two RTOS ticks)
pub const DONE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Waits on the event group and dispatches set bits
pub struct EventManager {
    sessions: SessionManager,
    events: Arc<EventGroup>,
    gate: Arc<SleepGate>,
    handlers: TimerHandlers,
    done: DoneFlag,
    watchdog: Option<Arc<dyn Watchdog>>,
}

impl EventManager {
    /// Dispatcher over the session layer's event group
    pub fn new(sessions: SessionManager, handlers: TimerHandlers, done: DoneFlag) -> Self {
        Self {
            events: sessions.events().clone(),
            gate: sessions.gate().clone(),
            sessions,
            handlers,
            done,
            watchdog: None,
        }
    }

    /// Suspend `watchdog` around each dispatch round
    pub fn with_watchdog(mut self, watchdog: Arc<dyn Watchdog>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Dispatch until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.gate.register(EVENT_MODULE, None) {
            error!("Sleep gate registration of {} failed: {}", EVENT_MODULE, e);
        }
        let _ = self.gate.mark_wakeup_done(EVENT_MODULE);
        info!("Event manager started");

        loop {
            if let Some(watchdog) = &self.watchdog {
                watchdog.notify();
            }
            let _ = self.gate.set_ready(EVENT_MODULE);
            let bits = tokio::select! {
                bits = self.events.wait_any(EventBits::ALL) => bits,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let _ = self.gate.clear_ready(EVENT_MODULE);
            debug!("Events 0x{:03x}", bits.bits());

            if !self.wait_done().await {
                warn!("Control manager not done, discarding events 0x{:03x}", bits.bits());
                self.events.clear(EventBits::ALL);
                continue;
            }

            match &self.watchdog {
                Some(watchdog) => guarded(watchdog.as_ref(), self.dispatch(bits)).await,
                None => self.dispatch(bits).await,
            }
        }

        if let Err(e) = self.gate.unregister(EVENT_MODULE) {
            debug!("Sleep gate unregister of {}: {}", EVENT_MODULE, e);
        }
        info!("Event manager stopped");
    }

    async fn wait_done(&self) -> bool {
        for _ in 0..DONE_POLL_COUNT {
            if self.done.is_set() {
                return true;
            }
            tokio::time::sleep(DONE_POLL_INTERVAL).await;
        }
        self.done.is_set()
    }

    /// Handle `bits`: user timers first, then TCP server keep-alives, then TCP client
    /// keep-alives. Each bit is cleared before its handler runs.
    pub async fn dispatch(&self, bits: EventBits) {
        for n in 1..=4u8 {
            let Some(bit) = EventBits::timer(n).filter(|bit| bits.contains(*bit)) else {
                continue;
            };
            self.events.clear(bit);
            match self.handlers.get(n) {
                Some(handler) => handler.on_timer(n),
                None => warn!("User timer {} fired without a handler", n),
            }
        }

        for n in 1..=4u8 {
            let Some(bit) = EventBits::tcp_server_keepalive(n).filter(|bit| bits.contains(*bit)) else {
                continue;
            };
            self.events.clear(bit);
            let sent = self.sessions.server_keepalive(n).await;
            debug!("Server keep-alive {} sent {} probes", n, sent);
        }

        for n in 1..=4u8 {
            let Some(bit) = EventBits::tcp_client_keepalive(n).filter(|bit| bits.contains(*bit)) else {
                continue;
            };
            self.events.clear(bit);
            if let Err(e) = self.sessions.client_keepalive(n).await {
                self.sessions.report_error(n, &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlManager, ControlOptions};
    use dpm_power::{NullWatchdog, RtcTimerService};
    use dpm_retention::{MemoryRetention, RetentionStore};
    use dpm_secure::SessionCodec;
    use dpm_session::{ManagerOptions, SessionDeps};
    use std::sync::Mutex;

    fn control(dpm: bool) -> ControlManager {
        let store: Arc<dyn RetentionStore> = Arc::new(MemoryRetention::new(4096));
        let sessions = SessionManager::new(
            SessionDeps {
                gate: Arc::new(SleepGate::new(dpm)),
                timers: Arc::new(RtcTimerService::new()),
                events: Arc::new(EventGroup::new()),
                codec: SessionCodec::new(store.clone(), dpm),
                watchdog: Arc::new(NullWatchdog),
            },
            ManagerOptions::default(),
        );
        ControlManager::new(store, sessions, ControlOptions::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_discarded_before_done() {
        let control = control(true);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        control
            .set_timer(1, false, 60_000, move |n: u8| sink.lock().unwrap().push(n))
            .unwrap();
        let events = control.sessions().events().clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(control.event_manager().run(rx));

        events.set(EventBits::TIMER1);
        tokio::time::sleep(DONE_POLL_INTERVAL * (DONE_POLL_COUNT + 5)).await;
        assert!(events.get().is_empty());
        assert!(fired.lock().unwrap().is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_order_and_clearing() {
        let control = control(false);
        control.run().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let timer_sink = order.clone();
        control
            .set_timer(2, true, 60_000, move |n: u8| {
                timer_sink.lock().unwrap().push(format!("timer{}", n))
            })
            .unwrap();
        let error_sink = order.clone();
        control
            .sessions()
            .set_error_handler(move |code: u32, _message: &str| {
                error_sink.lock().unwrap().push(format!("error 0x{:02x}", code))
            });

        let manager = control.event_manager();
        let events = control.sessions().events().clone();
        events.set(EventBits::TCP_CLIENT_KA1 | EventBits::TIMER2 | EventBits::TCP_SERVER_KA1);
        manager.dispatch(events.get()).await;

        assert!(events.get().is_empty());
        // Session 1 is not configured, so its keep-alive reports InvalidSessionType
        assert_eq!(*order.lock().unwrap(), vec!["timer2".to_string(), "error 0x07".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_dispatches_after_done() {
        let control = control(true);
        control.run().await.unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        control
            .set_timer(4, false, 500, move |n: u8| sink.lock().unwrap().push(n))
            .unwrap();
        let gate = control.sessions().gate().clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(
            control
                .event_manager()
                .with_watchdog(Arc::new(NullWatchdog))
                .run(rx),
        );

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(*fired.lock().unwrap(), vec![4]);
        assert_eq!(gate.is_ready(EVENT_MODULE), Some(true));

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(gate.is_ready(EVENT_MODULE), None);
    }
}
