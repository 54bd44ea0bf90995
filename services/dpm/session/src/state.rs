//! State shared between the manager API and the session tasks.

use dpm_power::{EventBits, EventGroup, RtcTimerService, SleepGate, TimerId, Watchdog};
use dpm_secure::SessionCodec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::callbacks::{ErrorHandler, SessionCallbacks};
use crate::config::SessionConfig;
use crate::lifecycle::Lifecycle;
use crate::link::Link;
use crate::subsession::SubSessionPool;
use crate::DpmError;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Bounded waits of the public API
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// How long `start_session` waits for a running state
    pub start_wait: Duration,
    /// How long `stop_session` waits for `Stop`
    pub stop_wait: Duration,
    /// How long `send_to_session` waits for `Run`
    pub send_wait: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            start_wait: Duration::from_secs(5),
            stop_wait: Duration::from_millis(2000),
            send_wait: Duration::from_millis(1000),
        }
    }
}

/// Collaborators the session layer runs against
#[derive(Clone)]
pub struct SessionDeps {
    /// Sleep readiness vote
    pub gate: Arc<SleepGate>,
    /// RTC timers (keep-alive)
    pub timers: Arc<RtcTimerService>,
    /// Event group the keep-alive timers post into
    pub events: Arc<EventGroup>,
    /// Secure session snapshots
    pub codec: SessionCodec,
    /// Watchdog suspended around handshakes
    pub watchdog: Arc<dyn Watchdog>,
}

pub(crate) struct Shared {
    pub gate: Arc<SleepGate>,
    pub timers: Arc<RtcTimerService>,
    pub events: Arc<EventGroup>,
    pub codec: SessionCodec,
    pub watchdog: Arc<dyn Watchdog>,
    pub options: ManagerOptions,
    pub error_handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
    pub wake: AtomicBool,
}

impl Shared {
    pub fn new(deps: SessionDeps, options: ManagerOptions) -> Self {
        Self {
            gate: deps.gate,
            timers: deps.timers,
            events: deps.events,
            codec: deps.codec,
            watchdog: deps.watchdog,
            options,
            error_handler: RwLock::new(None),
            wake: AtomicBool::new(false),
        }
    }

    /// Log an asynchronous failure and hand it to the error callback
    pub fn report(&self, session: u8, err: &DpmError) {
        error!("Session {} error 0x{:02x}: {}", session, err.code(), err);
        let handler = read(&self.error_handler).clone();
        if let Some(handler) = handler {
            handler.on_error(err.code(), &err.to_string());
        }
    }

    pub fn gate_register(&self, module: &str, port: Option<u16>) {
        if let Err(e) = self.gate.register(module, port) {
            warn!("Sleep gate registration of {} failed: {}", module, e);
        }
    }

    pub fn gate_unregister(&self, module: &str) {
        if let Err(e) = self.gate.unregister(module) {
            debug!("Sleep gate unregister of {}: {}", module, e);
        }
    }

    pub fn gate_ready(&self, module: &str) {
        if let Err(e) = self.gate.set_ready(module) {
            warn!("Sleep gate set_ready of {} failed: {}", module, e);
        }
    }

    pub fn gate_busy(&self, module: &str) {
        if let Err(e) = self.gate.clear_ready(module) {
            warn!("Sleep gate clear_ready of {} failed: {}", module, e);
        }
    }

    pub fn gate_receive_ready(&self, module: &str) {
        if let Err(e) = self.gate.set_receive_ready(module) {
            debug!("Receive-ready of {}: {}", module, e);
        }
    }

    /// Periodic keep-alive timer posting `bit`
    pub fn arm_keepalive(
        &self,
        session: u8,
        owner: &str,
        interval_ms: u64,
        bit: Option<EventBits>,
    ) -> Option<TimerId> {
        let bit = bit?;
        if interval_ms == 0 {
            return None;
        }
        let events = self.events.clone();
        let callback = Arc::new(move |_id: TimerId| {
            events.set(bit);
        });
        match self.timers.register(interval_ms, owner, None, true, callback) {
            Ok(id) => {
                debug!("Keep-alive timer {} armed for {} every {} ms", id, owner, interval_ms);
                Some(id)
            }
            Err(e) => {
                self.report(session, &DpmError::TimerCreate(e));
                None
            }
        }
    }

    /// Drop a secure snapshot that no longer matches a live session
    pub fn clear_snapshot(&self, name: &str) {
        if !self.codec.is_enabled() {
            return;
        }
        if let Err(e) = self.codec.clear(name) {
            warn!("Clearing snapshot {} failed: {}", name, e);
        }
    }
}

/// Advisory send/receive flags of one session or sub-session
#[derive(Debug, Default)]
pub(crate) struct Activity {
    pub sending: AtomicBool,
    pub receiving: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Receive,
}

/// Holds a module's gate bit clear while I/O is in flight.
///
/// Dropping it clears the direction flag and sets the bit again once the other
/// direction is idle as well.
pub(crate) struct Busy<'a> {
    shared: &'a Shared,
    activity: &'a Activity,
    direction: Direction,
    module: &'a str,
}

impl<'a> Busy<'a> {
    pub fn enter(
        shared: &'a Shared,
        activity: &'a Activity,
        direction: Direction,
        module: &'a str,
    ) -> Self {
        let flag = match direction {
            Direction::Send => &activity.sending,
            Direction::Receive => &activity.receiving,
        };
        flag.store(true, Ordering::SeqCst);
        shared.gate_busy(module);
        Self {
            shared,
            activity,
            direction,
            module,
        }
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        let (own, other) = match self.direction {
            Direction::Send => (&self.activity.sending, &self.activity.receiving),
            Direction::Receive => (&self.activity.receiving, &self.activity.sending),
        };
        own.store(false, Ordering::SeqCst);
        if !other.load(Ordering::SeqCst) {
            self.shared.gate_ready(self.module);
        }
    }
}

/// One entry of the session arena
pub(crate) struct SessionSlot {
    pub id: u8,
    pub config: RwLock<SessionConfig>,
    pub callbacks: RwLock<SessionCallbacks>,
    pub lifecycle: Lifecycle,
    pub activity: Activity,
    pub link: RwLock<Option<Arc<Link>>>,
    pub udp_socket: RwLock<Option<Arc<UdpSocket>>>,
    pub subs: Mutex<SubSessionPool>,
    pub force_stopped: AtomicBool,
    pub task: Mutex<Option<JoinHandle<()>>>,
    pub keepalive: Mutex<Option<TimerId>>,
}

impl SessionSlot {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            config: RwLock::new(SessionConfig::new(id)),
            callbacks: RwLock::new(SessionCallbacks::default()),
            lifecycle: Lifecycle::new(),
            activity: Activity::default(),
            link: RwLock::new(None),
            udp_socket: RwLock::new(None),
            subs: Mutex::new(SubSessionPool::new(0)),
            force_stopped: AtomicBool::new(false),
            task: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SessionConfig {
        read(&self.config).clone()
    }

    pub fn callbacks(&self) -> SessionCallbacks {
        read(&self.callbacks).clone()
    }

    pub fn link(&self) -> Option<Arc<Link>> {
        read(&self.link).clone()
    }

    pub fn task_alive(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpm_power::NullWatchdog;
    use dpm_retention::MemoryRetention;

    fn shared(dpm: bool) -> Shared {
        Shared::new(
            SessionDeps {
                gate: Arc::new(SleepGate::new(dpm)),
                timers: Arc::new(RtcTimerService::new()),
                events: Arc::new(EventGroup::new()),
                codec: SessionCodec::new(Arc::new(MemoryRetention::new(4096)), dpm),
                watchdog: Arc::new(NullWatchdog),
            },
            ManagerOptions::default(),
        )
    }

    #[test]
    fn test_busy_releases_when_both_directions_idle() {
        let shared = shared(true);
        shared.gate_register("tcp_cnt1", None);
        shared.gate_ready("tcp_cnt1");
        let activity = Activity::default();

        let sending = Busy::enter(&shared, &activity, Direction::Send, "tcp_cnt1");
        assert!(!shared.gate.sleep_permitted());
        let receiving = Busy::enter(&shared, &activity, Direction::Receive, "tcp_cnt1");

        drop(sending);
        // Still receiving
        assert!(!shared.gate.sleep_permitted());
        drop(receiving);
        assert!(shared.gate.sleep_permitted());
        assert!(!activity.sending.load(Ordering::SeqCst));
    }

    #[test]
    fn test_report_reaches_handler() {
        let shared = shared(false);
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = codes.clone();
        *write(&shared.error_handler) = Some(Arc::new(move |code: u32, _msg: &str| {
            sink.lock().unwrap().push(code);
        }));
        shared.report(1, &DpmError::SocketNotConnect(1));
        assert_eq!(*codes.lock().unwrap(), vec![0x20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timer_posts_bit() {
        let shared = shared(true);
        let id = shared
            .arm_keepalive(1, "tcp_cnt1", 500, EventBits::tcp_client_keepalive(1))
            .unwrap();
        let bits = shared
            .events
            .wait_any_timeout(EventBits::TCP_CLIENT_KA, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bits, EventBits::TCP_CLIENT_KA1);
        assert!(shared.timers.cancel(id));

        assert!(shared
            .arm_keepalive(1, "tcp_cnt1", 0, EventBits::tcp_client_keepalive(1))
            .is_none());
    }
}
