//! Boot/wake orchestration.
//!
//! [`ControlManager::run`] decides once whether this start is a cold boot or a wake from
//! deep power-down, brings configuration and user parameters to a consistent state,
//! starts the sessions and raises the done flag that releases the event manager.

use dpm_power::SleepGate;
use dpm_retention::RetentionStore;
use dpm_session::{DpmError, SessionManager, TimerHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::event::EventManager;
use crate::persist::{PersistedConfig, DPM_USER_PARAMS_NAME};
use crate::timers::UserTimers;

/// Sleep gate module of the control manager
pub const CONTROL_MODULE: &str = "dpm_control";

/// Application hooks run once per start
pub trait InitHandler: Send + Sync {
    /// Cold boot: configure sessions, timers and user parameters
    fn on_boot(&self, control: &ControlManager) -> Result<(), String>;

    /// Wake: configuration is already restored; re-register callbacks
    fn on_wake(&self, control: &ControlManager) -> Result<(), String>;
}

/// Which path [`ControlManager::run`] took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPath {
    /// No usable retained configuration
    ColdBoot,
    /// Retained configuration restored
    Wake,
}

/// Set once configuration is in place; gates event dispatch
#[derive(Debug, Clone, Default)]
pub struct DoneFlag(Arc<AtomicBool>);

impl DoneFlag {
    /// Whether the control manager finished
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Control manager options
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlOptions {
    /// Size of the application's retained parameter blob
    pub user_params_size: usize,
    /// The caller believes this start is a wake; logged when no retained state backs it
    pub expect_wake: bool,
}

/// Boot/wake orchestrator
pub struct ControlManager {
    store: Arc<dyn RetentionStore>,
    sessions: SessionManager,
    options: ControlOptions,
    init: Option<Arc<dyn InitHandler>>,
    timers: Mutex<UserTimers>,
    user_params: Mutex<Vec<u8>>,
    done: DoneFlag,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ControlManager {
    /// Control manager over `store` driving `sessions`
    pub fn new(store: Arc<dyn RetentionStore>, sessions: SessionManager, options: ControlOptions) -> Self {
        let timers = UserTimers::new(sessions.timers().clone(), sessions.events().clone());
        Self {
            store,
            sessions,
            options,
            init: None,
            timers: Mutex::new(timers),
            user_params: Mutex::new(vec![0; options.user_params_size]),
            done: DoneFlag::default(),
        }
    }

    /// Install the boot/wake hooks
    pub fn with_init_handler<H>(mut self, handler: H) -> Self
    where
        H: InitHandler + 'static,
    {
        self.init = Some(Arc::new(handler));
        self
    }

    /// Session layer
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Done flag shared with the event manager
    pub fn done_flag(&self) -> DoneFlag {
        self.done.clone()
    }

    /// Whether `run` finished
    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    fn gate(&self) -> &SleepGate {
        self.sessions.gate()
    }

    fn dpm_enabled(&self) -> bool {
        self.gate().is_enabled()
    }

    /// Event manager dispatching into this control manager's timers and sessions
    pub fn event_manager(&self) -> EventManager {
        EventManager::new(
            self.sessions.clone(),
            guard(&self.timers).handlers(),
            self.done.clone(),
        )
    }

    /// Run the boot or wake path once
    pub async fn run(&self) -> Result<StartPath, ControlError> {
        if let Err(e) = self.gate().register(CONTROL_MODULE, None) {
            warn!("Sleep gate registration of {} failed: {}", CONTROL_MODULE, e);
        }
        let _ = self.gate().clear_ready(CONTROL_MODULE);

        let started = self.start().await;
        if let Ok(path) = started {
            self.done.set();
            if path == StartPath::ColdBoot {
                if let Err(e) = self.persist() {
                    self.persist_failed(e);
                }
            }
            info!("Control manager done ({:?})", path);
        }
        // The control module never holds off sleep past this point, even on failure
        let _ = self.gate().set_ready(CONTROL_MODULE);
        let _ = self.gate().mark_wakeup_done(CONTROL_MODULE);
        started
    }

    async fn start(&self) -> Result<StartPath, ControlError> {
        let retained = if self.dpm_enabled() {
            PersistedConfig::load(self.store.as_ref())
        } else {
            None
        };
        let path = match retained {
            Some(config) => {
                self.wake(config).await?;
                StartPath::Wake
            }
            None => {
                if self.options.expect_wake {
                    warn!("Wake requested but no retained configuration, cold booting");
                }
                self.boot().await?;
                StartPath::ColdBoot
            }
        };
        Ok(path)
    }

    async fn boot(&self) -> Result<(), ControlError> {
        info!("Cold boot");
        self.sessions.set_wake(false);
        match &self.init {
            Some(init) => {
                if let Err(message) = init.on_boot(self) {
                    self.report(DpmError::InitialCallbackFail(message));
                }
            }
            None => self.report(DpmError::NoBootInitCallback),
        }

        if self.dpm_enabled() && self.options.user_params_size > 0 {
            let params = guard(&self.user_params).clone();
            if let Err(e) = self.store.store(DPM_USER_PARAMS_NAME, &params) {
                self.report(DpmError::RetentionAllocFail(e));
            }
        }

        let started = self.sessions.start_all().await;
        info!("{} sessions started", started);
        Ok(())
    }

    async fn wake(&self, config: PersistedConfig) -> Result<(), ControlError> {
        info!(
            "Wake: {} sessions, {} timers retained",
            config.sessions.len(),
            config.timers.len()
        );
        self.sessions.set_wake(true);
        self.sessions.configure(&config.sessions)?;

        if config.user_params_size > 0 {
            match self.store.get(DPM_USER_PARAMS_NAME) {
                Some(params) => *guard(&self.user_params) = params,
                None => self.report(DpmError::RetentionGetFail(DPM_USER_PARAMS_NAME.to_string())),
            }
        }

        match &self.init {
            Some(init) => {
                if let Err(message) = init.on_wake(self) {
                    self.report(DpmError::InitialCallbackFail(message));
                }
            }
            None => self.report(DpmError::NoWakeupInitCallback),
        }

        let armed = guard(&self.timers).rearm(&config.timers)?;
        debug!("{} user timers re-armed", armed);
        let started = self.sessions.start_all().await;
        info!("{} sessions resumed", started);
        Ok(())
    }

    fn report(&self, err: DpmError) {
        self.sessions.report_error(0, &err);
    }

    fn persist_failed(&self, err: ControlError) {
        match err {
            ControlError::Retention(e) => self.report(DpmError::RetentionAllocFail(e)),
            other => warn!("Failed to persist DPM configuration: {}", other),
        }
    }

    /// Write `DPM_CONFIG` from the current session and timer configuration
    pub fn persist(&self) -> Result<(), ControlError> {
        if !self.dpm_enabled() {
            return Ok(());
        }
        let configured = self
            .sessions
            .configs()
            .into_iter()
            .filter(|config| config.kind.is_some())
            .collect();
        let timers = guard(&self.timers).snapshot();
        PersistedConfig::new(configured, timers, self.options.user_params_size).save(self.store.as_ref())
    }

    /// Arm user timer `id` (1..=4)
    pub fn set_timer<H>(&self, id: u8, periodic: bool, interval_ms: u64, handler: H) -> Result<(), ControlError>
    where
        H: TimerHandler + 'static,
    {
        guard(&self.timers).set(id, periodic, interval_ms, handler)?;
        if self.is_done() {
            self.persist()?;
        }
        Ok(())
    }

    /// Install the handler of a retained user timer after a wake
    pub fn bind_timer<H>(&self, id: u8, handler: H) -> Result<(), ControlError>
    where
        H: TimerHandler + 'static,
    {
        guard(&self.timers).bind(id, handler)
    }

    /// Disarm user timer `id`
    pub fn unset_timer(&self, id: u8) -> Result<bool, ControlError> {
        let cancelled = guard(&self.timers).unset(id)?;
        if self.is_done() {
            self.persist()?;
        }
        Ok(cancelled)
    }

    /// Hold off deep sleep while application work runs
    pub fn job_start(&self) {
        if let Err(e) = self.gate().clear_ready(CONTROL_MODULE) {
            debug!("job_start: {}", e);
        }
    }

    /// Application work finished
    pub fn job_done(&self) {
        if let Err(e) = self.gate().set_ready(CONTROL_MODULE) {
            debug!("job_done: {}", e);
        }
    }

    /// Copy of the retained user parameters
    pub fn user_params(&self) -> Vec<u8> {
        guard(&self.user_params).clone()
    }

    /// Replace the user parameters and write them to retention
    pub fn save_user_params(&self, params: &[u8]) -> Result<(), ControlError> {
        let expected = self.options.user_params_size;
        if params.len() != expected {
            return Err(ControlError::ParamsSize {
                expected,
                actual: params.len(),
            });
        }
        *guard(&self.user_params) = params.to_vec();
        if self.dpm_enabled() {
            self.store.store(DPM_USER_PARAMS_NAME, params)?;
        }
        Ok(())
    }
}
