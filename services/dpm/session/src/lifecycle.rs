//! Session lifecycle state machine and the cooperative request channel.
//!
//! A session task owns the transitions of its [`Lifecycle`]; API callers only post a
//! [`Request`] and wait, bounded, for the task to acknowledge it by reaching the
//! matching status.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Run status of a session or sub-session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Configured, no task yet
    ReadyToCreate,
    /// Task running, socket being set up
    Init,
    /// Server socket listening
    WaitAccept,
    /// Client socket connected
    Connected,
    /// Application data flows
    Run,
    /// Releasing resources
    GoingStop,
    /// Task finished
    Stop,
}

impl RunStatus {
    /// Whether `next` is a legal successor
    pub fn can_transition(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (ReadyToCreate, Init)
                | (Stop, Init)
                | (Init, WaitAccept)
                | (Init, Connected)
                | (Init, Run)
                | (Init, GoingStop)
                | (WaitAccept, Init)
                | (WaitAccept, GoingStop)
                | (Connected, Run)
                | (Connected, GoingStop)
                | (Run, GoingStop)
                | (GoingStop, Stop)
                | (GoingStop, Init)
        )
    }

    /// Whether a started session counts as running
    pub fn is_running(self) -> bool {
        matches!(self, RunStatus::WaitAccept | RunStatus::Run)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::ReadyToCreate => "ready_to_create",
            RunStatus::Init => "init",
            RunStatus::WaitAccept => "wait_accept",
            RunStatus::Connected => "connected",
            RunStatus::Run => "run",
            RunStatus::GoingStop => "going_stop",
            RunStatus::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Command posted to a session task
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Nothing pending
    None = 0,
    /// Stop the task
    Stop = 1,
    /// Tear down and set up again
    Restart = 2,
}

/// Status plus pending request of one session or sub-session
#[derive(Debug)]
pub struct Lifecycle {
    status: watch::Sender<RunStatus>,
    request: watch::Sender<Request>,
    attempts: AtomicU64,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Lifecycle in `ReadyToCreate`
    pub fn new() -> Self {
        let (status, _) = watch::channel(RunStatus::ReadyToCreate);
        let (request, _) = watch::channel(Request::None);
        Self {
            status,
            request,
            attempts: AtomicU64::new(0),
        }
    }

    /// Current status
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// Number of times the task entered `Init`
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Move to `next`; illegal transitions are refused
    pub fn transition(&self, next: RunStatus) -> bool {
        let mut previous = None;
        let attempts = &self.attempts;
        let applied = self.status.send_if_modified(|current| {
            if !current.can_transition(next) {
                previous = Some(*current);
                return false;
            }
            if next == RunStatus::Init {
                attempts.fetch_add(1, Ordering::SeqCst);
            }
            *current = next;
            true
        });
        match previous {
            Some(from) => warn!("Refused status transition {} -> {}", from, next),
            None => debug!("Status -> {}", next),
        }
        applied
    }

    /// Back to `ReadyToCreate` with no pending request
    pub fn reset(&self) {
        self.request.send_replace(Request::None);
        self.status.send_replace(RunStatus::ReadyToCreate);
    }

    /// Post a request for the task
    pub fn request(&self, request: Request) {
        debug!("Request {:?} posted", request);
        self.request.send_replace(request);
    }

    /// Pending request, left in place
    pub fn pending(&self) -> Request {
        *self.request.borrow()
    }

    /// Pending request, cleared
    pub fn take_request(&self) -> Request {
        let mut taken = Request::None;
        self.request.send_if_modified(|pending| {
            taken = std::mem::replace(pending, Request::None);
            false
        });
        taken
    }

    /// Resolves once a request is pending; I/O loops race it against their reads
    pub async fn requested(&self) {
        let mut rx = self.request.subscribe();
        let _ = rx.wait_for(|request| *request != Request::None).await;
    }

    /// Wait up to `timeout` for a status matching `pred`
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> Option<RunStatus>
    where
        F: Fn(RunStatus) -> bool,
    {
        let mut rx = self.status.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|status| pred(*status))).await;
        match result {
            Ok(Ok(status)) => Some(*status),
            _ => None,
        }
    }

    /// Post `request` and wait up to `timeout` for the task to act on it.
    ///
    /// `Stop` is acknowledged by reaching `Stop`, `Restart` by the next entry into `Init`.
    /// On timeout the request is withdrawn and `false` returned.
    pub async fn request_and_wait(&self, request: Request, timeout: Duration) -> bool {
        let before = self.attempts();
        self.request(request);
        let acknowledged = match request {
            Request::None => true,
            Request::Stop => self
                .wait_for(timeout, |status| status == RunStatus::Stop)
                .await
                .is_some(),
            Request::Restart => self
                .wait_for(timeout, |_| self.attempts() > before)
                .await
                .is_some(),
        };
        if !acknowledged {
            self.request.send_if_modified(|pending| {
                if *pending == request {
                    *pending = Request::None;
                }
                false
            });
        }
        acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.status(), RunStatus::ReadyToCreate);
        assert!(!lifecycle.transition(RunStatus::Run));

        assert!(lifecycle.transition(RunStatus::Init));
        assert!(lifecycle.transition(RunStatus::Connected));
        assert!(lifecycle.transition(RunStatus::Run));
        assert!(!lifecycle.transition(RunStatus::Init));
        assert!(lifecycle.transition(RunStatus::GoingStop));
        assert!(lifecycle.transition(RunStatus::Init));
        assert_eq!(lifecycle.attempts(), 2);

        assert!(lifecycle.transition(RunStatus::GoingStop));
        assert!(lifecycle.transition(RunStatus::Stop));
        assert!(lifecycle.transition(RunStatus::Init));
    }

    #[test]
    fn test_requests() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.take_request(), Request::None);
        lifecycle.request(Request::Restart);
        assert_eq!(lifecycle.pending(), Request::Restart);
        assert_eq!(lifecycle.take_request(), Request::Restart);
        assert_eq!(lifecycle.pending(), Request::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_acknowledged() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.transition(RunStatus::Init);
        lifecycle.transition(RunStatus::Run);

        let task = lifecycle.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if task.take_request() == Request::Stop {
                    task.transition(RunStatus::GoingStop);
                    task.transition(RunStatus::Stop);
                    break;
                }
            }
        });

        assert!(
            lifecycle
                .request_and_wait(Request::Stop, Duration::from_secs(2))
                .await
        );
        assert_eq!(lifecycle.status(), RunStatus::Stop);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_acknowledged_by_next_init() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.transition(RunStatus::Init);
        lifecycle.transition(RunStatus::Run);

        let task = lifecycle.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if task.take_request() == Request::Restart {
                    task.transition(RunStatus::GoingStop);
                    task.transition(RunStatus::Init);
                    task.transition(RunStatus::Run);
                }
            }
        });

        assert!(
            lifecycle
                .request_and_wait(Request::Restart, Duration::from_secs(1))
                .await
        );
        assert_eq!(lifecycle.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requested_wakes_waiter() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = lifecycle.clone();
        let handle = tokio::spawn(async move {
            waiter.requested().await;
            waiter.take_request()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.request(Request::Stop);
        assert_eq!(handle.await.unwrap(), Request::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_request_withdrawn() {
        let lifecycle = Lifecycle::new();
        lifecycle.transition(RunStatus::Init);
        assert!(
            !lifecycle
                .request_and_wait(Request::Stop, Duration::from_millis(200))
                .await
        );
        assert_eq!(lifecycle.pending(), Request::None);
    }
}
