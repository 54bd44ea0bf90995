//! Session manager: the arena of logical sessions and the public session API.
//!
//! Every API call and every session task reaches session state through the manager's
//! slots; there is no global configuration. Calls that wait on a task (`start_session`,
//! `stop_session`, `send_to_session`) are bounded by [`ManagerOptions`].

use dpm_power::{EventGroup, RtcTimerService, SleepGate};
use dpm_secure::SessionCodec;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::callbacks::{ConnectHandler, ErrorHandler, ReceiveHandler, SecureSetup};
use crate::config::{slot_index, sub_task_name, task_name, SessionConfig, SessionKind, MAX_SESSION_CNT};
use crate::lifecycle::{Request, RunStatus};
use crate::link::Link;
use crate::state::{lock, read, write, Activity, Busy, Direction, ManagerOptions, SessionDeps, SessionSlot, Shared};
use crate::subsession::{SubSessionInfo, SubSessionPool};
use crate::task::{self, touch_sub, TaskEnv};
use crate::DpmError;

struct ManagerInner {
    shared: Arc<Shared>,
    slots: Vec<Arc<SessionSlot>>,
}

/// Owner of all logical sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Manager with `MAX_SESSION_CNT` unconfigured sessions
    pub fn new(deps: SessionDeps, options: ManagerOptions) -> Self {
        let slots = (1..=MAX_SESSION_CNT as u8)
            .map(|id| Arc::new(SessionSlot::new(id)))
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                shared: Arc::new(Shared::new(deps, options)),
                slots,
            }),
        }
    }

    fn slot(&self, id: u8) -> Result<&Arc<SessionSlot>, DpmError> {
        Ok(&self.inner.slots[slot_index(id)?])
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Replace the configuration of the listed sessions
    pub fn configure(&self, configs: &[SessionConfig]) -> Result<(), DpmError> {
        for config in configs {
            let slot = self.slot(config.id)?;
            *write(&slot.config) = config.clone();
            debug!("Session {} configured as {:?}", config.id, config.kind);
        }
        Ok(())
    }

    /// Configuration of every session
    pub fn configs(&self) -> Vec<SessionConfig> {
        self.inner.slots.iter().map(|slot| slot.config()).collect()
    }

    /// Configuration of session `id`
    pub fn config(&self, id: u8) -> Result<SessionConfig, DpmError> {
        Ok(self.slot(id)?.config())
    }

    /// Mark this run as a wake from deep power-down; secure sessions then resume
    /// from their snapshots
    pub fn set_wake(&self, wake: bool) {
        self.shared().wake.store(wake, Ordering::SeqCst);
    }

    /// Whether this run is a wake
    pub fn is_wake(&self) -> bool {
        self.shared().wake.load(Ordering::SeqCst)
    }

    /// Sleep gate shared with the tasks
    pub fn gate(&self) -> &Arc<SleepGate> {
        &self.shared().gate
    }

    /// RTC timer service shared with the tasks
    pub fn timers(&self) -> &Arc<RtcTimerService> {
        &self.shared().timers
    }

    /// Event group the keep-alive timers post into
    pub fn events(&self) -> &Arc<EventGroup> {
        &self.shared().events
    }

    /// Secure snapshot codec
    pub fn codec(&self) -> &SessionCodec {
        &self.shared().codec
    }

    /// Log `err` and pass it to the error callback
    pub fn report_error(&self, session: u8, err: &DpmError) {
        self.shared().report(session, err);
    }

    fn update<A, F>(&self, id: u8, op: &'static str, applies: A, apply: F) -> Result<(), DpmError>
    where
        A: Fn(SessionKind) -> bool,
        F: FnOnce(&mut SessionConfig),
    {
        let slot = self.slot(id)?;
        let mut config = write(&slot.config);
        let kind = config.kind.ok_or(DpmError::InvalidSessionType(id))?;
        if !applies(kind) {
            return Err(DpmError::SessionTypeMismatch { op, kind });
        }
        apply(&mut config);
        debug!("Session {} {}", id, op);
        Ok(())
    }

    /// Set the session kind
    pub fn set_session_kind(&self, id: u8, kind: SessionKind) -> Result<(), DpmError> {
        write(&self.slot(id)?.config).kind = Some(kind);
        Ok(())
    }

    /// Local port of any session
    pub fn set_local_port(&self, id: u8, port: u16) -> Result<(), DpmError> {
        self.update(id, "set_local_port", |_| true, |c| c.local_port = port)
    }

    /// Listening port of a server
    pub fn set_server_port(&self, id: u8, port: u16) -> Result<(), DpmError> {
        if port == 0 {
            return Err(DpmError::Parameter("server port 0"));
        }
        self.update(id, "set_server_port", SessionKind::is_server, |c| {
            c.local_port = port
        })
    }

    /// Peer address of a client
    pub fn set_peer_addr(&self, id: u8, addr: IpAddr) -> Result<(), DpmError> {
        self.update(id, "set_peer_addr", is_client, |c| c.peer_addr = Some(addr))
    }

    /// Peer port of a client
    pub fn set_peer_port(&self, id: u8, port: u16) -> Result<(), DpmError> {
        self.update(id, "set_peer_port", is_client, |c| c.peer_port = port)
    }

    /// Keep-alive interval of a TCP session; 0 disables it
    pub fn set_keepalive(&self, id: u8, interval_ms: u64) -> Result<(), DpmError> {
        self.update(id, "set_keepalive", SessionKind::is_tcp, |c| {
            c.keepalive_ms = interval_ms
        })
    }

    /// Receive window size
    pub fn set_window_size(&self, id: u8, size: usize) -> Result<(), DpmError> {
        if size == 0 {
            return Err(DpmError::Parameter("zero window size"));
        }
        self.update(id, "set_window_size", |_| true, |c| c.window_size = size)
    }

    /// Connect attempts of a TCP client
    pub fn set_conn_retry_count(&self, id: u8, count: u32) -> Result<(), DpmError> {
        self.update(
            id,
            "set_conn_retry_count",
            |kind| kind == SessionKind::TcpClient,
            |c| c.conn_retry_count = count,
        )
    }

    /// Wait between connect attempts of a client
    pub fn set_conn_wait_time(&self, id: u8, wait_ms: u64) -> Result<(), DpmError> {
        self.update(id, "set_conn_wait_time", is_client, |c| c.conn_wait_ms = wait_ms)
    }

    /// Reconnect a client after the peer closes
    pub fn set_auto_reconnect(&self, id: u8, enabled: bool) -> Result<(), DpmError> {
        self.update(id, "set_auto_reconnect", is_client, |c| {
            c.auto_reconnect = enabled
        })
    }

    /// Protect the session with TLS/DTLS
    pub fn set_secure(&self, id: u8, secure: bool) -> Result<(), DpmError> {
        self.update(id, "set_secure", |_| true, |c| c.secure = secure)
    }

    /// Connect callback of session `id`
    pub fn set_connect_handler<H>(&self, id: u8, handler: H) -> Result<(), DpmError>
    where
        H: ConnectHandler + 'static,
    {
        write(&self.slot(id)?.callbacks).connect = Some(Arc::new(handler));
        Ok(())
    }

    /// Receive callback of session `id`
    pub fn set_receive_handler<H>(&self, id: u8, handler: H) -> Result<(), DpmError>
    where
        H: ReceiveHandler + 'static,
    {
        write(&self.slot(id)?.callbacks).receive = Some(Arc::new(handler));
        Ok(())
    }

    /// Handshake engine provider of session `id`
    pub fn set_secure_setup<H>(&self, id: u8, setup: H) -> Result<(), DpmError>
    where
        H: SecureSetup + 'static,
    {
        write(&self.slot(id)?.callbacks).secure = Some(Arc::new(setup));
        Ok(())
    }

    /// Error callback shared by all sessions
    pub fn set_error_handler<H>(&self, handler: H)
    where
        H: ErrorHandler + 'static,
    {
        *write(&self.shared().error_handler) = Some(Arc::new(handler));
    }

    /// Run status of session `id`
    pub fn status(&self, id: u8) -> Result<RunStatus, DpmError> {
        Ok(self.slot(id)?.lifecycle.status())
    }

    /// Start session `id` and wait for it to run.
    ///
    /// A session that is already running is left alone. Times out with `NotEnabled`;
    /// the task keeps trying in the background.
    pub async fn start_session(&self, id: u8) -> Result<(), DpmError> {
        let slot = self.slot(id)?.clone();
        let kind = slot.config().validate()?;
        slot.force_stopped.store(false, Ordering::SeqCst);

        let status = slot.lifecycle.status();
        if slot.task_alive() && !matches!(status, RunStatus::Stop | RunStatus::ReadyToCreate) {
            debug!("Session {} already {}", id, status);
            return Ok(());
        }

        slot.lifecycle.reset();
        *lock(&slot.subs) = SubSessionPool::new(kind.max_sub());
        let env = TaskEnv {
            shared: self.inner.shared.clone(),
            slot: slot.clone(),
        };
        let handle = task::spawn(env, kind);
        *lock(&slot.task) = Some(handle);
        info!("Session {} ({:?}) starting", id, kind);

        let wait = self.shared().options.start_wait;
        let reached = slot
            .lifecycle
            .wait_for(wait, |status| status.is_running() || status == RunStatus::Stop)
            .await;
        match reached {
            Some(RunStatus::Stop) => {
                warn!("Session {} stopped while starting", id);
                Err(DpmError::SessionStartFail(id))
            }
            Some(status) => {
                info!("Session {} is {}", id, status);
                Ok(())
            }
            None => {
                warn!("Session {} not running after {:?}", id, wait);
                Err(DpmError::NotEnabled(id))
            }
        }
    }

    /// Ask session `id` to stop and wait for it
    pub async fn stop_session(&self, id: u8) -> Result<(), DpmError> {
        let slot = self.slot(id)?.clone();
        if slot.force_stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let wait = self.shared().options.stop_wait;
        match slot.lifecycle.status() {
            RunStatus::Stop => return Ok(()),
            RunStatus::ReadyToCreate => {
                let created = slot.task_alive()
                    && slot
                        .lifecycle
                        .wait_for(wait, |status| status != RunStatus::ReadyToCreate)
                        .await
                        .is_some();
                if !created {
                    return Err(DpmError::NotCreated(id));
                }
            }
            _ => {}
        }

        if slot.lifecycle.request_and_wait(Request::Stop, wait).await {
            slot.force_stopped.store(true, Ordering::SeqCst);
            info!("Session {} stopped", id);
            Ok(())
        } else {
            warn!("Session {} did not stop within {:?}", id, wait);
            Err(DpmError::WaitError(id))
        }
    }

    /// Tear the connection of session `id` down and set it up again
    pub async fn restart_session(&self, id: u8) -> Result<(), DpmError> {
        let slot = self.slot(id)?.clone();
        if !slot.task_alive() {
            return Err(DpmError::NotCreated(id));
        }
        let wait = self.shared().options.stop_wait;
        if slot.lifecycle.request_and_wait(Request::Restart, wait).await {
            Ok(())
        } else {
            Err(DpmError::WaitError(id))
        }
    }

    /// Start every configured session; failures go to the error callback
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for slot in &self.inner.slots {
            if slot.config().kind.is_none() {
                continue;
            }
            match self.start_session(slot.id).await {
                Ok(()) => started += 1,
                Err(e) => self.report_error(slot.id, &e),
            }
        }
        started
    }

    /// Stop every started session
    pub async fn stop_all(&self) {
        for slot in &self.inner.slots {
            if !slot.task_alive() {
                continue;
            }
            if let Err(e) = self.stop_session(slot.id).await {
                warn!("Session {} stop failed: {}", slot.id, e);
            }
        }
    }

    /// Send `data` on session `id`.
    ///
    /// Servers address the sub-session of `peer`; a plain UDP server sends straight to
    /// `peer`; clients ignore `peer`.
    pub async fn send_to_session(&self, id: u8, peer: SocketAddr, data: &[u8]) -> Result<usize, DpmError> {
        let slot = self.slot(id)?.clone();
        if slot.force_stopped.load(Ordering::SeqCst) {
            return Err(DpmError::ForceStopped(id));
        }
        if data.is_empty() {
            return Err(DpmError::Parameter("empty send buffer"));
        }
        let config = slot.config();
        let kind = config.kind.ok_or(DpmError::InvalidSessionType(id))?;

        match kind {
            SessionKind::TcpServer => self.send_to_sub(&slot, kind, peer, data).await,
            SessionKind::UdpServer if config.secure => self.send_to_sub(&slot, kind, peer, data).await,
            _ => {
                self.wait_running(&slot, kind).await?;
                let module = task_name(kind, id);
                if kind == SessionKind::UdpServer {
                    let socket = read(&slot.udp_socket).clone();
                    let socket = socket.ok_or(DpmError::NotEnabled(id))?;
                    let _busy = Busy::enter(self.shared(), &slot.activity, Direction::Send, &module);
                    return socket.send_to(data, peer).await.map_err(DpmError::SendFail);
                }
                let link = slot.link().ok_or(DpmError::SocketNotConnect(id))?;
                self.send_on(id, &link, &slot.activity, &module, data).await
            }
        }
    }

    async fn wait_running(&self, slot: &SessionSlot, kind: SessionKind) -> Result<(), DpmError> {
        let wait = self.shared().options.send_wait;
        if slot.lifecycle.wait_for(wait, RunStatus::is_running).await.is_some() {
            return Ok(());
        }
        let id = slot.id;
        Err(match slot.lifecycle.status() {
            RunStatus::Stop => DpmError::SessionStartFail(id),
            _ if !kind.is_server() => DpmError::SocketNotConnect(id),
            RunStatus::ReadyToCreate => DpmError::NotCreated(id),
            _ => DpmError::NotEnabled(id),
        })
    }

    async fn send_to_sub(
        &self,
        slot: &Arc<SessionSlot>,
        kind: SessionKind,
        peer: SocketAddr,
        data: &[u8],
    ) -> Result<usize, DpmError> {
        let id = slot.id;
        let found = {
            let pool = lock(&slot.subs);
            pool.find(peer).and_then(|index| {
                pool.get(index)
                    .map(|sub| (index, sub.lifecycle.clone(), sub.activity.clone()))
            })
        };
        let (index, lifecycle, activity) = match found {
            Some(found) => found,
            None => {
                let err = DpmError::NotFoundSubSession { peer };
                self.report_error(id, &err);
                return Err(err);
            }
        };

        let wait = self.shared().options.send_wait;
        if lifecycle
            .wait_for(wait, |status| status == RunStatus::Run)
            .await
            .is_none()
        {
            return Err(DpmError::NotEnabled(id));
        }
        let link = sub_link(slot, index, peer).ok_or(DpmError::NotFoundSubSession { peer })?;
        let module = sub_task_name(kind, id, index);
        let sent = self.send_on(id, &link, &activity, &module, data).await?;
        touch_sub(slot, index, peer);
        Ok(sent)
    }

    async fn send_on(
        &self,
        id: u8,
        link: &Link,
        activity: &Activity,
        module: &str,
        data: &[u8],
    ) -> Result<usize, DpmError> {
        let _busy = Busy::enter(self.shared(), activity, Direction::Send, module);
        let sent = link.send(data).await?;
        if let Err(e) = link.save_snapshot(self.codec()) {
            self.report_error(id, &DpmError::SaveSslFail(e));
        }
        Ok(sent)
    }

    /// Keep-alive probe of TCP client session `id`
    pub async fn client_keepalive(&self, id: u8) -> Result<(), DpmError> {
        let slot = self.slot(id)?.clone();
        let kind = slot.config().kind.ok_or(DpmError::InvalidSessionType(id))?;
        if kind != SessionKind::TcpClient {
            return Err(DpmError::SessionTypeMismatch {
                op: "client_keepalive",
                kind,
            });
        }
        let link = slot.link().ok_or(DpmError::SocketNotConnect(id))?;
        let module = task_name(kind, id);
        let _busy = Busy::enter(self.shared(), &slot.activity, Direction::Send, &module);
        link.keepalive().await?;
        if let Err(e) = link.save_snapshot(self.codec()) {
            self.report_error(id, &DpmError::SaveSslFail(e));
        }
        Ok(())
    }

    /// Keep-alive probe of sub-session `n` (1-based) of every TCP server with keep-alive
    /// enabled; returns the number of probes sent
    pub async fn server_keepalive(&self, n: u8) -> usize {
        let index = match (n as usize).checked_sub(1) {
            Some(index) => index,
            None => return 0,
        };
        let mut sent = 0;
        for slot in &self.inner.slots {
            let config = slot.config();
            if config.kind != Some(SessionKind::TcpServer) || config.keepalive_ms == 0 {
                continue;
            }
            let target = {
                let pool = lock(&slot.subs);
                pool.get(index)
                    .and_then(|sub| sub.link.clone().map(|link| (link, sub.activity.clone())))
            };
            let (link, activity) = match target {
                Some(target) => target,
                None => continue,
            };
            let module = sub_task_name(SessionKind::TcpServer, slot.id, index);
            let result = {
                let _busy = Busy::enter(self.shared(), &activity, Direction::Send, &module);
                link.keepalive().await
            };
            match result {
                Ok(()) => {
                    sent += 1;
                    if let Err(e) = link.save_snapshot(self.codec()) {
                        self.report_error(slot.id, &DpmError::SaveSslFail(e));
                    }
                }
                Err(e) => self.report_error(slot.id, &e),
            }
        }
        sent
    }

    /// Sub-sessions of server session `id`
    pub fn sub_sessions(&self, id: u8) -> Result<Vec<SubSessionInfo>, DpmError> {
        Ok(lock(&self.slot(id)?.subs).report())
    }

    /// Status document of the whole session layer
    pub fn session_report(&self) -> Value {
        let sessions: Vec<Value> = self
            .inner
            .slots
            .iter()
            .map(|slot| {
                let config = slot.config();
                let link = slot.link();
                json!({
                    "id": slot.id,
                    "kind": config.kind,
                    "status": slot.lifecycle.status(),
                    "pending_request": slot.lifecycle.pending(),
                    "force_stopped": slot.force_stopped.load(Ordering::SeqCst),
                    "local_port": config.local_port,
                    "peer": config.peer().map(|peer| peer.to_string()),
                    "secure": config.secure,
                    "keepalive_ms": config.keepalive_ms,
                    "connected_to": link.as_ref().map(|link| link.peer().to_string()),
                    "secure_info": link.as_ref().and_then(|link| link.secure_info().cloned()),
                    "sub_sessions": lock(&slot.subs).report(),
                })
            })
            .collect();

        let shared = self.shared();
        json!({
            "dpm_enabled": shared.gate.is_enabled(),
            "sleep_permitted": shared.gate.sleep_permitted(),
            "wake": self.is_wake(),
            "sessions": sessions,
            "gate": shared.gate.entries(),
            "timers": shared.timers.entries(),
        })
    }
}

fn is_client(kind: SessionKind) -> bool {
    !kind.is_server()
}

fn sub_link(slot: &SessionSlot, index: usize, peer: SocketAddr) -> Option<Arc<Link>> {
    lock(&slot.subs)
        .get(index)
        .filter(|sub| sub.peer == peer)
        .and_then(|sub| sub.link.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::{HandshakeEngine, PskEngine};
    use dpm_power::NullWatchdog;
    use dpm_retention::MemoryRetention;
    use dpm_secure::{Endpoint, PskHandshake};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    fn manager(dpm: bool) -> SessionManager {
        SessionManager::new(
            SessionDeps {
                gate: Arc::new(SleepGate::new(dpm)),
                timers: Arc::new(RtcTimerService::new()),
                events: Arc::new(EventGroup::new()),
                codec: SessionCodec::new(Arc::new(MemoryRetention::new(16 * 1024)), dpm),
                watchdog: Arc::new(NullWatchdog),
            },
            ManagerOptions {
                start_wait: Duration::from_secs(5),
                stop_wait: Duration::from_secs(3),
                send_wait: Duration::from_millis(500),
            },
        )
    }

    fn free_tcp_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn server(id: u8, kind: SessionKind, port: u16, secure: bool) -> SessionConfig {
        SessionConfig {
            kind: Some(kind),
            local_port: port,
            secure,
            ..SessionConfig::new(id)
        }
    }

    fn client(id: u8, kind: SessionKind, port: u16, secure: bool) -> SessionConfig {
        SessionConfig {
            kind: Some(kind),
            peer_addr: Some(localhost()),
            peer_port: port,
            secure,
            conn_wait_ms: 200,
            ..SessionConfig::new(id)
        }
    }

    fn psk_setup(_id: u8, _endpoint: Endpoint) -> Result<Arc<dyn HandshakeEngine>, String> {
        let psk = PskHandshake::new("sensor-1", b"0123456789abcdef", 0x00A8).map_err(|e| e.to_string())?;
        Ok(Arc::new(PskEngine::new(psk)))
    }

    type Inbox = mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>;

    fn capture(manager: &SessionManager, id: u8) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        manager
            .set_receive_handler(id, move |_id: u8, peer: SocketAddr, data: &[u8]| {
                let _ = tx.send((peer, data.to_vec()));
            })
            .unwrap();
        rx
    }

    async fn next(inbox: &mut Inbox) -> (SocketAddr, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..250 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_connected() {
        let manager = manager(false);
        let mut config = SessionConfig::new(1);
        config.kind = Some(SessionKind::TcpClient);
        config.peer_addr = Some("10.0.0.5".parse().unwrap());
        config.peer_port = 8080;
        manager.configure(&[config]).unwrap();

        let peer: SocketAddr = "10.0.0.5:8080".parse().unwrap();
        let err = manager.send_to_session(1, peer, b"hello").await.unwrap_err();
        assert!(matches!(err, DpmError::SocketNotConnect(1)));
    }

    #[tokio::test]
    async fn test_out_of_range_and_never_created() {
        let manager = manager(false);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(manager.start_session(0).await, Err(DpmError::OutOfRange(0))));
        assert!(matches!(manager.stop_session(5).await, Err(DpmError::OutOfRange(5))));
        assert!(matches!(
            manager.send_to_session(9, peer, b"x").await,
            Err(DpmError::OutOfRange(9))
        ));
        assert!(matches!(
            manager.start_session(2).await,
            Err(DpmError::InvalidSessionType(2))
        ));

        manager
            .configure(&[server(2, SessionKind::TcpServer, 9000, false)])
            .unwrap();
        assert!(matches!(manager.stop_session(2).await, Err(DpmError::NotCreated(2))));
    }

    #[test]
    fn test_setters_check_kind() {
        let manager = manager(false);
        assert!(matches!(
            manager.set_server_port(1, 80),
            Err(DpmError::InvalidSessionType(1))
        ));
        manager.set_session_kind(1, SessionKind::TcpClient).unwrap();
        let err = manager.set_server_port(1, 80).unwrap_err();
        assert_eq!(err.code(), 0x2C);
        assert!(matches!(
            manager.set_window_size(1, 0),
            Err(DpmError::Parameter(_))
        ));

        manager.set_peer_addr(1, localhost()).unwrap();
        manager.set_peer_port(1, 7000).unwrap();
        manager.set_keepalive(1, 30_000).unwrap();
        manager.set_conn_retry_count(1, 5).unwrap();
        manager.set_auto_reconnect(1, true).unwrap();
        let config = manager.config(1).unwrap();
        assert_eq!(config.peer().unwrap().port(), 7000);
        assert_eq!(config.conn_retry_count, 5);
        assert!(config.auto_reconnect);

        manager.set_session_kind(2, SessionKind::UdpServer).unwrap();
        manager.set_server_port(2, 6000).unwrap();
        assert!(manager.set_keepalive(2, 1000).is_err());
        assert!(manager.set_peer_port(2, 1).is_err());
        assert!(manager.set_conn_retry_count(2, 1).is_err());
    }

    #[tokio::test]
    async fn test_plain_tcp_exchange() {
        let manager = manager(false);
        let port = free_tcp_port();
        manager
            .configure(&[
                server(1, SessionKind::TcpServer, port, false),
                client(2, SessionKind::TcpClient, port, false),
            ])
            .unwrap();
        let mut server_inbox = capture(&manager, 1);
        let mut client_inbox = capture(&manager, 2);
        let connected = Arc::new(Mutex::new(Vec::new()));
        let sink = connected.clone();
        manager
            .set_connect_handler(1, move |_id: u8, peer: SocketAddr, sub: Option<usize>| {
                sink.lock().unwrap().push((peer, sub));
            })
            .unwrap();

        manager.start_session(1).await.unwrap();
        assert_eq!(manager.status(1).unwrap(), RunStatus::WaitAccept);
        manager.start_session(2).await.unwrap();
        assert_eq!(manager.status(2).unwrap(), RunStatus::Run);

        let any: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert_eq!(manager.send_to_session(2, any, b"ping").await.unwrap(), 4);
        let (peer, data) = next(&mut server_inbox).await;
        assert_eq!(data, b"ping");
        assert_eq!(connected.lock().unwrap()[0], (peer, Some(0)));

        manager.send_to_session(1, peer, b"pong").await.unwrap();
        assert_eq!(next(&mut client_inbox).await.1, b"pong");

        let subs = manager.sub_sessions(1).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].peer, peer);

        manager.stop_session(2).await.unwrap();
        manager.stop_session(1).await.unwrap();
        assert_eq!(manager.status(1).unwrap(), RunStatus::Stop);
        assert!(manager.sub_sessions(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_send_to_unknown_peer() {
        let manager = manager(false);
        let port = free_tcp_port();
        manager
            .configure(&[server(1, SessionKind::TcpServer, port, false)])
            .unwrap();
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = codes.clone();
        manager.set_error_handler(move |code: u32, _message: &str| {
            sink.lock().unwrap().push(code);
        });
        manager.start_session(1).await.unwrap();

        let stranger: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = manager.send_to_session(1, stranger, b"x").await.unwrap_err();
        assert!(matches!(err, DpmError::NotFoundSubSession { .. }));
        assert_eq!(*codes.lock().unwrap(), vec![0x14]);
        manager.stop_session(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_pool_evicts_least_recent_peer() {
        let manager = manager(false);
        let port = free_tcp_port();
        manager
            .configure(&[server(1, SessionKind::TcpServer, port, false)])
            .unwrap();
        let mut inbox = capture(&manager, 1);
        manager.start_session(1).await.unwrap();
        let addr: SocketAddr = SocketAddr::new(localhost(), port);

        let mut a = TcpStream::connect(addr).await.unwrap();
        assert!(eventually(|| manager.sub_sessions(1).unwrap().len() == 1).await);
        sleep(Duration::from_millis(30)).await;
        let mut b = TcpStream::connect(addr).await.unwrap();
        assert!(eventually(|| manager.sub_sessions(1).unwrap().len() == 2).await);
        sleep(Duration::from_millis(30)).await;

        // A talks last, so B is now the least recently used
        a.write_all(b"still here").await.unwrap();
        assert_eq!(next(&mut inbox).await.1, b"still here");

        let c = TcpStream::connect(addr).await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let c_addr = c.local_addr().unwrap();
        assert!(
            eventually(|| {
                let peers: Vec<_> = manager
                    .sub_sessions(1)
                    .unwrap()
                    .into_iter()
                    .map(|info| info.peer)
                    .collect();
                peers.contains(&a_addr) && peers.contains(&c_addr)
            })
            .await
        );

        // The evicted peer sees the connection close
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), b.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(manager
            .sub_sessions(1)
            .unwrap()
            .iter()
            .all(|info| info.peer != b_addr));
        manager.stop_session(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_secure_tcp_session_snapshots() {
        let manager = manager(true);
        let port = free_tcp_port();
        manager
            .configure(&[
                server(1, SessionKind::TcpServer, port, true),
                client(2, SessionKind::TcpClient, port, true),
            ])
            .unwrap();
        manager.set_secure_setup(1, psk_setup).unwrap();
        manager.set_secure_setup(2, psk_setup).unwrap();
        let mut server_inbox = capture(&manager, 1);
        let mut client_inbox = capture(&manager, 2);

        manager.start_session(1).await.unwrap();
        manager.start_session(2).await.unwrap();
        assert!(manager.codec().exists("tcp_cnt_tls2"));

        let any: SocketAddr = "0.0.0.0:0".parse().unwrap();
        manager.send_to_session(2, any, b"sealed").await.unwrap();
        let (peer, data) = next(&mut server_inbox).await;
        assert_eq!(data, b"sealed");
        assert!(manager.codec().exists("tcp_srv_tls1_1"));

        manager.send_to_session(1, peer, b"reply").await.unwrap();
        assert_eq!(next(&mut client_inbox).await.1, b"reply");
        manager.client_keepalive(2).await.unwrap();

        let report = manager.session_report();
        assert_eq!(report["sessions"][1]["status"], "run");
        assert_eq!(report["sessions"][1]["secure_info"]["snapshot"], "tcp_cnt_tls2");

        manager.stop_session(2).await.unwrap();
        assert!(!manager.codec().exists("tcp_cnt_tls2"));
        manager.stop_session(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_secure_session_without_setup_reports() {
        let manager = manager(false);
        let port = free_tcp_port();
        manager
            .configure(&[
                server(1, SessionKind::TcpServer, port, false),
                client(2, SessionKind::TcpClient, port, true),
            ])
            .unwrap();
        let codes = Arc::new(Mutex::new(Vec::new()));
        let sink = codes.clone();
        manager.set_error_handler(move |code: u32, _message: &str| {
            sink.lock().unwrap().push(code);
        });
        manager.start_session(1).await.unwrap();
        assert!(matches!(
            manager.start_session(2).await,
            Err(DpmError::SessionStartFail(2))
        ));
        assert!(codes.lock().unwrap().contains(&0x16));
        assert_eq!(manager.status(2).unwrap(), RunStatus::Stop);
        manager.stop_session(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_then_start_again() {
        let manager = manager(false);
        let port = free_tcp_port();
        manager
            .configure(&[server(3, SessionKind::TcpServer, port, false)])
            .unwrap();
        manager.start_session(3).await.unwrap();
        manager.stop_session(3).await.unwrap();
        assert_eq!(manager.status(3).unwrap(), RunStatus::Stop);
        // Stopping twice is fine
        manager.stop_session(3).await.unwrap();

        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            manager.send_to_session(3, peer, b"x").await,
            Err(DpmError::ForceStopped(3))
        ));

        manager.start_session(3).await.unwrap();
        assert_eq!(manager.status(3).unwrap(), RunStatus::WaitAccept);
        manager.restart_session(3).await.unwrap();
        assert!(eventually(|| manager.status(3).unwrap() == RunStatus::WaitAccept).await);
        manager.stop_session(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_udp_exchange() {
        let manager = manager(false);
        let port = free_udp_port();
        manager
            .configure(&[
                server(1, SessionKind::UdpServer, port, false),
                client(2, SessionKind::UdpClient, port, false),
            ])
            .unwrap();
        let mut server_inbox = capture(&manager, 1);
        let mut client_inbox = capture(&manager, 2);
        manager.start_session(1).await.unwrap();
        manager.start_session(2).await.unwrap();

        let any: SocketAddr = "0.0.0.0:0".parse().unwrap();
        manager.send_to_session(2, any, b"datagram").await.unwrap();
        let (peer, data) = next(&mut server_inbox).await;
        assert_eq!(data, b"datagram");

        manager.send_to_session(1, peer, b"answer").await.unwrap();
        assert_eq!(next(&mut client_inbox).await.1, b"answer");

        manager.stop_all().await;
        assert_eq!(manager.status(1).unwrap(), RunStatus::Stop);
        assert_eq!(manager.status(2).unwrap(), RunStatus::Stop);
    }

    #[tokio::test]
    async fn test_secure_udp_sub_sessions() {
        let manager = manager(true);
        let port = free_udp_port();
        manager
            .configure(&[
                server(1, SessionKind::UdpServer, port, true),
                client(2, SessionKind::UdpClient, port, true),
            ])
            .unwrap();
        manager.set_secure_setup(1, psk_setup).unwrap();
        manager.set_secure_setup(2, psk_setup).unwrap();
        manager.set_window_size(1, 64).unwrap();
        let mut server_inbox = capture(&manager, 1);
        let mut client_inbox = capture(&manager, 2);

        manager.start_session(1).await.unwrap();
        manager.start_session(2).await.unwrap();

        let any: SocketAddr = "0.0.0.0:0".parse().unwrap();
        manager.send_to_session(2, any, b"over dtls").await.unwrap();
        let (peer, data) = next(&mut server_inbox).await;
        assert_eq!(data, b"over dtls");
        assert!(manager.codec().exists("udp_svr_tls1_1"));
        assert_eq!(manager.sub_sessions(1).unwrap()[0].status, RunStatus::Run);

        manager.send_to_session(1, peer, b"back").await.unwrap();
        assert_eq!(next(&mut client_inbox).await.1, b"back");

        // A datagram larger than the window still reaches the sub-session whole
        let large = vec![0x5A; 600];
        manager.send_to_session(2, any, &large).await.unwrap();
        assert_eq!(next(&mut server_inbox).await, (peer, large));
        assert_eq!(manager.sub_sessions(1).unwrap().len(), 1);

        manager.stop_all().await;
        assert!(!manager.codec().exists("udp_svr_tls1_1"));
    }

    #[tokio::test]
    async fn test_report_shape() {
        let manager = manager(false);
        manager
            .configure(&[server(4, SessionKind::UdpServer, 7000, false)])
            .unwrap();
        let report = manager.session_report();
        assert_eq!(report["sessions"].as_array().unwrap().len(), MAX_SESSION_CNT);
        assert_eq!(report["sessions"][3]["kind"], "udp_server");
        assert_eq!(report["sessions"][3]["status"], "ready_to_create");
        assert_eq!(report["dpm_enabled"], false);
    }
}
