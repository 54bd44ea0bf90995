//! Session tasks.
//!
//! One tokio task runs per started session and one more per server sub-session. A task
//! owns the status transitions of its lifecycle and polls the request channel once per
//! loop iteration; everything it shares with the API goes through [`SessionSlot`].

mod tcp_client;
mod tcp_server;
mod udp_client;
mod udp_server;

use bytes::BytesMut;
use dpm_power::{guarded, rtc_ticks};
use dpm_secure::{Endpoint, SecureConfig, SecureContext, SecureError, Transport};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{
    sub_task_name, SessionConfig, SessionKind, BIND_RETRY_COUNT, BIND_WAIT, EVICT_POLL_COUNT,
    EVICT_POLL_INTERVAL, HANDSHAKE_RETRY_COUNT, HANDSHAKE_TIMEOUT, RX_BUFFER_SIZE,
};
use crate::lifecycle::{Lifecycle, Request, RunStatus};
use crate::link::Link;
use crate::secure::RecordTransport;
use crate::state::{lock, Activity, Busy, Direction, SessionSlot, Shared};
use crate::subsession::SubSession;
use crate::DpmError;

/// What a session task needs: the shared services and its own slot
#[derive(Clone)]
pub(crate) struct TaskEnv {
    pub shared: Arc<Shared>,
    pub slot: Arc<SessionSlot>,
}

impl TaskEnv {
    pub fn id(&self) -> u8 {
        self.slot.id
    }

    pub fn report(&self, err: &DpmError) {
        self.shared.report(self.slot.id, err);
    }
}

/// Why a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Stop,
    Restart,
    Reconnect,
}

impl Exit {
    pub fn from_request(request: Request) -> Option<Self> {
        match request {
            Request::None => None,
            Request::Stop => Some(Exit::Stop),
            Request::Restart => Some(Exit::Restart),
        }
    }
}

/// Spawn the task for a session of `kind`
pub(crate) fn spawn(env: TaskEnv, kind: SessionKind) -> JoinHandle<()> {
    match kind {
        SessionKind::TcpClient => tokio::spawn(tcp_client::run(env)),
        SessionKind::TcpServer => tokio::spawn(tcp_server::run(env)),
        SessionKind::UdpClient => tokio::spawn(udp_client::run(env)),
        SessionKind::UdpServer => tokio::spawn(udp_server::run(env)),
    }
}

/// Sleep for `duration` unless a request arrives first; returns the request
pub(crate) async fn idle(lifecycle: &Lifecycle, duration: Duration) -> Option<Exit> {
    tokio::select! {
        _ = sleep(duration) => {}
        _ = lifecycle.requested() => {}
    }
    Exit::from_request(lifecycle.take_request())
}

/// Exit for a request that interrupted a blocking step
pub(crate) fn interrupted(lifecycle: &Lifecycle) -> Exit {
    Exit::from_request(lifecycle.take_request()).unwrap_or(Exit::Stop)
}

/// Exit after a lost connection
pub(crate) fn reconnect_or_stop(config: &SessionConfig) -> Exit {
    if config.auto_reconnect {
        Exit::Reconnect
    } else {
        Exit::Stop
    }
}

/// Outcome of a setup step that can be interrupted by a request
pub(crate) enum Step<T> {
    Ready(T),
    Interrupted(Exit),
    Failed(DpmError),
}

fn unspecified(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Bind a UDP socket to `port`, retrying while the port is busy
pub(crate) async fn bind_udp(lifecycle: &Lifecycle, port: u16, ipv6: bool) -> Step<UdpSocket> {
    let addr = SocketAddr::new(unspecified(ipv6), port);
    let mut last = io::Error::new(io::ErrorKind::AddrInUse, "bind failed");
    for attempt in 1..=BIND_RETRY_COUNT {
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Step::Ready(socket),
            Err(e) => {
                warn!("UDP bind to {} failed ({}/{}): {}", addr, attempt, BIND_RETRY_COUNT, e);
                last = e;
            }
        }
        if attempt < BIND_RETRY_COUNT {
            if let Some(exit) = idle(lifecycle, BIND_WAIT).await {
                return Step::Interrupted(exit);
            }
        }
    }
    Step::Failed(DpmError::SocketBind { port, source: last })
}

/// Bind and listen on TCP `port`, retrying while the port is busy
pub(crate) async fn bind_tcp(lifecycle: &Lifecycle, port: u16, backlog: u32) -> Step<TcpListener> {
    let addr = SocketAddr::new(unspecified(false), port);
    let mut last = io::Error::new(io::ErrorKind::AddrInUse, "bind failed");
    for attempt in 1..=BIND_RETRY_COUNT {
        let socket = match TcpSocket::new_v4() {
            Ok(socket) => socket,
            Err(e) => return Step::Failed(DpmError::SocketCreate(e)),
        };
        if let Err(e) = socket.set_reuseaddr(true) {
            return Step::Failed(DpmError::SocketCreate(e));
        }
        match socket.bind(addr) {
            Ok(()) => {
                return match socket.listen(backlog) {
                    Ok(listener) => Step::Ready(listener),
                    Err(e) => Step::Failed(DpmError::SocketListen(e)),
                }
            }
            Err(e) => {
                warn!("TCP bind to {} failed ({}/{}): {}", addr, attempt, BIND_RETRY_COUNT, e);
                last = e;
            }
        }
        if attempt < BIND_RETRY_COUNT {
            if let Some(exit) = idle(lifecycle, BIND_WAIT).await {
                return Step::Interrupted(exit);
            }
        }
    }
    Step::Failed(DpmError::SocketBind { port, source: last })
}

/// Parameters of one secure establishment
pub(crate) struct SecureTarget<'a> {
    pub endpoint: Endpoint,
    pub transport: Transport,
    pub snapshot: &'a str,
    pub module: &'a str,
    pub client_id: Option<&'a [u8]>,
}

impl SecureTarget<'_> {
    fn fresh(&self) -> Result<SecureContext, DpmError> {
        let mut ctx = SecureContext::new(SecureConfig {
            endpoint: self.endpoint,
            transport: self.transport,
        });
        if let Some(id) = self.client_id {
            ctx.set_client_id(id)
                .map_err(|e| DpmError::SecureInitFail(e.to_string()))?;
        }
        Ok(ctx)
    }
}

/// Bring up the secure context of a connection.
///
/// After a wake the retained snapshot is tried first; a failed restore is reported, the
/// snapshot cleared and a fresh handshake run instead. Handshakes are retried
/// `HANDSHAKE_RETRY_COUNT` times. `Ok(None)` means a request arrived mid-handshake.
pub(crate) async fn establish_secure(
    env: &TaskEnv,
    lifecycle: &Lifecycle,
    target: &SecureTarget<'_>,
    io: &mut dyn RecordTransport,
) -> Result<Option<SecureContext>, DpmError> {
    let shared = &env.shared;
    let wake = shared.wake.load(std::sync::atomic::Ordering::SeqCst);

    if wake && shared.codec.is_enabled() && shared.codec.exists(target.snapshot) {
        let mut ctx = target.fresh()?;
        match shared.codec.restore(target.snapshot, &mut ctx) {
            Ok(()) => {
                info!("{} resumed secure session from {}", target.module, target.snapshot);
                return Ok(Some(ctx));
            }
            Err(e) => {
                env.report(&DpmError::RestoreSslFail(e));
                shared.clear_snapshot(target.snapshot);
            }
        }
    }

    let setup = env
        .slot
        .callbacks()
        .secure
        .ok_or_else(|| DpmError::SecureInitFail("no secure setup callback".to_string()))?;
    let engine = setup
        .engine(env.id(), target.endpoint)
        .map_err(DpmError::SecureInitFail)?;

    let mut last = SecureError::NotSuccessful;
    for attempt in 0..=HANDSHAKE_RETRY_COUNT {
        if attempt > 0 {
            warn!("{} handshake retry {}/{}", target.module, attempt, HANDSHAKE_RETRY_COUNT);
        }
        let mut ctx = target.fresh()?;
        let handshake = guarded(
            shared.watchdog.as_ref(),
            tokio::time::timeout(HANDSHAKE_TIMEOUT, engine.handshake(&mut ctx, &mut *io)),
        );
        let result = tokio::select! {
            result = handshake => result,
            _ = lifecycle.requested() => return Ok(None),
        };
        match result {
            Ok(Ok(())) => {
                info!("{} handshake complete", target.module);
                if shared.codec.is_enabled() {
                    if let Err(e) = shared.codec.save(target.snapshot, &ctx) {
                        env.report(&DpmError::SaveSslFail(e));
                    }
                }
                return Ok(Some(ctx));
            }
            Ok(Err(e)) => {
                warn!("{} handshake failed: {}", target.module, e);
                last = e;
            }
            Err(_) => {
                warn!("{} handshake timed out", target.module);
                last = SecureError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timed out",
                ));
            }
        }
    }
    Err(DpmError::HandshakeFail(last))
}

/// How a receive loop ended
#[derive(Debug)]
pub(crate) enum LoopEnd {
    Request(Request),
    PeerClosed,
    Failed(DpmError),
}

/// Receive loop over the read half of a stream connection
pub(crate) struct StreamLoop<'a> {
    pub shared: &'a Shared,
    pub session: u8,
    pub lifecycle: &'a Lifecycle,
    pub activity: &'a Activity,
    pub link: &'a Link,
    pub module: &'a str,
    pub rx_timeout: Duration,
    pub window: usize,
}

impl StreamLoop<'_> {
    pub async fn run<R, F>(&self, reader: &mut R, mut deliver: F) -> LoopEnd
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(&[u8]) + Send,
    {
        let mut buf = BytesMut::with_capacity(self.window.max(RX_BUFFER_SIZE));
        loop {
            let request = self.lifecycle.take_request();
            if request != Request::None {
                return LoopEnd::Request(request);
            }

            let read = tokio::select! {
                read = tokio::time::timeout(self.rx_timeout, reader.read_buf(&mut buf)) => read,
                _ = self.lifecycle.requested() => continue,
            };
            let n = match read {
                Err(_) => continue,
                Ok(Ok(0)) => return LoopEnd::PeerClosed,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return LoopEnd::Failed(DpmError::ReceiveFail(e)),
            };

            let _busy = Busy::enter(self.shared, self.activity, Direction::Receive, self.module);
            debug!("{} received {} bytes", self.module, n);
            match self.link.open_stream(&mut buf) {
                Ok(chunks) => chunks.iter().for_each(|chunk| deliver(chunk)),
                Err(DpmError::PeerClosed(_)) => return LoopEnd::PeerClosed,
                Err(e) => return LoopEnd::Failed(e),
            }
            if let Err(e) = self.link.save_snapshot(&self.shared.codec) {
                self.shared.report(self.session, &DpmError::SaveSslFail(e));
            }
        }
    }
}

/// Ask the sub-session in `index` to stop and wait for it to release the slot
pub(crate) async fn evict_sub(env: &TaskEnv, index: usize) -> bool {
    let lifecycle = lock(&env.slot.subs)
        .get(index)
        .map(|sub| sub.lifecycle.clone());
    let lifecycle = match lifecycle {
        Some(lifecycle) => lifecycle,
        None => return true,
    };

    info!("Session {} evicting sub-session {}", env.id(), index + 1);
    lifecycle.request(Request::Stop);
    for _ in 0..EVICT_POLL_COUNT {
        if sub_released(&env.slot, index) {
            return true;
        }
        sleep(EVICT_POLL_INTERVAL).await;
    }
    let released = sub_released(&env.slot, index);
    if !released {
        warn!("Session {} sub-session {} did not stop", env.id(), index + 1);
    }
    released
}

fn sub_released(slot: &SessionSlot, index: usize) -> bool {
    lock(&slot.subs).get(index).is_none()
}

/// Stop every sub-session, forcing out the ones that do not stop in time
pub(crate) async fn stop_subs(env: &TaskEnv, kind: SessionKind) {
    let lifecycles: Vec<_> = lock(&env.slot.subs)
        .iter()
        .map(|(_, sub)| sub.lifecycle.clone())
        .collect();
    if lifecycles.is_empty() {
        return;
    }
    for lifecycle in &lifecycles {
        lifecycle.request(Request::Stop);
    }

    let deadline = Instant::now() + env.shared.options.stop_wait;
    while !pool_empty(&env.slot) && Instant::now() < deadline {
        sleep(EVICT_POLL_INTERVAL).await;
    }

    let leftovers: Vec<(usize, SubSession)> = {
        let mut pool = lock(&env.slot.subs);
        let owners: Vec<(usize, SocketAddr)> =
            pool.iter().map(|(index, sub)| (index, sub.peer)).collect();
        owners
            .into_iter()
            .filter_map(|(index, peer)| pool.release(index, peer).map(|sub| (index, sub)))
            .collect()
    };
    for (index, mut sub) in leftovers {
        warn!("Session {} forcing out sub-session {} ({})", env.id(), index + 1, sub.peer);
        if let Some(task) = sub.task.take() {
            task.abort();
        }
        if let Some(timer) = sub.keepalive.take() {
            env.shared.timers.cancel(timer);
        }
        env.shared
            .gate_unregister(&sub_task_name(kind, env.id(), index));
        sub.lifecycle.transition(RunStatus::GoingStop);
        sub.lifecycle.transition(RunStatus::Stop);
    }
}

fn pool_empty(slot: &SessionSlot) -> bool {
    lock(&slot.subs).is_empty()
}

/// Record an access to sub-session `index` by `peer`
pub(crate) fn touch_sub(slot: &SessionSlot, index: usize, peer: SocketAddr) {
    let mut pool = lock(&slot.subs);
    if pool.find(peer) == Some(index) {
        pool.touch(index, rtc_ticks());
    }
}

/// Tear down a sub-session task and free its slot.
///
/// Order: keep-alive timer, link, snapshot, gate registration, status, slot.
pub(crate) async fn finish_sub(
    env: &TaskEnv,
    lifecycle: &Lifecycle,
    index: usize,
    peer: SocketAddr,
    module: &str,
    snapshot: Option<&str>,
) {
    lifecycle.transition(RunStatus::GoingStop);
    let (link, keepalive) = {
        let mut pool = lock(&env.slot.subs);
        match pool.get_mut(index) {
            Some(sub) if sub.peer == peer => {
                sub.inbox = None;
                (sub.link.take(), sub.keepalive.take())
            }
            _ => (None, None),
        }
    };
    if let Some(timer) = keepalive {
        env.shared.timers.cancel(timer);
    }
    if let Some(link) = link {
        link.shutdown().await;
    }
    if let Some(snapshot) = snapshot {
        env.shared.clear_snapshot(snapshot);
    }
    env.shared.gate_unregister(module);
    lifecycle.transition(RunStatus::Stop);
    lock(&env.slot.subs).release(index, peer);
    info!("{} closed ({})", module, peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::SecureSetup;
    use crate::secure::{HandshakeEngine, PskEngine, StreamTransport};
    use crate::state::{write, ManagerOptions, SessionDeps};
    use dpm_power::{EventGroup, NullWatchdog, RtcTimerService, SleepGate};
    use dpm_retention::MemoryRetention;
    use dpm_secure::{PskHandshake, SessionCodec};
    use std::sync::atomic::Ordering;

    fn env(dpm: bool) -> TaskEnv {
        let shared = Shared::new(
            SessionDeps {
                gate: Arc::new(SleepGate::new(dpm)),
                timers: Arc::new(RtcTimerService::new()),
                events: Arc::new(EventGroup::new()),
                codec: SessionCodec::new(Arc::new(MemoryRetention::new(8192)), dpm),
                watchdog: Arc::new(NullWatchdog),
            },
            ManagerOptions {
                start_wait: Duration::from_secs(1),
                stop_wait: Duration::from_millis(300),
                send_wait: Duration::from_millis(300),
            },
        );
        TaskEnv {
            shared: Arc::new(shared),
            slot: Arc::new(SessionSlot::new(1)),
        }
    }

    fn install_psk(env: &TaskEnv) {
        let setup: Arc<dyn SecureSetup> = Arc::new(|_id: u8, _endpoint: Endpoint| {
            let psk = PskHandshake::new("node", b"secret", 0x00A8).map_err(|e| e.to_string())?;
            Ok(Arc::new(PskEngine::new(psk)) as Arc<dyn HandshakeEngine>)
        });
        write(&env.slot.callbacks).secure = Some(setup);
    }

    fn target<'a>(endpoint: Endpoint, snapshot: &'a str) -> SecureTarget<'a> {
        SecureTarget {
            endpoint,
            transport: Transport::Stream,
            snapshot,
            module: "tcp_cnt1",
            client_id: None,
        }
    }

    #[tokio::test]
    async fn test_establish_saves_then_restores_on_wake() {
        let client = env(true);
        let server = env(false);
        install_psk(&client);
        install_psk(&server);

        let (mut a, mut b) = tokio::io::duplex(4096);
        let lifecycle = Lifecycle::new();
        let client_target = target(Endpoint::Client, "tcp_cnt_tls1");
        let server_target = target(Endpoint::Server, "tcp_srv_tls1_1");
        let mut client_io = StreamTransport::new(&mut a, Duration::from_secs(2));
        let mut server_io = StreamTransport::new(&mut b, Duration::from_secs(2));
        let (c, s) = tokio::join!(
            establish_secure(&client, &lifecycle, &client_target, &mut client_io),
            establish_secure(&server, &lifecycle, &server_target, &mut server_io)
        );
        assert!(c.unwrap().unwrap().is_established());
        assert!(s.unwrap().unwrap().is_established());
        assert!(client.shared.codec.exists("tcp_cnt_tls1"));

        // After a wake the snapshot is used without touching the transport
        client.shared.wake.store(true, Ordering::SeqCst);
        let (mut silent, _peer) = tokio::io::duplex(64);
        let mut io = StreamTransport::new(&mut silent, Duration::from_millis(50));
        let restored = establish_secure(&client, &lifecycle, &client_target, &mut io)
            .await
            .unwrap()
            .unwrap();
        assert!(restored.is_established());
    }

    #[tokio::test]
    async fn test_establish_without_setup_fails() {
        let env = env(false);
        let lifecycle = Lifecycle::new();
        let (mut a, _b) = tokio::io::duplex(64);
        let mut io = StreamTransport::new(&mut a, Duration::from_millis(50));
        let err = establish_secure(&env, &lifecycle, &target(Endpoint::Client, "tcp_cnt_tls1"), &mut io)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 0x16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_establish_interrupted_by_request() {
        let env = env(false);
        install_psk(&env);
        let lifecycle = Arc::new(Lifecycle::new());
        let (mut a, _b) = tokio::io::duplex(64);
        let stopper = lifecycle.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            stopper.request(Request::Stop);
        });
        let mut io = StreamTransport::new(&mut a, Duration::from_secs(30));
        let result = establish_secure(&env, &lifecycle, &target(Endpoint::Client, "tcp_cnt_tls1"), &mut io)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(lifecycle.pending(), Request::Stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_returns_request() {
        let lifecycle = Lifecycle::new();
        assert_eq!(idle(&lifecycle, Duration::from_millis(10)).await, None);
        lifecycle.request(Request::Restart);
        assert_eq!(idle(&lifecycle, Duration::from_secs(60)).await, Some(Exit::Restart));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_waits_for_release() {
        let env = env(false);
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let sub = SubSession::new(peer, 0);
        let lifecycle = sub.lifecycle.clone();
        {
            let mut pool = lock(&env.slot.subs);
            *pool = crate::subsession::SubSessionPool::new(2);
            pool.occupy(0, sub);
        }

        let task_env = env.clone();
        tokio::spawn(async move {
            lifecycle.requested().await;
            finish_sub(&task_env, &lifecycle, 0, peer, "tcp_srv1_1", None).await;
        });
        assert!(evict_sub(&env, 0).await);
        assert!(pool_empty(&env.slot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_subs_forces_out_stuck_peers() {
        let env = env(false);
        let peer: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        {
            let mut pool = lock(&env.slot.subs);
            *pool = crate::subsession::SubSessionPool::new(2);
            pool.occupy(1, SubSession::new(peer, 0));
        }
        stop_subs(&env, SessionKind::TcpServer).await;
        assert!(pool_empty(&env.slot));
    }
}
