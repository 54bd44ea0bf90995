//! TCP client session task.

use dpm_power::EventBits;
use dpm_secure::{Endpoint, Transport};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use super::{
    establish_secure, idle, interrupted, reconnect_or_stop, Exit, LoopEnd, SecureTarget, Step,
    StreamLoop, TaskEnv,
};
use crate::config::{snapshot_name, task_name, SessionConfig, SessionKind, RECONNECT_WAIT};
use crate::lifecycle::RunStatus;
use crate::link::Link;
use crate::secure::{SecureInfo, StreamTransport};
use crate::state::{lock, write};
use crate::DpmError;

const KIND: SessionKind = SessionKind::TcpClient;

pub(super) async fn run(env: TaskEnv) {
    let id = env.id();
    let module = task_name(KIND, id);
    let snapshot = snapshot_name(KIND, id, None);
    let lifecycle = &env.slot.lifecycle;
    let local_port = env.slot.config().local_port;
    env.shared
        .gate_register(&module, (local_port != 0).then_some(local_port));
    info!("{} started", module);

    loop {
        lifecycle.transition(RunStatus::Init);
        let config = env.slot.config();
        let exit = connect_and_serve(&env, &config, &module, &snapshot).await;

        lifecycle.transition(RunStatus::GoingStop);
        teardown(&env, &snapshot, config.secure).await;
        match exit {
            Exit::Stop => break,
            Exit::Restart => info!("{} restarting", module),
            Exit::Reconnect => {
                info!("{} reconnecting in {:?}", module, RECONNECT_WAIT);
                env.shared.gate_ready(&module);
                if idle(lifecycle, RECONNECT_WAIT).await == Some(Exit::Stop) {
                    break;
                }
            }
        }
    }

    env.shared.gate_unregister(&module);
    lifecycle.transition(RunStatus::Stop);
    info!("{} stopped", module);
}

async fn connect_and_serve(env: &TaskEnv, config: &SessionConfig, module: &str, snapshot: &str) -> Exit {
    let lifecycle = &env.slot.lifecycle;
    let peer = match config.peer() {
        Some(peer) => peer,
        None => {
            env.report(&DpmError::Parameter("client session without peer address"));
            return Exit::Stop;
        }
    };

    let mut stream = match connect(env, config, peer).await {
        Step::Ready(stream) => stream,
        Step::Interrupted(exit) => return exit,
        Step::Failed(e) => {
            env.report(&e);
            return reconnect_or_stop(config);
        }
    };
    lifecycle.transition(RunStatus::Connected);
    info!("{} connected to {}", module, peer);

    let secure = if config.secure {
        let target = SecureTarget {
            endpoint: Endpoint::Client,
            transport: Transport::Stream,
            snapshot,
            module,
            client_id: None,
        };
        let timeout = KIND.rx_timeout(true);
        let local = stream
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let mut io = StreamTransport::new(&mut stream, timeout);
        match establish_secure(env, lifecycle, &target, &mut io).await {
            Ok(Some(ctx)) => Some((
                ctx,
                SecureInfo {
                    local,
                    peer: peer.to_string(),
                    sub_index: None,
                    timeout_ms: timeout.as_millis() as u64,
                    snapshot: snapshot.to_string(),
                },
            )),
            Ok(None) => return interrupted(lifecycle),
            Err(e) => {
                env.report(&e);
                return reconnect_or_stop(config);
            }
        }
    } else {
        None
    };

    let (mut reader, writer) = stream.into_split();
    let link = Arc::new(Link::tcp(peer, writer, secure));
    *write(&env.slot.link) = Some(link.clone());

    let callbacks = env.slot.callbacks();
    if let Some(handler) = &callbacks.connect {
        handler.on_connect(env.id(), peer, None);
    }
    let keepalive = env.shared.arm_keepalive(
        env.id(),
        module,
        config.keepalive_ms,
        EventBits::tcp_client_keepalive(env.id()),
    );
    *lock(&env.slot.keepalive) = keepalive;

    lifecycle.transition(RunStatus::Run);
    env.shared.gate_receive_ready(module);
    env.shared.gate_ready(module);

    let id = env.id();
    let receive = callbacks.receive.clone();
    let end = StreamLoop {
        shared: &env.shared,
        session: id,
        lifecycle,
        activity: &env.slot.activity,
        link: &link,
        module,
        rx_timeout: KIND.rx_timeout(config.secure),
        window: config.window_size,
    }
    .run(&mut reader, |data| {
        if let Some(handler) = &receive {
            handler.on_receive(id, peer, data);
        }
    })
    .await;

    match end {
        LoopEnd::Request(request) => {
            debug!("{} got {:?}", module, request);
            Exit::from_request(request).unwrap_or(Exit::Stop)
        }
        LoopEnd::PeerClosed => {
            env.report(&DpmError::PeerClosed(peer));
            reconnect_or_stop(config)
        }
        LoopEnd::Failed(e) => {
            env.report(&e);
            reconnect_or_stop(config)
        }
    }
}

fn open_socket(peer: SocketAddr, local_port: u16) -> Result<TcpSocket, DpmError> {
    let (socket, any) = if peer.is_ipv4() {
        (TcpSocket::new_v4(), IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    } else {
        (TcpSocket::new_v6(), IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    };
    let socket = socket.map_err(DpmError::SocketCreate)?;
    socket.set_reuseaddr(true).map_err(DpmError::SocketCreate)?;
    socket.set_keepalive(true).map_err(DpmError::SocketCreate)?;
    if local_port != 0 {
        socket
            .bind(SocketAddr::new(any, local_port))
            .map_err(|source| DpmError::SocketBind {
                port: local_port,
                source,
            })?;
    }
    Ok(socket)
}

/// Connect with `conn_retry_count` attempts spaced by the connection wait time
async fn connect(env: &TaskEnv, config: &SessionConfig, peer: SocketAddr) -> Step<TcpStream> {
    let lifecycle = &env.slot.lifecycle;
    let attempts = config.conn_retry_count.max(1);
    let mut last = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");

    for attempt in 1..=attempts {
        let socket = match open_socket(peer, config.local_port) {
            Ok(socket) => socket,
            Err(e) => return Step::Failed(e),
        };
        let connecting = tokio::time::timeout(config.conn_wait(), socket.connect(peer));
        let result = tokio::select! {
            result = connecting => result,
            _ = lifecycle.requested() => return Step::Interrupted(interrupted(lifecycle)),
        };
        match result {
            Ok(Ok(stream)) => return Step::Ready(stream),
            Ok(Err(e)) => {
                warn!("Connect to {} failed ({}/{}): {}", peer, attempt, attempts, e);
                last = e;
            }
            Err(_) => {
                warn!("Connect to {} timed out ({}/{})", peer, attempt, attempts);
                last = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
            }
        }
        if attempt < attempts {
            if let Some(exit) = idle(lifecycle, config.conn_wait()).await {
                return Step::Interrupted(exit);
            }
        }
    }
    Step::Failed(DpmError::SocketConnectFail { peer, source: last })
}

/// Release what the last connection held; the gate registration stays
async fn teardown(env: &TaskEnv, snapshot: &str, secure: bool) {
    let keepalive = lock(&env.slot.keepalive).take();
    if let Some(timer) = keepalive {
        env.shared.timers.cancel(timer);
    }
    let link = write(&env.slot.link).take();
    if let Some(link) = link {
        link.shutdown().await;
    }
    if secure {
        env.shared.clear_snapshot(snapshot);
    }
}
