//! UDP client session task.

use dpm_secure::{Endpoint, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{
    bind_udp, establish_secure, idle, interrupted, reconnect_or_stop, Exit, SecureTarget, Step,
    TaskEnv,
};
use crate::config::{
    snapshot_name, task_name, SessionConfig, SessionKind, DTLS_HANDSHAKE_READ_TIMEOUT,
    RECONNECT_WAIT, RX_BUFFER_SIZE, UDP_RX_TIMEOUT,
};
use crate::lifecycle::RunStatus;
use crate::link::Link;
use crate::secure::{DatagramTransport, SecureInfo};
use crate::state::{write, Busy, Direction};
use crate::DpmError;

const KIND: SessionKind = SessionKind::UdpClient;

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
        let exit = match open(&env, &config).await {
            Step::Ready((socket, peer)) => serve(&env, &config, &module, &snapshot, socket, peer).await,
            Step::Interrupted(exit) => exit,
            Step::Failed(e) => {
                env.report(&e);
                reconnect_or_stop(&config)
            }
        };

        lifecycle.transition(RunStatus::GoingStop);
        *write(&env.slot.link) = None;
        if config.secure {
            env.shared.clear_snapshot(&snapshot);
        }
        match exit {
            Exit::Stop => break,
            Exit::Restart => info!("{} restarting", module),
            Exit::Reconnect => {
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

/// Bind the local port and fix the peer
async fn open(env: &TaskEnv, config: &SessionConfig) -> Step<(UdpSocket, SocketAddr)> {
    let peer = match config.peer() {
        Some(peer) => peer,
        None => return Step::Failed(DpmError::Parameter("client session without peer address")),
    };
    let socket = match bind_udp(&env.slot.lifecycle, config.local_port, peer.is_ipv6()).await {
        Step::Ready(socket) => socket,
        Step::Interrupted(exit) => return Step::Interrupted(exit),
        Step::Failed(e) => return Step::Failed(e),
    };
    match socket.connect(peer).await {
        Ok(()) => Step::Ready((socket, peer)),
        Err(source) => Step::Failed(DpmError::SocketConnectFail { peer, source }),
    }
}

async fn serve(
    env: &TaskEnv,
    config: &SessionConfig,
    module: &str,
    snapshot: &str,
    socket: UdpSocket,
    peer: SocketAddr,
) -> Exit {
    let lifecycle = &env.slot.lifecycle;
    let socket = Arc::new(socket);
    lifecycle.transition(RunStatus::Connected);

    let secure = if config.secure {
        let target = SecureTarget {
            endpoint: Endpoint::Client,
            transport: Transport::Datagram,
            snapshot,
            module,
            client_id: None,
        };
        let mut io = DatagramTransport::new(&socket, DTLS_HANDSHAKE_READ_TIMEOUT);
        match establish_secure(env, lifecycle, &target, &mut io).await {
            Ok(Some(ctx)) => Some((
                ctx,
                SecureInfo {
                    local: socket
                        .local_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_default(),
                    peer: peer.to_string(),
                    sub_index: None,
                    timeout_ms: UDP_RX_TIMEOUT.as_millis() as u64,
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

    let link = Arc::new(Link::udp(peer, socket.clone(), true, secure));
    *write(&env.slot.link) = Some(link.clone());
    let callbacks = env.slot.callbacks();
    if let Some(handler) = &callbacks.connect {
        handler.on_connect(env.id(), peer, None);
    }
    lifecycle.transition(RunStatus::Run);
    env.shared.gate_receive_ready(module);
    env.shared.gate_ready(module);
    info!("{} bound to {}", module, peer);

    let mut buf = vec![0u8; config.window_size.max(RX_BUFFER_SIZE)];
    loop {
        if let Some(exit) = Exit::from_request(lifecycle.take_request()) {
            return exit;
        }
        let received = tokio::select! {
            received = tokio::time::timeout(UDP_RX_TIMEOUT, socket.recv(&mut buf)) => received,
            _ = lifecycle.requested() => continue,
        };
        let n = match received {
            Err(_) => continue,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                // Connected UDP sockets surface ICMP errors here
                warn!("{} receive failed: {}", module, e);
                if let Some(exit) = idle(lifecycle, UDP_RX_TIMEOUT).await {
                    return exit;
                }
                continue;
            }
        };

        let _busy = Busy::enter(&env.shared, &env.slot.activity, Direction::Receive, module);
        debug!("{} received {} bytes", module, n);
        match link.open_datagram(&buf[..n]) {
            Ok(Some(data)) => {
                if let Some(handler) = &callbacks.receive {
                    handler.on_receive(env.id(), peer, &data);
                }
            }
            Ok(None) => {}
            Err(DpmError::PeerClosed(_)) => {
                env.report(&DpmError::PeerClosed(peer));
                return reconnect_or_stop(config);
            }
            Err(e) => env.report(&e),
        }
        if let Err(e) = link.save_snapshot(&env.shared.codec) {
            env.report(&DpmError::SaveSslFail(e));
        }
    }
}
