//! UDP server session task.
//!
//! A plain server hands every datagram to the receive callback. A secure server runs
//! one DTLS sub-session per peer; the socket task routes datagrams to the peer's
//! inbox and spawns a sub-session for unknown peers.

use dpm_power::rtc_ticks;
use dpm_secure::{Endpoint, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    bind_udp, establish_secure, evict_sub, finish_sub, stop_subs, touch_sub, Exit, SecureTarget,
    Step, TaskEnv,
};
use crate::config::{
    snapshot_name, sub_task_name, task_name, SessionConfig, SessionKind,
    DTLS_HANDSHAKE_READ_TIMEOUT, RX_BUFFER_SIZE, SUB_INBOX_DEPTH, UDP_RX_TIMEOUT,
};
use crate::lifecycle::{Lifecycle, Request, RunStatus};
use crate::link::Link;
use crate::secure::{ChannelTransport, SecureInfo};
use crate::state::{lock, write, Activity, Busy, Direction};
use crate::subsession::{Admission, SubSession};
use crate::DpmError;

const KIND: SessionKind = SessionKind::UdpServer;

pub(super) async fn run(env: TaskEnv) {
    let module = task_name(KIND, env.id());
    let lifecycle = &env.slot.lifecycle;
    let port = env.slot.config().local_port;
    env.shared.gate_register(&module, Some(port));
    info!("{} started", module);

    loop {
        lifecycle.transition(RunStatus::Init);
        let config = env.slot.config();
        let exit = match bind_udp(lifecycle, config.local_port, false).await {
            Step::Ready(socket) => serve(&env, &config, &module, socket).await,
            Step::Interrupted(exit) => exit,
            Step::Failed(e) => {
                env.report(&e);
                Exit::Stop
            }
        };

        lifecycle.transition(RunStatus::GoingStop);
        stop_subs(&env, KIND).await;
        *write(&env.slot.udp_socket) = None;
        if exit != Exit::Restart {
            break;
        }
        info!("{} restarting", module);
    }

    env.shared.gate_unregister(&module);
    lifecycle.transition(RunStatus::Stop);
    info!("{} stopped", module);
}

async fn serve(env: &TaskEnv, config: &SessionConfig, module: &str, socket: UdpSocket) -> Exit {
    let lifecycle = &env.slot.lifecycle;
    let socket = Arc::new(socket);
    *write(&env.slot.udp_socket) = Some(socket.clone());
    lifecycle.transition(RunStatus::Run);
    env.shared.gate_receive_ready(module);
    env.shared.gate_ready(module);
    info!("{} listening on port {}", module, config.local_port);

    let callbacks = env.slot.callbacks();
    // Sub-sessions get whole datagrams, so the window only sizes this buffer
    let mut buf = vec![0u8; config.window_size.max(RX_BUFFER_SIZE)];
    loop {
        if let Some(exit) = Exit::from_request(lifecycle.take_request()) {
            return exit;
        }
        let received = tokio::select! {
            received = tokio::time::timeout(UDP_RX_TIMEOUT, socket.recv_from(&mut buf)) => received,
            _ = lifecycle.requested() => continue,
        };
        let (n, peer) = match received {
            Err(_) => continue,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!("{} receive failed: {}", module, e);
                continue;
            }
        };

        if config.secure {
            route(env, &socket, peer, buf[..n].to_vec()).await;
        } else if n > 0 {
            let _busy = Busy::enter(&env.shared, &env.slot.activity, Direction::Receive, module);
            debug!("{} received {} bytes from {}", module, n, peer);
            if let Some(handler) = &callbacks.receive {
                handler.on_receive(env.id(), peer, &buf[..n]);
            }
        }
    }
}

/// Hand a datagram to the sub-session of `peer`, creating one when needed
async fn route(
    env: &TaskEnv,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    datagram: Vec<u8>,
) {
    let inbox = {
        let pool = lock(&env.slot.subs);
        pool.find(peer)
            .and_then(|index| pool.get(index))
            .and_then(|sub| sub.inbox.clone())
    };
    if let Some(inbox) = inbox {
        if inbox.try_send(datagram).is_err() {
            debug!("Session {} inbox of {} full, dropping datagram", env.id(), peer);
        }
        return;
    }

    let admission = lock(&env.slot.subs).admit(peer);
    let index = match admission {
        Admission::Vacant(index) => index,
        Admission::Existing(index) | Admission::Evict(index) => {
            if !evict_sub(env, index).await {
                return;
            }
            index
        }
        Admission::Queue => {
            warn!("Session {} has no slot for {}, dropping datagram", env.id(), peer);
            return;
        }
    };

    let (tx, rx) = mpsc::channel(SUB_INBOX_DEPTH);
    if tx.try_send(datagram).is_err() {
        return;
    }
    let mut sub = SubSession::new(peer, rtc_ticks());
    sub.inbox = Some(tx);
    let lifecycle = sub.lifecycle.clone();
    let activity = sub.activity.clone();
    if !lock(&env.slot.subs).occupy(index, sub) {
        warn!("Session {} slot {} taken, dropping {}", env.id(), index + 1, peer);
        return;
    }

    let handle = tokio::spawn(run_sub(
        env.clone(),
        socket.clone(),
        index,
        peer,
        rx,
        lifecycle,
        activity,
    ));
    if let Some(sub) = lock(&env.slot.subs).get_mut(index) {
        if sub.peer == peer {
            sub.task = Some(handle);
        }
    }
}

async fn run_sub(
    env: TaskEnv,
    socket: Arc<UdpSocket>,
    index: usize,
    peer: SocketAddr,
    mut inbox: mpsc::Receiver<Vec<u8>>,
    lifecycle: Arc<Lifecycle>,
    activity: Arc<Activity>,
) {
    let id = env.id();
    let module = sub_task_name(KIND, id, index);
    let snapshot = snapshot_name(KIND, id, Some(index));
    env.shared.gate_register(&module, None);
    lifecycle.transition(RunStatus::Init);
    info!("{} serving {}", module, peer);

    let client_id = peer.to_string();
    let target = SecureTarget {
        endpoint: Endpoint::Server,
        transport: Transport::Datagram,
        snapshot: &snapshot,
        module: &module,
        client_id: Some(client_id.as_bytes()),
    };
    let established = {
        let mut io = ChannelTransport::new(&socket, peer, &mut inbox, DTLS_HANDSHAKE_READ_TIMEOUT);
        establish_secure(&env, &lifecycle, &target, &mut io).await
    };
    let ctx = match established {
        Ok(Some(ctx)) => ctx,
        Ok(None) => {
            finish_sub(&env, &lifecycle, index, peer, &module, Some(&snapshot)).await;
            return;
        }
        Err(e) => {
            env.report(&e);
            finish_sub(&env, &lifecycle, index, peer, &module, Some(&snapshot)).await;
            return;
        }
    };

    let info = SecureInfo {
        local: socket
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
        peer: client_id.clone(),
        sub_index: Some(index),
        timeout_ms: UDP_RX_TIMEOUT.as_millis() as u64,
        snapshot: snapshot.clone(),
    };
    let link = Arc::new(Link::udp(peer, socket.clone(), false, Some((ctx, info))));
    let attached = {
        let mut pool = lock(&env.slot.subs);
        match pool.get_mut(index) {
            Some(sub) if sub.peer == peer => {
                sub.link = Some(link.clone());
                true
            }
            _ => false,
        }
    };
    if !attached {
        finish_sub(&env, &lifecycle, index, peer, &module, Some(&snapshot)).await;
        return;
    }

    let callbacks = env.slot.callbacks();
    if let Some(handler) = &callbacks.connect {
        handler.on_connect(id, peer, Some(index));
    }
    lifecycle.transition(RunStatus::Run);
    env.shared.gate_receive_ready(&module);
    env.shared.gate_ready(&module);

    loop {
        if lifecycle.take_request() != Request::None {
            break;
        }
        let next = tokio::select! {
            next = tokio::time::timeout(UDP_RX_TIMEOUT, inbox.recv()) => next,
            _ = lifecycle.requested() => continue,
        };
        let datagram = match next {
            Err(_) => continue,
            Ok(Some(datagram)) => datagram,
            Ok(None) => break,
        };

        let _busy = Busy::enter(&env.shared, &activity, Direction::Receive, &module);
        match link.open_datagram(&datagram) {
            Ok(Some(data)) => {
                touch_sub(&env.slot, index, peer);
                if let Some(handler) = &callbacks.receive {
                    handler.on_receive(id, peer, &data);
                }
            }
            Ok(None) => {}
            Err(DpmError::PeerClosed(_)) => {
                info!("{} peer {} closed", module, peer);
                break;
            }
            Err(e) => {
                env.report(&e);
                break;
            }
        }
        if let Err(e) = link.save_snapshot(&env.shared.codec) {
            env.report(&DpmError::SaveSslFail(e));
        }
    }

    finish_sub(&env, &lifecycle, index, peer, &module, Some(&snapshot)).await;
}
