//! TCP server session task and its per-peer sub-session tasks.

use dpm_power::{rtc_ticks, EventBits};
use dpm_secure::{Endpoint, Transport};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{
    bind_tcp, establish_secure, evict_sub, finish_sub, stop_subs, touch_sub, Exit, LoopEnd,
    SecureTarget, Step, StreamLoop, TaskEnv,
};
use crate::config::{
    snapshot_name, sub_task_name, task_name, SessionConfig, SessionKind, ACCEPT_POLL,
};
use crate::lifecycle::{Lifecycle, RunStatus};
use crate::link::Link;
use crate::secure::{SecureInfo, StreamTransport};
use crate::state::{lock, Activity};
use crate::subsession::{Admission, SubSession};
use crate::DpmError;

const KIND: SessionKind = SessionKind::TcpServer;

pub(super) async fn run(env: TaskEnv) {
    let module = task_name(KIND, env.id());
    let lifecycle = &env.slot.lifecycle;
    let port = env.slot.config().local_port;
    env.shared.gate_register(&module, Some(port));
    info!("{} started", module);

    loop {
        lifecycle.transition(RunStatus::Init);
        let config = env.slot.config();
        let backlog = KIND.max_sub() as u32 + 1;
        let exit = match bind_tcp(lifecycle, config.local_port, backlog).await {
            Step::Ready(listener) => serve(&env, &config, &module, listener).await,
            Step::Interrupted(exit) => exit,
            Step::Failed(e) => {
                env.report(&e);
                Exit::Stop
            }
        };

        lifecycle.transition(RunStatus::GoingStop);
        stop_subs(&env, KIND).await;
        if exit != Exit::Restart {
            break;
        }
        info!("{} restarting", module);
    }

    env.shared.gate_unregister(&module);
    lifecycle.transition(RunStatus::Stop);
    info!("{} stopped", module);
}

async fn serve(env: &TaskEnv, config: &SessionConfig, module: &str, listener: TcpListener) -> Exit {
    let lifecycle = &env.slot.lifecycle;
    lifecycle.transition(RunStatus::WaitAccept);
    env.shared.gate_ready(module);
    info!("{} listening on port {}", module, config.local_port);

    let mut queued: VecDeque<(TcpStream, SocketAddr)> = VecDeque::new();
    loop {
        if let Some(exit) = Exit::from_request(lifecycle.take_request()) {
            return exit;
        }

        if let Some((stream, peer)) = queued.pop_front() {
            if let Some(back) = admit(env, config, stream, peer).await {
                queued.push_front(back);
            }
        }

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => accepted,
            _ = lifecycle.requested() => continue,
        };
        match accepted {
            Err(_) => {}
            Ok(Ok((stream, peer))) => {
                info!("{} accepted {}", module, peer);
                if let Some(back) = admit(env, config, stream, peer).await {
                    if queued.len() < KIND.max_sub() {
                        debug!("{} queued {}", module, peer);
                        queued.push_back(back);
                    } else {
                        warn!("{} queue full, dropping {}", module, peer);
                    }
                }
            }
            Ok(Err(e)) => env.report(&DpmError::SocketAccept(e)),
        }
    }
}

/// Give `peer` a slot; hands the connection back when it has to wait
async fn admit(
    env: &TaskEnv,
    config: &SessionConfig,
    stream: TcpStream,
    peer: SocketAddr,
) -> Option<(TcpStream, SocketAddr)> {
    let lifecycle = &env.slot.lifecycle;
    lifecycle.transition(RunStatus::Init);

    let admission = lock(&env.slot.subs).admit(peer);
    let index = match admission {
        Admission::Vacant(index) => Some(index),
        Admission::Existing(index) | Admission::Evict(index) => {
            evict_sub(env, index).await.then_some(index)
        }
        Admission::Queue => None,
    };

    let result = match index {
        Some(index) => {
            spawn_sub(env, config, index, stream, peer);
            None
        }
        None => Some((stream, peer)),
    };
    lifecycle.transition(RunStatus::WaitAccept);
    result
}

fn spawn_sub(
    env: &TaskEnv,
    config: &SessionConfig,
    index: usize,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let sub = SubSession::new(peer, rtc_ticks());
    let lifecycle = sub.lifecycle.clone();
    let activity = sub.activity.clone();
    if !lock(&env.slot.subs).occupy(index, sub) {
        warn!("Session {} slot {} taken, dropping {}", env.id(), index + 1, peer);
        return;
    }

    let handle = tokio::spawn(run_sub(
        env.clone(),
        config.clone(),
        index,
        stream,
        peer,
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
    config: SessionConfig,
    index: usize,
    mut stream: TcpStream,
    peer: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    activity: Arc<Activity>,
) {
    let id = env.id();
    let module = sub_task_name(KIND, id, index);
    let snapshot = snapshot_name(KIND, id, Some(index));
    let snapshot_ref = config.secure.then_some(snapshot.as_str());
    env.shared.gate_register(&module, None);
    lifecycle.transition(RunStatus::Init);

    let secure = if config.secure {
        let target = SecureTarget {
            endpoint: Endpoint::Server,
            transport: Transport::Stream,
            snapshot: &snapshot,
            module: &module,
            client_id: None,
        };
        let timeout = KIND.rx_timeout(true);
        let local = stream
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        let mut io = StreamTransport::new(&mut stream, timeout);
        match establish_secure(&env, &lifecycle, &target, &mut io).await {
            Ok(Some(ctx)) => Some((
                ctx,
                SecureInfo {
                    local,
                    peer: peer.to_string(),
                    sub_index: Some(index),
                    timeout_ms: timeout.as_millis() as u64,
                    snapshot: snapshot.clone(),
                },
            )),
            Ok(None) => {
                finish_sub(&env, &lifecycle, index, peer, &module, snapshot_ref).await;
                return;
            }
            Err(e) => {
                env.report(&e);
                finish_sub(&env, &lifecycle, index, peer, &module, snapshot_ref).await;
                return;
            }
        }
    } else {
        None
    };

    let (mut reader, writer) = stream.into_split();
    let link = Arc::new(Link::tcp(peer, writer, secure));
    let keepalive = env.shared.arm_keepalive(
        id,
        &module,
        config.keepalive_ms,
        EventBits::tcp_server_keepalive(index as u8 + 1),
    );
    let attached = {
        let mut pool = lock(&env.slot.subs);
        match pool.get_mut(index) {
            Some(sub) if sub.peer == peer => {
                sub.link = Some(link.clone());
                sub.keepalive = keepalive;
                true
            }
            _ => false,
        }
    };
    if !attached {
        if let Some(timer) = keepalive {
            env.shared.timers.cancel(timer);
        }
        warn!("{} lost its slot before running", module);
        finish_sub(&env, &lifecycle, index, peer, &module, snapshot_ref).await;
        return;
    }

    let callbacks = env.slot.callbacks();
    if let Some(handler) = &callbacks.connect {
        handler.on_connect(id, peer, Some(index));
    }
    lifecycle.transition(RunStatus::Run);
    env.shared.gate_receive_ready(&module);
    env.shared.gate_ready(&module);

    let receive = callbacks.receive.clone();
    let slot = env.slot.clone();
    let end = StreamLoop {
        shared: &env.shared,
        session: id,
        lifecycle: &lifecycle,
        activity: &activity,
        link: &link,
        module: &module,
        rx_timeout: KIND.rx_timeout(config.secure),
        window: config.window_size,
    }
    .run(&mut reader, |data| {
        touch_sub(&slot, index, peer);
        if let Some(handler) = &receive {
            handler.on_receive(id, peer, data);
        }
    })
    .await;

    match end {
        LoopEnd::Request(request) => debug!("{} got {:?}", module, request),
        LoopEnd::PeerClosed => info!("{} peer {} closed", module, peer),
        LoopEnd::Failed(e) => env.report(&e),
    }
    finish_sub(&env, &lifecycle, index, peer, &module, snapshot_ref).await;
}
