//! Application callbacks, one trait per event kind.
//!
//! Every trait has a blanket implementation for matching closures, so applications can
//! register either a handler type or a plain `Fn`.

use dpm_secure::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::secure::HandshakeEngine;

/// Called once a session or sub-session reaches `Run`
pub trait ConnectHandler: Send + Sync {
    /// `sub` is the sub-session index for servers
    fn on_connect(&self, session: u8, peer: SocketAddr, sub: Option<usize>);
}

impl<F> ConnectHandler for F
where
    F: Fn(u8, SocketAddr, Option<usize>) + Send + Sync,
{
    fn on_connect(&self, session: u8, peer: SocketAddr, sub: Option<usize>) {
        self(session, peer, sub)
    }
}

/// Called with every chunk of application data received
pub trait ReceiveHandler: Send + Sync {
    /// Data from `peer` on `session`
    fn on_receive(&self, session: u8, peer: SocketAddr, data: &[u8]);
}

impl<F> ReceiveHandler for F
where
    F: Fn(u8, SocketAddr, &[u8]) + Send + Sync,
{
    fn on_receive(&self, session: u8, peer: SocketAddr, data: &[u8]) {
        self(session, peer, data)
    }
}

/// Supplies the handshake engine of a secure session
pub trait SecureSetup: Send + Sync {
    /// Engine for `session` acting as `endpoint`
    fn engine(&self, session: u8, endpoint: Endpoint) -> Result<Arc<dyn HandshakeEngine>, String>;
}

impl<F> SecureSetup for F
where
    F: Fn(u8, Endpoint) -> Result<Arc<dyn HandshakeEngine>, String> + Send + Sync,
{
    fn engine(&self, session: u8, endpoint: Endpoint) -> Result<Arc<dyn HandshakeEngine>, String> {
        self(session, endpoint)
    }
}

/// Single channel for asynchronous failures
pub trait ErrorHandler: Send + Sync {
    /// `code` is the numeric error code, see [`DpmError::code`](crate::DpmError::code)
    fn on_error(&self, code: u32, message: &str);
}

impl<F> ErrorHandler for F
where
    F: Fn(u32, &str) + Send + Sync,
{
    fn on_error(&self, code: u32, message: &str) {
        self(code, message)
    }
}

/// Called when a user timer fires
pub trait TimerHandler: Send + Sync {
    /// `timer` is the user timer id (1..=4)
    fn on_timer(&self, timer: u8);
}

impl<F> TimerHandler for F
where
    F: Fn(u8) + Send + Sync,
{
    fn on_timer(&self, timer: u8) {
        self(timer)
    }
}

/// Callbacks registered for one session
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    /// Connect notification
    pub connect: Option<Arc<dyn ConnectHandler>>,
    /// Received data
    pub receive: Option<Arc<dyn ReceiveHandler>>,
    /// Handshake engine provider for secure sessions
    pub secure: Option<Arc<dyn SecureSetup>>,
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("connect", &self.connect.is_some())
            .field("receive", &self.receive.is_some())
            .field("secure", &self.secure.is_some())
            .finish()
    }
}
