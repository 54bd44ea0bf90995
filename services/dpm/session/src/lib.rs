//! Session layer for DPM.
//!
//! Runs up to four logical TCP/UDP sessions, clients or servers, each on its own task.
//! Servers keep a small pool of per-peer sub-sessions. Every task votes on the sleep gate,
//! and secure sessions snapshot their record state into retention memory after each
//! exchange so they survive deep power-down.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callbacks;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod manager;
pub mod secure;
pub mod subsession;

mod state;
mod task;

pub use callbacks::{
    ConnectHandler, ErrorHandler, ReceiveHandler, SecureSetup, SessionCallbacks, TimerHandler,
};
pub use config::{
    snapshot_name, sub_task_name, task_name, SessionConfig, SessionKind, MAX_SESSION_CNT,
    MAX_TIMER_CNT, TCP_SERVER_MAX_SUB, UDP_SERVER_MAX_SUB,
};
pub use error::DpmError;
pub use lifecycle::{Lifecycle, Request, RunStatus};
pub use link::Link;
pub use manager::SessionManager;
pub use secure::{
    ChannelTransport, DatagramTransport, HandshakeEngine, PskEngine, RecordTransport, SecureInfo,
    StreamTransport,
};
pub use state::{ManagerOptions, SessionDeps};
pub use subsession::{Admission, SubSessionInfo, SubSessionPool};
