//! Control layer for DPM.
//!
//! The control manager runs once per start and picks the cold-boot or wake path; the
//! event manager then dispatches user timer and keep-alive events for the lifetime of
//! the process.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod error;
pub mod event;
pub mod persist;
pub mod timers;

pub use control::{ControlManager, ControlOptions, DoneFlag, InitHandler, StartPath, CONTROL_MODULE};
pub use error::ControlError;
pub use event::{EventManager, DONE_POLL_COUNT, DONE_POLL_INTERVAL, EVENT_MODULE};
pub use persist::{PersistedConfig, UserTimer, CONFIG_SCHEMA, DPM_CONFIG_NAME, DPM_MAGIC, DPM_USER_PARAMS_NAME};
pub use timers::{timer_owner, TimerHandlers, UserTimers};
