//! Power-management primitives for DPM.
//!
//! Provides the readiness vote that gates deep power-down, RTC-style timers whose identity
//! survives a wake, the event group that timer callbacks post into, and the watchdog seam
//! used around long secure operations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod event_group;
pub mod rtc_timer;
pub mod sleep_gate;
pub mod watchdog;

pub use event_group::{EventBits, EventGroup};
pub use rtc_timer::{rtc_ticks, FIRST_DYNAMIC_ID, RtcTimerService, TimerCallback, TimerEntry, TimerError, TimerId};
pub use sleep_gate::{GateEntry, GateError, SleepGate, MAX_MODULES};
pub use watchdog::{guarded, NullWatchdog, SoftWatchdog, Watchdog};
