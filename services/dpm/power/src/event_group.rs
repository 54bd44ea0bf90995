//! Event group shared between timer callbacks and the event manager.
//!
//! `set` never awaits, so it is safe from timer callbacks (the interrupt-context
//! equivalent); the event manager awaits with `wait_any`.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

bitflags! {
    /// Event bits dispatched by the event manager
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventBits: u32 {
        /// User timer 1
        const TIMER1 = 0x0001;
        /// User timer 2
        const TIMER2 = 0x0002;
        /// User timer 3
        const TIMER3 = 0x0004;
        /// User timer 4
        const TIMER4 = 0x0008;
        /// TCP server sub-session 1 keep-alive
        const TCP_SERVER_KA1 = 0x0010;
        /// TCP server sub-session 2 keep-alive
        const TCP_SERVER_KA2 = 0x0020;
        /// TCP server sub-session 3 keep-alive
        const TCP_SERVER_KA3 = 0x0040;
        /// TCP server sub-session 4 keep-alive
        const TCP_SERVER_KA4 = 0x0080;
        /// TCP client session 1 keep-alive
        const TCP_CLIENT_KA1 = 0x0100;
        /// TCP client session 2 keep-alive
        const TCP_CLIENT_KA2 = 0x0200;
        /// TCP client session 3 keep-alive
        const TCP_CLIENT_KA3 = 0x0400;
        /// TCP client session 4 keep-alive
        const TCP_CLIENT_KA4 = 0x0800;
        /// Every user timer bit
        const TIMERS = 0x000F;
        /// Every TCP server keep-alive bit
        const TCP_SERVER_KA = 0x00F0;
        /// Every TCP client keep-alive bit
        const TCP_CLIENT_KA = 0x0F00;
        /// Every dispatched bit
        const ALL = 0x0FFF;
    }
}

impl EventBits {
    /// Bit for user timer `n` (1..=4)
    pub fn timer(n: u8) -> Option<Self> {
        (1..=4).contains(&n).then(|| Self::from_bits_truncate(1 << (n - 1)))
    }

    /// Bit for TCP server sub-session `n` (1..=4)
    pub fn tcp_server_keepalive(n: u8) -> Option<Self> {
        (1..=4)
            .contains(&n)
            .then(|| Self::from_bits_truncate(0x10 << (n - 1)))
    }

    /// Bit for TCP client session `n` (1..=4)
    pub fn tcp_client_keepalive(n: u8) -> Option<Self> {
        (1..=4)
            .contains(&n)
            .then(|| Self::from_bits_truncate(0x100 << (n - 1)))
    }
}

/// Bitmask with async waiters
#[derive(Debug, Default)]
pub struct EventGroup {
    bits: AtomicU32,
    notify: Notify,
}

impl EventGroup {
    /// Create an empty event group
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bits and wake waiters; returns the bits now set
    pub fn set(&self, bits: EventBits) -> EventBits {
        let previous = self.bits.fetch_or(bits.bits(), Ordering::SeqCst);
        self.notify.notify_waiters();
        EventBits::from_bits_truncate(previous | bits.bits())
    }

    /// Clear bits; returns the bits that were set before clearing
    pub fn clear(&self, bits: EventBits) -> EventBits {
        let previous = self.bits.fetch_and(!bits.bits(), Ordering::SeqCst);
        EventBits::from_bits_truncate(previous)
    }

    /// Bits currently set
    pub fn get(&self) -> EventBits {
        EventBits::from_bits_truncate(self.bits.load(Ordering::SeqCst))
    }

    /// Wait until any bit in `mask` is set; returns the set bits within `mask` without clearing
    pub async fn wait_any(&self, mask: EventBits) -> EventBits {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.get() & mask;
            if !current.is_empty() {
                return current;
            }
            notified.await;
        }
    }

    /// `wait_any` bounded by `timeout`; `None` on timeout
    pub async fn wait_any_timeout(&self, mask: EventBits, timeout: Duration) -> Option<EventBits> {
        tokio::time::timeout(timeout, self.wait_any(mask)).await.ok()
    }
}
