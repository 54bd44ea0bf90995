//! Sleep gate: per-module readiness vote for deep power-down.
//!
//! Every module that must not be interrupted by power-down registers once and gets a bit.
//! Sleep is permitted only when every registered bit is set; the decision is a pure AND
//! so the order in which modules report ready never matters.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maximum number of registered modules
pub const MAX_MODULES: usize = 64;

/// Sleep gate errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GateError {
    /// Module was never registered
    #[error("module {0} is not registered")]
    NotRegistered(String),
    /// All bits are taken
    #[error("no free sleep gate bit ({0} modules registered)")]
    Exhausted(usize),
    /// Empty module name
    #[error("invalid module name {0:?}")]
    InvalidName(String),
}

/// Registration record for one module
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GateEntry {
    /// Module name
    pub name: String,
    /// Bit index in the readiness mask
    pub bit: u8,
    /// Module reached a quiescent point
    pub ready: bool,
    /// Local port whose traffic belongs to this module
    pub port: Option<u16>,
    /// Module finished its post-wake initialization
    pub wakeup_done: bool,
    /// Module is ready to receive data after wake
    pub receive_ready: bool,
}

#[derive(Default)]
struct GateInner {
    modules: HashMap<String, GateEntry>,
    registered: u64,
    ready: u64,
}

impl GateInner {
    fn permitted(&self) -> bool {
        self.ready & self.registered == self.registered
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut GateEntry, GateError> {
        self.modules
            .get_mut(name)
            .ok_or_else(|| GateError::NotRegistered(name.to_string()))
    }
}

/// Readiness vote across modules
pub struct SleepGate {
    enabled: bool,
    inner: Mutex<GateInner>,
    permitted_tx: watch::Sender<bool>,
}

impl SleepGate {
    /// Create a gate; a disabled gate accepts every call and never permits sleep
    pub fn new(enabled: bool) -> Self {
        let (permitted_tx, _) = watch::channel(false);
        Self {
            enabled,
            inner: Mutex::new(GateInner::default()),
            permitted_tx,
        }
    }

    /// Gate for a device that does not use deep-sleep mode
    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Whether deep-sleep gating is active
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &GateInner) {
        let permitted = self.enabled && inner.permitted();
        self.permitted_tx.send_if_modified(|current| {
            if *current != permitted {
                *current = permitted;
                true
            } else {
                false
            }
        });
    }

    /// Register a module and return its bit.
    ///
    /// Registering an existing name returns the bit it already holds and updates the port.
    /// New modules start not ready. Returns `None` when the gate is disabled.
    pub fn register(&self, name: &str, port: Option<u16>) -> Result<Option<u8>, GateError> {
        if !self.enabled {
            return Ok(None);
        }
        if name.is_empty() {
            return Err(GateError::InvalidName(name.to_string()));
        }

        let mut inner = self.lock();
        if let Some(entry) = inner.modules.get_mut(name) {
            if port.is_some() {
                entry.port = port;
            }
            return Ok(Some(entry.bit));
        }

        let free = !inner.registered;
        if free == 0 {
            return Err(GateError::Exhausted(inner.modules.len()));
        }
        let bit = free.trailing_zeros() as u8;

        inner.registered |= 1u64 << bit;
        inner.ready &= !(1u64 << bit);
        inner.modules.insert(
            name.to_string(),
            GateEntry {
                name: name.to_string(),
                bit,
                ready: false,
                port,
                wakeup_done: false,
                receive_ready: false,
            },
        );
        info!("Sleep gate registered module={} bit={} port={:?}", name, bit, port);
        self.publish(&inner);
        Ok(Some(bit))
    }

    /// Remove a module; its bit no longer takes part in the vote
    pub fn unregister(&self, name: &str) -> Result<(), GateError> {
        if !self.enabled {
            return Ok(());
        }

        let mut inner = self.lock();
        let entry = inner
            .modules
            .remove(name)
            .ok_or_else(|| GateError::NotRegistered(name.to_string()))?;
        inner.registered &= !(1u64 << entry.bit);
        inner.ready &= !(1u64 << entry.bit);
        info!("Sleep gate unregistered module={} bit={}", name, entry.bit);
        self.publish(&inner);
        Ok(())
    }

    fn set_bit(&self, name: &str, ready: bool) -> Result<(), GateError> {
        if !self.enabled {
            return Ok(());
        }

        let mut inner = self.lock();
        let entry = inner.entry_mut(name)?;
        entry.ready = ready;
        let mask = 1u64 << entry.bit;
        if ready {
            inner.ready |= mask;
        } else {
            inner.ready &= !mask;
        }
        debug!("Sleep gate module={} ready={}", name, ready);
        self.publish(&inner);
        Ok(())
    }

    /// Module reached a quiescent point
    pub fn set_ready(&self, name: &str) -> Result<(), GateError> {
        self.set_bit(name, true)
    }

    /// Module entered a section that must not be interrupted by power-down
    pub fn clear_ready(&self, name: &str) -> Result<(), GateError> {
        self.set_bit(name, false)
    }

    /// Ready bit of a module
    pub fn is_ready(&self, name: &str) -> Option<bool> {
        self.lock().modules.get(name).map(|entry| entry.ready)
    }

    /// True when every registered module is ready
    pub fn sleep_permitted(&self) -> bool {
        self.enabled && self.lock().permitted()
    }

    /// Module owning traffic on a local port
    pub fn module_for_port(&self, port: u16) -> Option<String> {
        self.lock()
            .modules
            .values()
            .find(|entry| entry.port == Some(port))
            .map(|entry| entry.name.clone())
    }

    /// Record that a module finished its post-wake initialization
    pub fn mark_wakeup_done(&self, name: &str) -> Result<(), GateError> {
        if !self.enabled {
            return Ok(());
        }
        self.lock().entry_mut(name)?.wakeup_done = true;
        Ok(())
    }

    /// Whether a module finished its post-wake initialization
    pub fn is_wakeup_done(&self, name: &str) -> bool {
        self.lock()
            .modules
            .get(name)
            .map(|entry| entry.wakeup_done)
            .unwrap_or(false)
    }

    /// Record that a module can receive data after wake
    pub fn set_receive_ready(&self, name: &str) -> Result<(), GateError> {
        if !self.enabled {
            return Ok(());
        }
        let mut inner = self.lock();
        match inner.modules.get_mut(name) {
            Some(entry) => {
                entry.receive_ready = true;
                Ok(())
            }
            None => {
                warn!("Receive-ready for unknown module {}", name);
                Err(GateError::NotRegistered(name.to_string()))
            }
        }
    }

    /// Snapshot of all registrations, ordered by bit
    pub fn entries(&self) -> Vec<GateEntry> {
        let mut entries: Vec<GateEntry> = self.lock().modules.values().cloned().collect();
        entries.sort_by_key(|entry| entry.bit);
        entries
    }

    /// Watch the sleep-permitted decision
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.permitted_tx.subscribe()
    }
}

impl Default for SleepGate {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let gate = SleepGate::new(true);

        let a = gate.register("tcp_cnt1", Some(10192)).unwrap();
        let b = gate.register("udp_svr3", None).unwrap();
        assert_eq!(a, Some(0));
        assert_eq!(b, Some(1));

        assert_eq!(gate.register("tcp_cnt1", None).unwrap(), Some(0));
        assert_eq!(gate.entries().len(), 2);
        assert_eq!(gate.module_for_port(10192).as_deref(), Some("tcp_cnt1"));
    }

    #[test]
    fn test_pure_and_over_all_orders() {
        let names = ["tcp_cnt1", "tcp_srv2_1", "dpm_control"];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for subset in 0u8..8 {
            for order in &orders {
                let gate = SleepGate::new(true);
                for name in names {
                    gate.register(name, None).unwrap();
                }
                // Start all ready, then clear the modules outside the subset
                for &i in order {
                    gate.set_ready(names[i]).unwrap();
                }
                for &i in order {
                    if subset & (1 << i) == 0 {
                        gate.clear_ready(names[i]).unwrap();
                    }
                }
                assert_eq!(gate.sleep_permitted(), subset == 0b111, "subset {:03b}", subset);

                // Interleaved: each module toggles while the others sit mid-transition
                let gate = SleepGate::new(true);
                for name in names {
                    gate.register(name, None).unwrap();
                }
                let mut ready = [false; 3];
                for &i in order.iter().chain(order.iter()) {
                    gate.set_ready(names[i]).unwrap();
                    ready[i] = true;
                    assert_eq!(gate.sleep_permitted(), ready.iter().all(|&r| r));
                    if subset & (1 << i) == 0 {
                        gate.clear_ready(names[i]).unwrap();
                        ready[i] = false;
                        assert!(!gate.sleep_permitted());
                    }
                }
                assert_eq!(gate.sleep_permitted(), subset == 0b111, "subset {:03b}", subset);
            }
        }
    }

    #[test]
    fn test_unregister_drops_vote() {
        let gate = SleepGate::new(true);
        gate.register("tcp_srv2", Some(7000)).unwrap();
        gate.register("dpm_event", None).unwrap();
        gate.set_ready("dpm_event").unwrap();
        assert!(!gate.sleep_permitted());

        gate.unregister("tcp_srv2").unwrap();
        assert!(gate.sleep_permitted());

        // The freed bit is handed out again
        assert_eq!(gate.register("udp_cnt3", None).unwrap(), Some(0));
        assert!(!gate.sleep_permitted());
    }

    #[test]
    fn test_disabled_gate_is_noop() {
        let gate = SleepGate::disabled();
        assert_eq!(gate.register("tcp_cnt1", None).unwrap(), None);
        gate.set_ready("tcp_cnt1").unwrap();
        gate.clear_ready("udp_svr4").unwrap();
        assert!(!gate.sleep_permitted());
        assert!(gate.entries().is_empty());
    }

    #[test]
    fn test_unknown_module_rejected() {
        let gate = SleepGate::new(true);
        assert_eq!(
            gate.set_ready("tcp_srv1_1"),
            Err(GateError::NotRegistered("tcp_srv1_1".to_string()))
        );
    }

    #[test]
    fn test_bit_exhaustion() {
        let gate = SleepGate::new(true);
        for i in 0..MAX_MODULES {
            gate.register(&format!("tcp_srv1_{}", i + 1), None).unwrap();
        }
        assert_eq!(
            gate.register("udp_svr2_1", None),
            Err(GateError::Exhausted(MAX_MODULES))
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_decision() {
        let gate = SleepGate::new(true);
        let mut rx = gate.subscribe();
        gate.register("udp_cnt2", None).unwrap();
        assert!(!*rx.borrow());

        gate.set_ready("udp_cnt2").unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        gate.clear_ready("udp_cnt2").unwrap();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
