//! Bounded per-peer sub-session pool of a server session.
//!
//! The pool is plain data; the owning session keeps it behind a mutex so slot
//! allocation, lookup and release are atomic with respect to the accept task and
//! the per-peer tasks.

use dpm_power::TimerId;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::{Lifecycle, RunStatus};
use crate::link::Link;
use crate::state::Activity;

/// One connected peer of a server session
#[derive(Debug)]
pub struct SubSession {
    /// Peer address
    pub peer: SocketAddr,
    /// RTC tick of the last send or receive
    pub last_access: u64,
    /// Status and request channel of the peer task
    pub lifecycle: Arc<Lifecycle>,
    pub(crate) link: Option<Arc<Link>>,
    pub(crate) activity: Arc<Activity>,
    pub(crate) inbox: Option<mpsc::Sender<Vec<u8>>>,
    pub(crate) keepalive: Option<TimerId>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl SubSession {
    /// New sub-session for `peer` last seen at `now`
    pub fn new(peer: SocketAddr, now: u64) -> Self {
        Self {
            peer,
            last_access: now,
            lifecycle: Arc::new(Lifecycle::new()),
            link: None,
            activity: Arc::new(Activity::default()),
            inbox: None,
            keepalive: None,
            task: None,
        }
    }
}

/// Where a new peer goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Peer already owns this slot
    Existing(usize),
    /// Free slot
    Vacant(usize),
    /// Pool full; this slot has the oldest access time
    Evict(usize),
    /// Nothing can be evicted
    Queue,
}

/// Status line of one occupied slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubSessionInfo {
    /// Slot index
    pub index: usize,
    /// Peer address
    pub peer: SocketAddr,
    /// RTC tick of the last access
    pub last_access: u64,
    /// Run status
    pub status: RunStatus,
}

/// Fixed-capacity pool of sub-sessions keyed by peer address
#[derive(Debug)]
pub struct SubSessionPool {
    slots: Vec<Option<SubSession>>,
}

impl SubSessionPool {
    /// Empty pool with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// No slot occupied
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot owned by `peer`
    pub fn find(&self, peer: SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(sub) if sub.peer == peer))
    }

    /// Lowest free slot
    pub fn vacant(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Occupied slot with the smallest access time; ties go to the lowest index
    pub fn oldest(&self) -> Option<usize> {
        self.iter()
            .min_by_key(|(index, sub)| (sub.last_access, *index))
            .map(|(index, _)| index)
    }

    /// Decide where `peer` goes
    pub fn admit(&self, peer: SocketAddr) -> Admission {
        if let Some(index) = self.find(peer) {
            return Admission::Existing(index);
        }
        if let Some(index) = self.vacant() {
            return Admission::Vacant(index);
        }
        self.oldest().map_or(Admission::Queue, Admission::Evict)
    }

    /// Put `sub` into a free slot; an occupied slot is left alone
    pub fn occupy(&mut self, index: usize, sub: SubSession) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(sub);
                true
            }
            _ => false,
        }
    }

    /// Free `index` if `peer` still owns it
    pub fn release(&mut self, index: usize, peer: SocketAddr) -> Option<SubSession> {
        let owned = matches!(self.slots.get(index), Some(Some(sub)) if sub.peer == peer);
        if owned {
            self.slots[index].take()
        } else {
            None
        }
    }

    /// Record an access at `now`
    pub fn touch(&mut self, index: usize, now: u64) {
        if let Some(Some(sub)) = self.slots.get_mut(index) {
            sub.last_access = now;
        }
    }

    /// Sub-session in `index`
    pub fn get(&self, index: usize) -> Option<&SubSession> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Mutable sub-session in `index`
    pub fn get_mut(&mut self, index: usize) -> Option<&mut SubSession> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &SubSession)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|sub| (index, sub)))
    }

    /// Status lines of the occupied slots
    pub fn report(&self) -> Vec<SubSessionInfo> {
        self.iter()
            .map(|(index, sub)| SubSessionInfo {
                index,
                peer: sub.peer,
                last_access: sub.last_access,
                status: sub.lifecycle.status(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 0, 10], port))
    }

    #[test]
    fn test_distinct_peers_get_distinct_slots() {
        let mut pool = SubSessionPool::new(2);
        for (port, expected) in [(1000, 0), (1001, 1)] {
            let admission = pool.admit(peer(port));
            assert_eq!(admission, Admission::Vacant(expected));
            assert!(pool.occupy(expected, SubSession::new(peer(port), 10)));
        }
        // Same address and port map back to the same slot
        assert_eq!(pool.admit(peer(1001)), Admission::Existing(1));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_eviction_picks_oldest_regardless_of_index() {
        let mut pool = SubSessionPool::new(2);
        pool.occupy(0, SubSession::new(peer(1), 100));
        pool.occupy(1, SubSession::new(peer(2), 50));
        assert_eq!(pool.admit(peer(3)), Admission::Evict(1));

        pool.touch(1, 200);
        assert_eq!(pool.admit(peer(3)), Admission::Evict(0));

        let evicted = pool.release(0, peer(1)).unwrap();
        assert_eq!(evicted.peer, peer(1));
        assert_eq!(pool.admit(peer(3)), Admission::Vacant(0));
    }

    #[test]
    fn test_release_requires_owner() {
        let mut pool = SubSessionPool::new(1);
        pool.occupy(0, SubSession::new(peer(1), 0));
        assert!(!pool.occupy(0, SubSession::new(peer(2), 0)));
        assert!(pool.release(0, peer(2)).is_none());
        assert!(pool.release(0, peer(1)).is_some());
        assert!(pool.is_empty());
        assert!(pool.release(5, peer(1)).is_none());
    }

    #[test]
    fn test_empty_pool_queues() {
        let pool = SubSessionPool::new(0);
        assert_eq!(pool.admit(peer(1)), Admission::Queue);
    }

    #[test]
    fn test_report() {
        let mut pool = SubSessionPool::new(2);
        pool.occupy(1, SubSession::new(peer(7), 42));
        let report = pool.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].index, 1);
        assert_eq!(report[0].status, RunStatus::ReadyToCreate);
    }
}
