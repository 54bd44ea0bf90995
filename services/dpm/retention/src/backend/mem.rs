//! In-memory retention backend

use crate::{charge_for, validate_name, BlobInfo, RetentionError, RetentionStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// In-memory retention pool
pub struct MemoryRetention {
    /// Blob name -> contents
    blobs: Arc<DashMap<String, Vec<u8>>>,
    /// Bytes charged to the pool
    used: AtomicUsize,
    capacity: usize,
}

impl MemoryRetention {
    /// Create an empty pool of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            blobs: Arc::new(DashMap::new()),
            used: AtomicUsize::new(0),
            capacity,
        }
    }

    fn reserve(&self, charge: usize) -> Result<(), RetentionError> {
        let capacity = self.capacity;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used + charge <= capacity).then_some(used + charge)
            })
            .map(|_| ())
            .map_err(|used| RetentionError::Exhausted {
                requested: charge,
                available: capacity.saturating_sub(used),
            })
    }

    fn refund(&self, charge: usize) {
        self.used.fetch_sub(charge, Ordering::SeqCst);
    }
}

fn check_bounds(offset: usize, len: usize, size: usize) -> Result<(), RetentionError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RetentionError::OutOfBounds { offset, len, size }),
    }
}

impl RetentionStore for MemoryRetention {
    fn allocate(&self, name: &str, size: usize) -> Result<(), RetentionError> {
        validate_name(name)?;

        match self.blobs.entry(name.to_string()) {
            Entry::Occupied(existing) => Err(RetentionError::Duplicated {
                name: name.to_string(),
                size: existing.get().len(),
            }),
            Entry::Vacant(slot) => {
                self.reserve(charge_for(size))?;
                slot.insert(vec![0u8; size]);
                debug!("Retention allocate name={} size={}", name, size);
                Ok(())
            }
        }
    }

    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.get(name).map(|blob| blob.clone())
    }

    fn read(&self, name: &str, offset: usize, len: usize) -> Result<Vec<u8>, RetentionError> {
        let blob = self
            .blobs
            .get(name)
            .ok_or_else(|| RetentionError::NotFound(name.to_string()))?;
        check_bounds(offset, len, blob.len())?;
        Ok(blob[offset..offset + len].to_vec())
    }

    fn size_of(&self, name: &str) -> Option<usize> {
        self.blobs.get(name).map(|blob| blob.len())
    }

    fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> Result<(), RetentionError> {
        let mut blob = self
            .blobs
            .get_mut(name)
            .ok_or_else(|| RetentionError::NotFound(name.to_string()))?;
        check_bounds(offset, bytes.len(), blob.len())?;
        blob[offset..offset + bytes.len()].copy_from_slice(bytes);
        debug!(
            "Retention write name={} offset={} len={}",
            name,
            offset,
            bytes.len()
        );
        Ok(())
    }

    fn release(&self, name: &str) -> Result<(), RetentionError> {
        let (_, blob) = self
            .blobs
            .remove(name)
            .ok_or_else(|| RetentionError::NotFound(name.to_string()))?;
        self.refund(charge_for(blob.len()));
        debug!("Retention release name={} size={}", name, blob.len());
        Ok(())
    }

    fn names(&self) -> Vec<BlobInfo> {
        let mut names: Vec<BlobInfo> = self
            .blobs
            .iter()
            .map(|entry| BlobInfo {
                name: entry.key().clone(),
                size: entry.value().len(),
            })
            .collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));
        names
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
