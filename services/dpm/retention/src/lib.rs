//! Retention memory for DPM: capacity-bounded named blobs.
//!
//! Retention memory is the small always-powered region that survives deep power-down.
//! This crate models it as a key->bytes map with a fixed byte budget and deterministic
//! reuse rules, with an in-memory backend and a file image backend that outlives the
//! process (the host-side stand-in for a power cycle).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Longest accepted blob name in bytes
pub const MAX_NAME_LEN: usize = 32;

/// Bookkeeping bytes charged to the pool for every blob
pub const BLOB_HEADER_BYTES: usize = 16;

/// Default pool size (16 KiB)
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Bytes a blob of `size` consumes from the pool, header included, 4-byte aligned.
pub fn charge_for(size: usize) -> usize {
    (size + BLOB_HEADER_BYTES + 3) & !3
}

/// Retention errors
#[derive(Error, Debug)]
pub enum RetentionError {
    /// A blob already exists under this name
    #[error("blob {name} already allocated ({size} bytes)")]
    Duplicated {
        /// Blob name
        name: String,
        /// Size of the existing blob
        size: usize,
    },
    /// No blob under this name
    #[error("blob {0} not found")]
    NotFound(String),
    /// The pool cannot hold the requested blob
    #[error("retention pool exhausted: requested {requested} bytes, {available} available")]
    Exhausted {
        /// Bytes the allocation would charge
        requested: usize,
        /// Bytes left in the pool
        available: usize,
    },
    /// Access outside the blob bounds
    #[error("access out of bounds: offset {offset} + {len} > size {size}")]
    OutOfBounds {
        /// Requested offset
        offset: usize,
        /// Requested length
        len: usize,
        /// Blob size
        size: usize,
    },
    /// Name is empty or too long
    #[error("invalid blob name: {0:?}")]
    InvalidName(String),
    /// I/O error from the image backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Image corruption
    #[error("corruption: {0}")]
    Corruption(String),
}

/// Name and size of a stored blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    /// Blob name
    pub name: String,
    /// Blob size in bytes
    pub size: usize,
}

impl fmt::Display for BlobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.size)
    }
}

/// How [`RetentionStore::ensure`] satisfied a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// No blob existed; a zeroed one was allocated
    Fresh,
    /// A blob of the same size existed and is reused in place
    Reused,
    /// A blob of a different size was released and reallocated zeroed
    Resized,
}

/// Named-blob allocator over retention memory.
///
/// Operations are synchronous: retention memory is plain memory and callers include
/// timer callbacks that must not await.
pub trait RetentionStore: Send + Sync {
    /// Allocate a zero-filled blob. Fails with `Duplicated` if the name is taken.
    fn allocate(&self, name: &str, size: usize) -> Result<(), RetentionError>;

    /// Copy of the blob contents
    fn get(&self, name: &str) -> Option<Vec<u8>>;

    /// Copy of `len` bytes at `offset`
    fn read(&self, name: &str, offset: usize, len: usize) -> Result<Vec<u8>, RetentionError>;

    /// Size of the blob, if present
    fn size_of(&self, name: &str) -> Option<usize>;

    /// Write `bytes` at `offset` inside an allocated blob
    fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> Result<(), RetentionError>;

    /// Release the blob and return its bytes to the pool
    fn release(&self, name: &str) -> Result<(), RetentionError>;

    /// All blobs, sorted by name
    fn names(&self) -> Vec<BlobInfo>;

    /// Bytes charged to the pool
    fn used(&self) -> usize;

    /// Pool size in bytes
    fn capacity(&self) -> usize;

    /// Bytes still available
    fn available(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Make sure a blob of exactly `size` bytes exists under `name`.
    ///
    /// Same name and size reuses the blob in place; a different size releases the old
    /// blob first so none of its content stays reachable.
    fn ensure(&self, name: &str, size: usize) -> Result<Allocation, RetentionError> {
        match self.size_of(name) {
            Some(existing) if existing == size => Ok(Allocation::Reused),
            Some(_) => {
                self.release(name)?;
                self.allocate(name, size)?;
                Ok(Allocation::Resized)
            }
            None => {
                self.allocate(name, size)?;
                Ok(Allocation::Fresh)
            }
        }
    }

    /// Ensure a blob sized for `bytes` and write them at offset 0
    fn store(&self, name: &str, bytes: &[u8]) -> Result<Allocation, RetentionError> {
        let allocation = self.ensure(name, bytes.len())?;
        self.write(name, 0, bytes)?;
        Ok(allocation)
    }
}

/// Check a blob name against the naming rules
pub fn validate_name(name: &str) -> Result<(), RetentionError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(RetentionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Retention backend configuration
#[derive(Clone, Debug)]
pub enum RetentionMode {
    /// Lost when the process exits
    InMemory {
        /// Pool size in bytes
        capacity: usize,
    },
    /// Mirrored to an image file after every mutation
    File {
        /// Image file path
        path: PathBuf,
        /// Pool size in bytes
        capacity: usize,
    },
}

impl Default for RetentionMode {
    fn default() -> Self {
        RetentionMode::InMemory {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

// Re-export backend implementations
pub use backend::file::FileRetention;
pub use backend::mem::MemoryRetention;

/// Open a store for the configured mode
pub fn open_store(mode: RetentionMode) -> Result<Arc<dyn RetentionStore>, RetentionError> {
    match mode {
        RetentionMode::InMemory { capacity } => Ok(Arc::new(MemoryRetention::new(capacity))),
        RetentionMode::File { path, capacity } => Ok(Arc::new(FileRetention::open(path, capacity)?)),
    }
}
