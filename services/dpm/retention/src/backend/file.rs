//! File image retention backend.
//!
//! The pool lives in memory and is mirrored to a single image file after every mutation,
//! so a restarted process finds the same blobs a woken device would. Each record carries
//! a CRC; a record that fails its check is dropped, like retention lost on an abnormal wake.

use crate::backend::mem::MemoryRetention;
use crate::{BlobInfo, RetentionError, RetentionStore};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// "DPMR"
const IMAGE_MAGIC: u32 = 0x524D_5044;
const IMAGE_VERSION: u8 = 1;

/// Image file header
#[derive(Debug)]
struct ImageHeader {
    magic: u32,
    version: u8,
    count: u32,
}

impl ImageHeader {
    const SIZE: usize = 4 + 1 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u32_le(self.count);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, RetentionError> {
        if buf.remaining() < Self::SIZE {
            return Err(RetentionError::Corruption("incomplete image header".to_string()));
        }

        let header = Self {
            magic: buf.get_u32_le(),
            version: buf.get_u8(),
            count: buf.get_u32_le(),
        };

        if header.magic != IMAGE_MAGIC {
            return Err(RetentionError::Corruption(format!(
                "bad image magic 0x{:08x}",
                header.magic
            )));
        }
        if header.version != IMAGE_VERSION {
            return Err(RetentionError::Corruption(format!(
                "unsupported image version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

fn record_crc(name: &[u8], bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(name);
    hasher.update(bytes);
    hasher.finalize()
}

/// Retention pool persisted to an image file
pub struct FileRetention {
    mem: MemoryRetention,
    path: PathBuf,
    /// Serializes image rewrites
    flush_lock: Mutex<()>,
}

impl FileRetention {
    /// Open the image at `path`, creating an empty pool if it does not exist
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, RetentionError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            mem: MemoryRetention::new(capacity),
            path,
            flush_lock: Mutex::new(()),
        };

        if store.path.exists() {
            let loaded = store.load()?;
            info!(
                "Loaded retention image {:?}: {} blobs, {} bytes used",
                store.path,
                loaded,
                store.mem.used()
            );
        } else {
            debug!("No retention image at {:?}, starting empty", store.path);
        }

        Ok(store)
    }

    /// Image file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<usize, RetentionError> {
        let mut buf = Bytes::from(fs::read(&self.path)?);

        let header = match ImageHeader::decode(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("Discarding retention image {:?}: {}", self.path, e);
                return Ok(0);
            }
        };

        let mut loaded = 0;
        for index in 0..header.count {
            if buf.remaining() < 1 {
                warn!("Retention image truncated at record {}", index);
                break;
            }
            let name_len = buf.get_u8() as usize;
            if buf.remaining() < name_len + 8 {
                warn!("Retention image truncated at record {}", index);
                break;
            }
            let name = buf.copy_to_bytes(name_len);
            let size = buf.get_u32_le() as usize;
            let crc = buf.get_u32_le();
            if buf.remaining() < size {
                warn!("Retention image truncated at record {}", index);
                break;
            }
            let bytes = buf.copy_to_bytes(size);

            let name = match std::str::from_utf8(&name) {
                Ok(name) => name.to_string(),
                Err(_) => {
                    warn!("Dropping retention record {} with non-UTF-8 name", index);
                    continue;
                }
            };

            if record_crc(name.as_bytes(), &bytes) != crc {
                warn!("Dropping retention record {}: checksum mismatch", name);
                continue;
            }

            if let Err(e) = self
                .mem
                .allocate(&name, size)
                .and_then(|_| self.mem.write(&name, 0, &bytes))
            {
                warn!("Dropping retention record {}: {}", name, e);
                continue;
            }
            loaded += 1;
        }

        Ok(loaded)
    }

    fn flush(&self) -> Result<(), RetentionError> {
        let _guard = self.flush_lock.lock().unwrap_or_else(|e| e.into_inner());

        let names = self.mem.names();
        let mut buf = BytesMut::with_capacity(ImageHeader::SIZE + self.mem.used());
        ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            count: names.len() as u32,
        }
        .encode(&mut buf);

        for BlobInfo { name, .. } in &names {
            let Some(bytes) = self.mem.get(name) else {
                continue;
            };
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
            buf.put_u32_le(bytes.len() as u32);
            buf.put_u32_le(record_crc(name.as_bytes(), &bytes));
            buf.put_slice(&bytes);
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Retention image flushed: {} blobs, {} bytes", names.len(), buf.len());
        Ok(())
    }

    fn flushed<T>(&self, result: Result<T, RetentionError>) -> Result<T, RetentionError> {
        let value = result?;
        if let Err(e) = self.flush() {
            error!("Failed to flush retention image {:?}: {}", self.path, e);
            return Err(e);
        }
        Ok(value)
    }
}

impl RetentionStore for FileRetention {
    fn allocate(&self, name: &str, size: usize) -> Result<(), RetentionError> {
        self.flushed(self.mem.allocate(name, size))
    }

    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.mem.get(name)
    }

    fn read(&self, name: &str, offset: usize, len: usize) -> Result<Vec<u8>, RetentionError> {
        self.mem.read(name, offset, len)
    }

    fn size_of(&self, name: &str) -> Option<usize> {
        self.mem.size_of(name)
    }

    fn write(&self, name: &str, offset: usize, bytes: &[u8]) -> Result<(), RetentionError> {
        self.flushed(self.mem.write(name, offset, bytes))
    }

    fn release(&self, name: &str) -> Result<(), RetentionError> {
        self.flushed(self.mem.release(name))
    }

    fn names(&self) -> Vec<BlobInfo> {
        self.mem.names()
    }

    fn used(&self) -> usize {
        self.mem.used()
    }

    fn capacity(&self) -> usize {
        self.mem.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_image_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("retention.img");

        {
            let store = FileRetention::open(&path, 4096).unwrap();
            store.store("DPM_CONFIG", b"session table").unwrap();
            store.store("DPM_USER_PARAMS", &[7u8; 12]).unwrap();
            store.store("scratch", &[1u8; 4]).unwrap();
            store.release("scratch").unwrap();
        }

        let store = FileRetention::open(&path, 4096).unwrap();
        assert_eq!(store.get("DPM_CONFIG").unwrap(), b"session table".to_vec());
        assert_eq!(store.get("DPM_USER_PARAMS").unwrap(), vec![7u8; 12]);
        assert!(store.get("scratch").is_none());
        assert_eq!(store.names().len(), 2);
    }

    #[test]
    fn test_corrupted_record_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("retention.img");

        {
            let store = FileRetention::open(&path, 4096).unwrap();
            store.store("a", &[0x11; 8]).unwrap();
            store.store("b", &[0x22; 8]).unwrap();
        }

        // Flip the last payload byte, which belongs to record "b"
        let mut image = fs::read(&path).unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        fs::write(&path, image).unwrap();

        let store = FileRetention::open(&path, 4096).unwrap();
        assert_eq!(store.get("a").unwrap(), vec![0x11; 8]);
        assert!(store.get("b").is_none());
    }

    #[test]
    fn test_garbage_image_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("retention.img");
        fs::write(&path, b"not an image").unwrap();

        let store = FileRetention::open(&path, 4096).unwrap();
        assert!(store.names().is_empty());
        assert_eq!(store.used(), 0);
    }
}
