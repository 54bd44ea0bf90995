//! The `DPM_CONFIG` retention blob.
//!
//! Session and user timer configuration is encoded as CBOR behind a magic and a schema
//! tag, so a wake only trusts a blob written by a compatible build.

use dpm_retention::RetentionStore;
use dpm_session::SessionConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ControlError;

/// Retention blob holding the persisted configuration
pub const DPM_CONFIG_NAME: &str = "DPM_CONFIG";
/// Retention blob holding the application's opaque parameters
pub const DPM_USER_PARAMS_NAME: &str = "DPM_USER_PARAMS";
/// Magic of a valid configuration blob
pub const DPM_MAGIC: u32 = 0xDEAD_BEAF;
/// Layout version of the configuration blob
pub const CONFIG_SCHEMA: u16 = 1;

/// Persisted user timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTimer {
    /// Timer id (1..=4)
    pub id: u8,
    /// Re-arms after firing
    pub periodic: bool,
    /// Interval in milliseconds
    pub interval_ms: u64,
}

/// Everything a wake needs to rebuild the session layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    /// Always [`DPM_MAGIC`] for a valid blob
    pub magic: u32,
    /// Always [`CONFIG_SCHEMA`] for a blob this build can read
    pub schema: u16,
    /// Session configuration
    pub sessions: Vec<SessionConfig>,
    /// Armed user timers
    pub timers: Vec<UserTimer>,
    /// Size of the user parameter blob
    pub user_params_size: usize,
}

impl PersistedConfig {
    /// Configuration stamped with the current magic and schema
    pub fn new(sessions: Vec<SessionConfig>, timers: Vec<UserTimer>, user_params_size: usize) -> Self {
        Self {
            magic: DPM_MAGIC,
            schema: CONFIG_SCHEMA,
            sessions,
            timers,
            user_params_size,
        }
    }

    /// CBOR encoding
    pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ControlError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode and check magic and schema
    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        let config: Self =
            ciborium::from_reader(bytes).map_err(|e| ControlError::Decode(e.to_string()))?;
        if config.magic != DPM_MAGIC {
            return Err(ControlError::BadMagic(config.magic));
        }
        if config.schema != CONFIG_SCHEMA {
            return Err(ControlError::SchemaMismatch {
                found: config.schema,
                expected: CONFIG_SCHEMA,
            });
        }
        Ok(config)
    }

    /// Write the blob, resizing it when the encoding changed length
    pub fn save(&self, store: &dyn RetentionStore) -> Result<(), ControlError> {
        let bytes = self.encode()?;
        let allocation = store.store(DPM_CONFIG_NAME, &bytes)?;
        debug!("{} saved ({} bytes, {:?})", DPM_CONFIG_NAME, bytes.len(), allocation);
        Ok(())
    }

    /// Read the blob. A blob that fails to decode is released so the next boot starts
    /// clean; `None` means cold boot.
    pub fn load(store: &dyn RetentionStore) -> Option<Self> {
        let bytes = store.get(DPM_CONFIG_NAME)?;
        match Self::decode(&bytes) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("{} is invalid, dropping it: {}", DPM_CONFIG_NAME, e);
                if let Err(e) = store.release(DPM_CONFIG_NAME) {
                    warn!("Release of {} failed: {}", DPM_CONFIG_NAME, e);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpm_retention::MemoryRetention;
    use dpm_session::SessionKind;

    fn sample() -> PersistedConfig {
        let mut session = SessionConfig::new(1);
        session.kind = Some(SessionKind::TcpServer);
        session.local_port = 9000;
        session.secure = true;
        PersistedConfig::new(
            vec![session],
            vec![UserTimer {
                id: 2,
                periodic: true,
                interval_ms: 60_000,
            }],
            64,
        )
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryRetention::new(4096);
        assert!(PersistedConfig::load(&store).is_none());

        let config = sample();
        config.save(&store).unwrap();
        assert_eq!(PersistedConfig::load(&store).unwrap(), config);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut config = sample();
        config.magic = 0x1234_5678;
        let bytes = config.encode().unwrap();
        assert!(matches!(
            PersistedConfig::decode(&bytes),
            Err(ControlError::BadMagic(0x1234_5678))
        ));

        let mut config = sample();
        config.schema = CONFIG_SCHEMA + 1;
        let bytes = config.encode().unwrap();
        assert!(matches!(
            PersistedConfig::decode(&bytes),
            Err(ControlError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_blob_released() {
        let store = MemoryRetention::new(4096);
        store.store(DPM_CONFIG_NAME, &[0xFF; 12]).unwrap();
        assert!(PersistedConfig::load(&store).is_none());
        assert!(store.size_of(DPM_CONFIG_NAME).is_none());
    }
}
