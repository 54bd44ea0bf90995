//! Configuration handling for the DPM manager.
//!
//! Settings come from the `dpm` section of a YAML file, then from `DPM_*`
//! environment variables, then from the command line.

use anyhow::{bail, Result};
use dpm_retention::{RetentionMode, DEFAULT_CAPACITY};
use dpm_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// DPM manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpmServiceConfig {
    /// DPM mode; off runs sessions without retention or sleep gating
    pub enabled: bool,
    /// Retention memory backend
    pub retention: RetentionConfig,
    /// Size of the retained user parameter block, 0 for none
    pub user_params_size: usize,
    /// Send every received payload back to its peer
    pub echo: bool,
    /// Pre-shared key of secure sessions
    pub psk: Option<PskConfig>,
    /// Sessions configured on cold boot
    pub sessions: Vec<SessionConfig>,
    /// User timers armed on cold boot
    pub timers: Vec<TimerConfig>,
}

/// Retention backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// `memory` or `file`
    pub mode: String,
    /// Image file of the `file` backend
    pub path: PathBuf,
    /// Pool size in bytes
    pub capacity: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            path: PathBuf::from("dpm-retention.img"),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl RetentionConfig {
    /// Backend selected by `mode`
    pub fn to_mode(&self) -> Result<RetentionMode> {
        match self.mode.as_str() {
            "memory" => Ok(RetentionMode::InMemory {
                capacity: self.capacity,
            }),
            "file" => Ok(RetentionMode::File {
                path: self.path.clone(),
                capacity: self.capacity,
            }),
            other => bail!("Invalid retention mode: {} (expected memory or file)", other),
        }
    }
}

/// Pre-shared key credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskConfig {
    /// PSK identity sent to the peer
    pub identity: String,
    /// Key material
    pub key: String,
    /// Cipher suite id
    #[serde(default = "default_psk_suite")]
    pub suite: u16,
}

fn default_psk_suite() -> u16 {
    0x00A8
}

/// One user timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Timer id (1..=4)
    pub id: u8,
    /// Re-arm after every expiry
    #[serde(default)]
    pub periodic: bool,
    /// Interval in milliseconds
    pub interval_ms: u64,
}

impl Default for DpmServiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention: RetentionConfig::default(),
            user_params_size: 0,
            echo: false,
            psk: None,
            sessions: Vec::new(),
            timers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RootConfig {
    dpm: Option<DpmServiceConfig>,
}

impl DpmServiceConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.dpm.unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.retention.to_mode()?;

        info!(
            "DPM configuration: enabled={}, retention={} ({} bytes), sessions={}, timers={}",
            config.enabled,
            config.retention.mode,
            config.retention.capacity,
            config.sessions.len(),
            config.timers.len()
        );
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(enabled) = lookup("DPM_ENABLED") {
            self.enabled = matches!(enabled.to_lowercase().as_str(), "1" | "true" | "yes");
            info!("DPM mode overridden by environment: {}", self.enabled);
        }
        if let Some(mode) = lookup("DPM_RETENTION_MODE") {
            info!("Retention mode overridden by environment: {}", mode);
            self.retention.mode = mode;
        }
        if let Some(path) = lookup("DPM_RETENTION_PATH") {
            info!("Retention path overridden by environment: {}", path);
            self.retention.path = PathBuf::from(path);
        }
        if let Some(capacity) = lookup("DPM_RETENTION_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(capacity) => {
                    self.retention.capacity = capacity;
                    info!("Retention capacity overridden by environment: {}", capacity);
                }
                Err(_) => warn!("Ignoring invalid DPM_RETENTION_CAPACITY: {}", capacity),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpm_session::SessionKind;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DpmServiceConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.retention.mode, "memory");
        assert_eq!(config.retention.capacity, DEFAULT_CAPACITY);
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
dpm:
  enabled: true
  retention:
    mode: file
    path: /tmp/dpm-test.img
    capacity: 8192
  user_params_size: 16
  psk:
    identity: sensor-1
    key: "0123456789abcdef"
  sessions:
    - id: 1
      kind: tcp_server
      local_port: 7000
      keepalive_ms: 30000
    - id: 2
      kind: udp_client
      peer_addr: 10.0.0.5
      peer_port: 5684
      secure: true
  timers:
    - id: 1
      periodic: true
      interval_ms: 60000
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = DpmServiceConfig::load_from_file(temp_file.path()).unwrap();

        assert!(config.enabled);
        assert_eq!(config.user_params_size, 16);
        assert_eq!(config.psk.as_ref().unwrap().suite, 0x00A8);
        assert_eq!(config.sessions.len(), 2);
        assert_eq!(config.sessions[0].kind, Some(SessionKind::TcpServer));
        assert_eq!(config.sessions[0].window_size, SessionConfig::default().window_size);
        assert!(config.sessions[1].secure);
        assert_eq!(config.sessions[1].peer().unwrap().to_string(), "10.0.0.5:5684");
        assert_eq!(config.timers[0].interval_ms, 60000);
        assert!(matches!(
            config.retention.to_mode().unwrap(),
            RetentionMode::File { capacity: 8192, .. }
        ));
    }

    #[test]
    fn test_unparsable_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"dpm: [not, a, map]").unwrap();
        let config = DpmServiceConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.sessions, Vec::new());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("DPM_ENABLED", "true"),
            ("DPM_RETENTION_MODE", "file"),
            ("DPM_RETENTION_PATH", "/var/lib/dpm.img"),
            ("DPM_RETENTION_CAPACITY", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = DpmServiceConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert!(config.enabled);
        assert_eq!(config.retention.path, PathBuf::from("/var/lib/dpm.img"));
        assert_eq!(config.retention.capacity, DEFAULT_CAPACITY);
        assert!(config.retention.to_mode().is_ok());
    }

    #[test]
    fn test_invalid_retention_mode() {
        let mut config = DpmServiceConfig::default();
        config.retention.mode = "flash".to_string();
        assert!(config.retention.to_mode().is_err());
    }
}
