//! Application hooks of the manager daemon.
//!
//! On cold boot the hooks configure sessions and user timers from the YAML file; on wake
//! the retained configuration is already in place and only the callbacks are installed
//! again. The first eight bytes of the user parameter block count wakes.

use dpm_control::{ControlManager, InitHandler};
use dpm_secure::{Endpoint, PskHandshake};
use dpm_session::{HandshakeEngine, PskEngine};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::DpmServiceConfig;

const APP: &str = "app";
const WAKE_COUNTER_LEN: usize = 8;

pub struct ManagerApp {
    config: DpmServiceConfig,
}

fn timer_fired(n: u8) {
    component_info!(APP, "User timer {} expired", n);
}

fn on_error(code: u32, message: &str) {
    component_error!(APP, "DPM error 0x{:02x}: {}", code, message);
}

fn on_connect(session: u8, peer: SocketAddr, sub: Option<usize>) {
    match sub {
        Some(sub) => component_info!(APP, "Session {} accepted {} on sub-session {}", session, peer, sub + 1),
        None => component_info!(APP, "Session {} connected to {}", session, peer),
    }
}

impl ManagerApp {
    pub fn new(config: DpmServiceConfig) -> Self {
        Self { config }
    }

    fn engine(&self) -> Result<Arc<dyn HandshakeEngine>, String> {
        let psk = self
            .config
            .psk
            .as_ref()
            .ok_or_else(|| "secure session configured without psk credentials".to_string())?;
        let handshake = PskHandshake::new(psk.identity.as_bytes(), psk.key.as_bytes(), psk.suite)
            .map_err(|e| format!("invalid psk credentials: {}", e))?;
        Ok(Arc::new(PskEngine::new(handshake)))
    }

    /// Callbacks of every configured session
    fn install(&self, control: &ControlManager) -> Result<(), String> {
        let sessions = control.sessions();
        sessions.set_error_handler(on_error);

        for config in sessions.configs().into_iter().filter(|c| c.kind.is_some()) {
            let id = config.id;
            sessions.set_connect_handler(id, on_connect).map_err(|e| e.to_string())?;

            let echo = self.config.echo.then(|| sessions.clone());
            sessions
                .set_receive_handler(id, move |session: u8, peer: SocketAddr, data: &[u8]| {
                    component_info!(APP, "Session {} received {} bytes from {}", session, data.len(), peer);
                    let Some(manager) = echo.clone() else {
                        return;
                    };
                    let data = data.to_vec();
                    tokio::spawn(async move {
                        if let Err(e) = manager.send_to_session(session, peer, &data).await {
                            component_warn!(APP, "Echo on session {} failed: {}", session, e);
                        }
                    });
                })
                .map_err(|e| e.to_string())?;

            if config.secure {
                let engine = self.engine()?;
                sessions
                    .set_secure_setup(
                        id,
                        move |_session: u8, _endpoint: Endpoint| -> Result<Arc<dyn HandshakeEngine>, String> {
                            Ok(engine.clone())
                        },
                    )
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

impl InitHandler for ManagerApp {
    fn on_boot(&self, control: &ControlManager) -> Result<(), String> {
        control
            .sessions()
            .configure(&self.config.sessions)
            .map_err(|e| e.to_string())?;
        self.install(control)?;

        for timer in &self.config.timers {
            control
                .set_timer(timer.id, timer.periodic, timer.interval_ms, timer_fired)
                .map_err(|e| e.to_string())?;
        }

        if self.config.user_params_size > 0 {
            control
                .save_user_params(&vec![0; self.config.user_params_size])
                .map_err(|e| e.to_string())?;
        }
        component_info!(
            APP,
            "Configured {} sessions and {} timers",
            self.config.sessions.len(),
            self.config.timers.len()
        );
        Ok(())
    }

    fn on_wake(&self, control: &ControlManager) -> Result<(), String> {
        self.install(control)?;
        for timer in &self.config.timers {
            control
                .bind_timer(timer.id, timer_fired)
                .map_err(|e| e.to_string())?;
        }

        let mut params = control.user_params();
        if params.len() >= WAKE_COUNTER_LEN {
            let mut counter = [0u8; WAKE_COUNTER_LEN];
            counter.copy_from_slice(&params[..WAKE_COUNTER_LEN]);
            let wakes = u64::from_le_bytes(counter).wrapping_add(1);
            params[..WAKE_COUNTER_LEN].copy_from_slice(&wakes.to_le_bytes());
            control.save_user_params(&params).map_err(|e| e.to_string())?;
            component_info!(APP, "Wake number {}", wakes);
        } else {
            component_debug!(APP, "No wake counter in {} bytes of user parameters", params.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerConfig;
    use dpm_control::{ControlOptions, StartPath};
    use dpm_power::{EventGroup, NullWatchdog, RtcTimerService, SleepGate};
    use dpm_retention::{MemoryRetention, RetentionStore};
    use dpm_secure::SessionCodec;
    use dpm_session::{ManagerOptions, SessionConfig, SessionDeps, SessionKind, SessionManager};

    fn control(store: Arc<dyn RetentionStore>, config: DpmServiceConfig) -> ControlManager {
        let sessions = SessionManager::new(
            SessionDeps {
                gate: Arc::new(SleepGate::new(true)),
                timers: Arc::new(RtcTimerService::new()),
                events: Arc::new(EventGroup::new()),
                codec: SessionCodec::new(store.clone(), true),
                watchdog: Arc::new(NullWatchdog),
            },
            ManagerOptions::default(),
        );
        let options = ControlOptions {
            user_params_size: config.user_params_size,
            expect_wake: false,
        };
        ControlManager::new(store, sessions, options).with_init_handler(ManagerApp::new(config))
    }

    fn udp_config() -> DpmServiceConfig {
        let mut session = SessionConfig::new(1);
        session.kind = Some(SessionKind::UdpClient);
        session.peer_addr = Some("127.0.0.1".parse().unwrap());
        session.peer_port = 9;
        DpmServiceConfig {
            enabled: true,
            user_params_size: 12,
            sessions: vec![session],
            timers: vec![TimerConfig {
                id: 2,
                periodic: true,
                interval_ms: 60_000,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wake_counts_in_user_params() {
        let store: Arc<dyn RetentionStore> = Arc::new(MemoryRetention::new(8192));

        let boot = control(store.clone(), udp_config());
        assert_eq!(boot.run().await.unwrap(), StartPath::ColdBoot);
        assert_eq!(boot.user_params(), vec![0; 12]);
        assert_eq!(boot.sessions().configs()[0].kind, Some(SessionKind::UdpClient));

        let wake = control(store.clone(), udp_config());
        assert_eq!(wake.run().await.unwrap(), StartPath::Wake);
        assert_eq!(&wake.user_params()[..8], &1u64.to_le_bytes());
    }

    #[tokio::test]
    async fn test_secure_session_needs_psk() {
        let mut config = udp_config();
        config.sessions[0].secure = true;
        let app = ManagerApp::new(config.clone());
        assert!(app.engine().is_err());

        config.psk = Some(crate::config::PskConfig {
            identity: "sensor-1".to_string(),
            key: "0123456789abcdef".to_string(),
            suite: 0x00A8,
        });
        assert!(ManagerApp::new(config).engine().is_ok());
    }
}
