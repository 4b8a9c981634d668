//! Broker configuration loaded from TOML.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fs, net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use tracing::warn;

/// Default config file looked up by the binary.
pub const DEFAULT_CONFIG_PATH: &str = "config/tether.toml";

/// Tunables for the broker and its socket runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name advertised to the directory link.
    pub server_name: String,
    /// Reliable (TCP) listen address.
    pub tcp_bind: SocketAddr,
    /// `None` disables the unreliable path.
    pub udp_bind: Option<SocketAddr>,
    /// Public address advertised alongside the bound one.
    pub external_address: Option<SocketAddr>,
    /// Reliable packets drained per peer per tick.
    pub max_packets_per_tick: usize,
    /// Largest accepted packet body in bytes.
    pub max_packet_size: u32,
    /// Largest frame sent as a datagram.
    pub max_datagram_size: usize,
    /// Eviction window before the handshake completes.
    pub handshake_timeout_ms: u64,
    /// Eviction window after the handshake.
    pub inactivity_timeout_ms: u64,
    /// Keep-alive cadence.
    pub keepalive_interval_ms: u64,
    /// Tick thread sleep when a tick did no work.
    pub idle_sleep_ms: u64,
    /// Length of one broadcast spam window.
    pub broadcast_window_ms: u64,
    /// Broadcasts allowed per window.
    pub broadcast_burst: u32,
    /// Dropped broadcasts before a kick (0 never kicks).
    pub broadcast_kick_threshold: u32,
    /// Serialize empty persistent channels to memory.
    pub hibernate_idle_channels: bool,
    /// Enables the filesystem file store and snapshot save/restore.
    pub data_dir: Option<PathBuf>,
    /// Snapshot cadence (0 disables autosave).
    pub autosave_interval_secs: u64,
    /// Seed admin passwords, merged with the stored admin list.
    pub admin_passwords: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_name: "Tether Server".to_string(),
            tcp_bind: SocketAddr::from(([0, 0, 0, 0], 5127)),
            udp_bind: Some(SocketAddr::from(([0, 0, 0, 0], 5128))),
            external_address: None,
            max_packets_per_tick: 64,
            max_packet_size: tether_net::DEFAULT_MAX_PACKET_SIZE,
            max_datagram_size: tether_net::MAX_DATAGRAM_SIZE,
            handshake_timeout_ms: 5_000,
            inactivity_timeout_ms: 60_000,
            keepalive_interval_ms: 5_000,
            idle_sleep_ms: 1,
            broadcast_window_ms: 1_000,
            broadcast_burst: 4,
            broadcast_kick_threshold: 16,
            hibernate_idle_channels: true,
            data_dir: None,
            autosave_interval_secs: 300,
            admin_passwords: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<BrokerConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    BrokerConfig::default()
                }
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!("Broker config not found at {}. Using defaults", path.display());
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                BrokerConfig::default()
            }
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Handshake eviction window.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Post-handshake eviction window.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Keep-alive cadence.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Idle tick sleep.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Broadcast spam window.
    pub fn broadcast_window(&self) -> Duration {
        Duration::from_millis(self.broadcast_window_ms)
    }

    /// `None` when autosave is disabled.
    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_secs > 0).then(|| Duration::from_secs(self.autosave_interval_secs))
    }
}
