//! Application configuration
//!
//! Loaded from `walkie.toml` in the platform config directory (or an explicit
//! path). A missing file means defaults.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "walkie.toml";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub relay: RelayConfig,
    pub session: SessionConfig,
}

/// UDP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the host binds its relay socket to
    pub bind_address: IpAddr,
    /// Well-known port shared by host and clients
    pub udp_port: u16,
    /// Largest datagram sent or accepted
    pub max_datagram_size: usize,
    /// Requested kernel send/receive buffer size
    pub socket_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port: DEFAULT_UDP_PORT,
            max_datagram_size: MAX_PACKET_SIZE,
            socket_buffer_size: SOCKET_BUFFER_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Local address the relay socket binds to
    pub fn relay_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.udp_port)
    }
}

/// Audio device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Duration of one captured chunk
    pub frame_size_ms: u32,
    /// Stream buffers hold this many platform-minimum buffers
    pub buffer_multiplier: usize,
    /// Pause after device start before the first capture
    pub warmup_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size_ms: DEFAULT_FRAME_SIZE_MS,
            buffer_multiplier: BUFFER_MULTIPLIER,
            warmup_ms: DEFAULT_WARMUP_MS,
        }
    }
}

impl AudioConfig {
    /// Samples in one captured chunk
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u64 * self.frame_size_ms as u64 / 1000) as usize
    }

    /// Bytes in one captured chunk
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_frame() * BYTES_PER_SAMPLE
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_size_ms as u64)
    }

    /// Delay between capture-loop iterations.
    ///
    /// Capture itself blocks until a chunk is ready, so this only bounds CPU
    /// use; half a frame keeps the loop ahead of the capture rate.
    pub fn pacing_delay(&self) -> Duration {
        self.frame_duration() / 2
    }

    /// How long a single capture call may block
    pub fn capture_timeout(&self) -> Duration {
        self.frame_duration() * 4
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }
}

/// Host-side relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Forget peers not heard from for this long. Unset keeps every peer for
    /// the lifetime of the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_idle_timeout_secs: Option<u64>,
    /// Minimum spacing between idle sweeps
    pub eviction_sweep_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peer_idle_timeout_secs: None,
            eviction_sweep_secs: 1,
        }
    }
}

impl RelayConfig {
    pub fn peer_idle_timeout(&self) -> Option<Duration> {
        self.peer_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn eviction_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_sweep_secs)
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on waiting for a loop to exit during stop
    pub stop_grace_ms: u64,
    /// Poll interval of the route monitor
    pub route_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: 500,
            route_poll_ms: 2000,
        }
    }
}

impl SessionConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn route_poll_interval(&self) -> Duration {
        Duration::from_millis(self.route_poll_ms)
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => {
                    tracing::info!("No config directory available, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            tracing::info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `<config dir>/walkie.toml` for this platform
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "limemarmalade", "walkie-talkie")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if audio.frame_bytes() == 0 {
            return Err(Error::Config(format!(
                "frame_size_ms {} yields an empty frame at {} Hz",
                audio.frame_size_ms, audio.sample_rate
            )));
        }
        if audio.buffer_multiplier == 0 {
            return Err(Error::Config("buffer_multiplier must be at least 1".into()));
        }
        if self.network.max_datagram_size > MAX_UDP_PAYLOAD {
            return Err(Error::Config(format!(
                "max_datagram_size {} exceeds the UDP limit of {}",
                self.network.max_datagram_size, MAX_UDP_PAYLOAD
            )));
        }
        if audio.frame_bytes() > self.network.max_datagram_size {
            return Err(Error::Config(format!(
                "a {} ms frame is {} bytes, larger than max_datagram_size {}",
                audio.frame_size_ms,
                audio.frame_bytes(),
                self.network.max_datagram_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.frame_bytes(), 640);
        assert_eq!(config.audio.pacing_delay(), Duration::from_millis(10));
        assert_eq!(config.network.udp_port, DEFAULT_UDP_PORT);
        assert!(config.relay.peer_idle_timeout().is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [network]
            udp_port = 6000

            [relay]
            peer_idle_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.network.udp_port, 6000);
        assert_eq!(config.network.max_datagram_size, MAX_PACKET_SIZE);
        assert_eq!(config.relay.peer_idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.audio.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_frame_larger_than_datagram_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [audio]
            frame_size_ms = 500
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("walkie-config-does-not-exist.toml");
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.audio.frame_size_ms, DEFAULT_FRAME_SIZE_MS);
    }

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir()
            .join(format!("walkie-config-{}", std::process::id()))
            .join(CONFIG_FILE_NAME);
        let mut config = AppConfig::default();
        config.audio.warmup_ms = 250;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.audio.warmup_ms, 250);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
