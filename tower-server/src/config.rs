//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use tower_core::BootstrapConfig;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `TOWER_BIND_PORT`
    pub bind_port: u16,

    /// Port the upstream PCM producer connects to.
    /// Override: `TOWER_PCM_INGEST_PORT`
    pub pcm_ingest_port: u16,

    /// Grace window (seconds) of silence covering a brief upstream gap
    /// before falling through to the fallback source.
    /// Override: `TOWER_GRACE_SECONDS`
    pub grace_seconds: u64,

    /// Slow-listener eviction threshold (ms of no forward progress).
    /// Override: `TOWER_CLIENT_TIMEOUT_MS`
    pub client_timeout_ms: u64,

    /// Hard timeout (ms) waiting for the encoder's first MP3 frame.
    /// Override: `TOWER_ENCODER_STARTUP_TIMEOUT_MS`
    pub encoder_startup_timeout_ms: u64,

    /// Post-startup stall threshold (ms) before the encoder is restarted.
    /// Override: `TOWER_ENCODER_STALL_THRESHOLD_MS`
    pub encoder_stall_threshold_ms: u64,

    /// Cap on consecutive restart attempts before declaring `Failed`.
    /// Override: `TOWER_ENCODER_MAX_RESTARTS`
    pub encoder_max_restarts: u32,

    /// Exponential backoff schedule (seconds) between restart attempts.
    /// YAML only — no single env var maps cleanly onto a list.
    pub encoder_backoff_schedule_secs: Vec<u64>,

    /// Whether the encoder subprocess is started at all.
    /// Override: `TOWER_ENCODER_ENABLED`
    pub encoder_enabled: bool,

    /// Escape hatch for integration tests that need a live subprocess
    /// without flipping `encoder_enabled` globally in non-test config.
    /// Override: `TOWER_ALLOW_SUBPROCESS_IN_TESTS`
    pub allow_subprocess_in_tests: bool,

    /// Path to the encoder executable.
    /// Override: `TOWER_ENCODER_PATH`
    pub encoder_path: String,

    /// Path to a pre-decoded canonical-PCM file used as the file-tier
    /// fallback source. `None` skips straight to the tone tier.
    /// Override: `TOWER_FALLBACK_FILE_PATH`
    pub fallback_file_path: Option<PathBuf>,

    /// Fallback tone frequency (Hz).
    /// Override: `TOWER_TONE_FREQUENCY_HZ`
    pub tone_frequency_hz: f32,

    /// Encoder output bitrate (kbps).
    /// Override: `TOWER_BITRATE_KBPS`
    pub bitrate_kbps: u32,

    /// PCM ingest ring capacity (frames).
    /// Override: `TOWER_PCM_RING_CAPACITY`
    pub pcm_ring_capacity: usize,

    /// MP3 output ring capacity (frames).
    /// Override: `TOWER_MP3_RING_CAPACITY`
    pub mp3_ring_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 9090,
            pcm_ingest_port: 9091,
            grace_seconds: 5,
            client_timeout_ms: 250,
            encoder_startup_timeout_ms: 1500,
            encoder_stall_threshold_ms: 2000,
            encoder_max_restarts: 5,
            encoder_backoff_schedule_secs: vec![1, 2, 4, 8, 10],
            encoder_enabled: true,
            allow_subprocess_in_tests: false,
            encoder_path: "lame".to_string(),
            fallback_file_path: None,
            tone_frequency_hz: 440.0,
            bitrate_kbps: 128,
            pcm_ring_capacity: 256,
            mp3_ring_capacity: 512,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TOWER_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        if let Ok(val) = std::env::var("TOWER_PCM_INGEST_PORT") {
            if let Ok(port) = val.parse() {
                self.pcm_ingest_port = port;
            }
        }
        if let Ok(val) = std::env::var("TOWER_GRACE_SECONDS") {
            if let Ok(secs) = val.parse() {
                self.grace_seconds = secs;
            }
        }
        if let Ok(val) = std::env::var("TOWER_CLIENT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.client_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("TOWER_ENCODER_STARTUP_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.encoder_startup_timeout_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("TOWER_ENCODER_STALL_THRESHOLD_MS") {
            if let Ok(ms) = val.parse() {
                self.encoder_stall_threshold_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("TOWER_ENCODER_MAX_RESTARTS") {
            if let Ok(n) = val.parse() {
                self.encoder_max_restarts = n;
            }
        }
        if let Ok(val) = std::env::var("TOWER_ENCODER_ENABLED") {
            if let Ok(b) = val.parse() {
                self.encoder_enabled = b;
            }
        }
        if let Ok(val) = std::env::var("TOWER_ALLOW_SUBPROCESS_IN_TESTS") {
            if let Ok(b) = val.parse() {
                self.allow_subprocess_in_tests = b;
            }
        }
        if let Ok(val) = std::env::var("TOWER_ENCODER_PATH") {
            self.encoder_path = val;
        }
        if let Ok(val) = std::env::var("TOWER_FALLBACK_FILE_PATH") {
            self.fallback_file_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("TOWER_TONE_FREQUENCY_HZ") {
            if let Ok(hz) = val.parse() {
                self.tone_frequency_hz = hz;
            }
        }
        if let Ok(val) = std::env::var("TOWER_BITRATE_KBPS") {
            if let Ok(kbps) = val.parse() {
                self.bitrate_kbps = kbps;
            }
        }
        if let Ok(val) = std::env::var("TOWER_PCM_RING_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.pcm_ring_capacity = n;
            }
        }
        if let Ok(val) = std::env::var("TOWER_MP3_RING_CAPACITY") {
            if let Ok(n) = val.parse() {
                self.mp3_ring_capacity = n;
            }
        }
    }

    /// HTTP bind address, loopback-agnostic (binds all interfaces).
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.bind_port))
    }

    /// PCM ingest bind address.
    pub fn pcm_ingest_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.pcm_ingest_port))
    }

    /// Converts to `tower-core`'s `BootstrapConfig`, loading the fallback
    /// file from disk if one is configured.
    pub fn to_bootstrap_config(&self) -> Result<BootstrapConfig> {
        let fallback_file_pcm = match &self.fallback_file_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read fallback file: {}", path.display()))?,
            ),
            None => None,
        };

        Ok(BootstrapConfig {
            pcm_ring_capacity: self.pcm_ring_capacity,
            mp3_ring_capacity: self.mp3_ring_capacity,
            grace: Duration::from_secs(self.grace_seconds),
            client_timeout: Duration::from_millis(self.client_timeout_ms),
            bitrate_kbps: self.bitrate_kbps,
            encoder_path: self.encoder_path.clone(),
            encoder_startup_timeout: Duration::from_millis(self.encoder_startup_timeout_ms),
            encoder_stall_threshold: Duration::from_millis(self.encoder_stall_threshold_ms),
            encoder_max_restarts: self.encoder_max_restarts,
            encoder_backoff_schedule: self
                .encoder_backoff_schedule_secs
                .iter()
                .map(|secs| Duration::from_secs(*secs))
                .collect(),
            encoder_enabled: self.encoder_enabled,
            allow_subprocess_in_tests: self.allow_subprocess_in_tests,
            fallback_file_pcm,
            tone_frequency_hz: self.tone_frequency_hz,
            pcm_ingest_addr: self.pcm_ingest_addr(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec_table() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_port, 9090);
        assert_eq!(config.pcm_ingest_port, 9091);
        assert_eq!(config.grace_seconds, 5);
        assert_eq!(config.encoder_max_restarts, 5);
        assert_eq!(config.encoder_backoff_schedule_secs, vec![1, 2, 4, 8, 10]);
        assert!(config.encoder_enabled);
        assert!(!config.allow_subprocess_in_tests);
    }

    #[test]
    fn bind_addr_and_ingest_addr_use_configured_ports() {
        let mut config = ServerConfig::default();
        config.bind_port = 7000;
        config.pcm_ingest_port = 7001;
        assert_eq!(config.bind_addr().port(), 7000);
        assert_eq!(config.pcm_ingest_addr().port(), 7001);
    }

    #[test]
    fn to_bootstrap_config_reads_fallback_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let pcm = vec![3u8; 4096];
        file.write_all(&pcm).unwrap();

        let mut config = ServerConfig::default();
        config.fallback_file_path = Some(file.path().to_path_buf());

        let bootstrap_config = config.to_bootstrap_config().unwrap();
        assert_eq!(bootstrap_config.fallback_file_pcm, Some(pcm));
    }

    #[test]
    fn to_bootstrap_config_with_no_fallback_file_is_none() {
        let config = ServerConfig::default();
        let bootstrap_config = config.to_bootstrap_config().unwrap();
        assert_eq!(bootstrap_config.fallback_file_pcm, None);
    }
}
