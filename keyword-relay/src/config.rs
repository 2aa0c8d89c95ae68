/// Relay configuration
///
/// Loaded from a JSON file and/or environment variables, validated before the
/// detector is built.

use crate::format::AudioFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default named pipe the producer writes into
pub const DEFAULT_FIFO_PATH: &str = "/tmp/kwd-relay.fifo";

/// Scratch buffer size for a single source read
pub const DEFAULT_READ_CHUNK_BYTES: usize = 1024;

/// Single-sample silence writes injected when the source stalls
pub const DEFAULT_KEEP_ALIVE_WRITES: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Bounded exponential backoff applied after open, reopen and read failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failure
    pub initial_ms: u64,

    /// Upper bound for the delay
    pub max_ms: u64,

    /// Growth factor between consecutive failures
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after `failures` consecutive failures (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(32) as i32;
        let delay_ms = (self.initial_ms as f64) * self.multiplier.powi(exponent);
        Duration::from_millis(delay_ms.min(self.max_ms as f64) as u64)
    }
}

/// Configuration for the keyword relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Path of the named pipe the producer writes into
    pub fifo_path: PathBuf,

    /// Nominal time slice relayed per iteration
    pub ms_to_push_per_iteration: u64,

    /// Bytes requested from the source per read
    pub read_chunk_bytes: usize,

    /// Zero samples written to the buffer when the source stalls
    pub keep_alive_writes: usize,

    /// Send a `StreamClosed` state notification on stall
    pub notify_stream_closed: bool,

    /// Capacity of the in-memory shared buffer, in seconds of audio
    pub buffer_capacity_secs: u32,

    /// Format delivered by the producer
    pub audio_format: AudioFormat,

    /// Retry pacing for failing I/O
    pub backoff: BackoffConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fifo_path: PathBuf::from(DEFAULT_FIFO_PATH),
            ms_to_push_per_iteration: 10,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            keep_alive_writes: DEFAULT_KEEP_ALIVE_WRITES,
            notify_stream_closed: false,
            buffer_capacity_secs: 15,
            audio_format: AudioFormat::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&raw)?;
        debug!("Loaded relay config from {}", path.display());
        Ok(config)
    }

    /// Apply `KWD_*` environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(path) = lookup("KWD_FIFO_PATH") {
            self.fifo_path = PathBuf::from(path);
        }

        if let Some(value) = lookup("KWD_MS_TO_PUSH") {
            self.ms_to_push_per_iteration = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "KWD_MS_TO_PUSH",
                value,
            })?;
        }

        if let Some(value) = lookup("KWD_KEEP_ALIVE_WRITES") {
            self.keep_alive_writes = value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: "KWD_KEEP_ALIVE_WRITES",
                value,
            })?;
        }

        if let Some(value) = lookup("KWD_NOTIFY_STREAM_CLOSED") {
            self.notify_stream_closed = match value.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "KWD_NOTIFY_STREAM_CLOSED",
                        value,
                    })
                }
            };
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_bytes < 2 {
            return Err(ConfigError::Invalid(
                "read_chunk_bytes must hold at least one 16-bit sample".to_string(),
            ));
        }

        if self.ms_to_push_per_iteration == 0 {
            return Err(ConfigError::Invalid(
                "ms_to_push_per_iteration must be greater than 0".to_string(),
            ));
        }

        if self.buffer_capacity_secs == 0 {
            return Err(ConfigError::Invalid(
                "buffer_capacity_secs must be greater than 0".to_string(),
            ));
        }

        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "backoff.multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(
                "backoff.initial_ms must not exceed backoff.max_ms".to_string(),
            ));
        }

        if self.fifo_path.as_os_str().is_empty() {
            warn!("fifo_path is empty; only injected sources will work");
        }

        Ok(())
    }

    /// Nominal samples per relay iteration for `format`
    ///
    /// Reads are sized by `read_chunk_bytes`, so this is a batch hint only.
    pub fn max_samples_per_push(&self, format: &AudioFormat) -> usize {
        format.samples_per_ms() * self.ms_to_push_per_iteration as usize
    }

    /// Shared buffer capacity in samples for `format`
    pub fn buffer_capacity_samples(&self, format: &AudioFormat) -> usize {
        format.sample_rate_hz as usize * self.buffer_capacity_secs as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.read_chunk_bytes, 1024);
        assert_eq!(config.keep_alive_writes, 4096);
        assert!(!config.notify_stream_closed);
    }

    #[test]
    fn test_max_samples_per_push() {
        let config = RelayConfig {
            ms_to_push_per_iteration: 10,
            ..Default::default()
        };
        let format = AudioFormat::default();

        assert_eq!(config.max_samples_per_push(&format), 160);
    }

    #[test]
    fn test_config_validation() {
        let mut config = RelayConfig::default();

        config.read_chunk_bytes = 1;
        assert!(config.validate().is_err());
        config.read_chunk_bytes = 1024;

        config.ms_to_push_per_iteration = 0;
        assert!(config.validate().is_err());
        config.ms_to_push_per_iteration = 10;

        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());
        config.backoff.multiplier = 2.0;

        config.backoff.initial_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            initial_ms: 10,
            max_ms: 100,
            multiplier: 2.0,
        };

        assert_eq!(backoff.delay_for(0), Duration::ZERO);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(20));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(80));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(500), Duration::from_millis(100));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"fifo_path": "/tmp/other.fifo", "keep_alive_writes": 16}}"#).unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.fifo_path, PathBuf::from("/tmp/other.fifo"));
        assert_eq!(config.keep_alive_writes, 16);
        assert_eq!(config.read_chunk_bytes, DEFAULT_READ_CHUNK_BYTES);
    }

    #[test]
    fn test_from_file_missing() {
        let result = RelayConfig::from_file("/nonexistent/kwd-relay.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("KWD_FIFO_PATH", "/run/audio.fifo"),
            ("KWD_MS_TO_PUSH", "20"),
            ("KWD_NOTIFY_STREAM_CLOSED", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.fifo_path, PathBuf::from("/run/audio.fifo"));
        assert_eq!(config.ms_to_push_per_iteration, 20);
        assert!(config.notify_stream_closed);
        assert_eq!(config.keep_alive_writes, DEFAULT_KEEP_ALIVE_WRITES);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = RelayConfig::default();
        let result = config.apply_vars(|name| {
            (name == "KWD_KEEP_ALIVE_WRITES").then(|| "lots".to_string())
        });

        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv { var: "KWD_KEEP_ALIVE_WRITES", .. })
        ));
    }
}
