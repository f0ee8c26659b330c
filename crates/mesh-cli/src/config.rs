//! Configuration system for the mesh server operator binary.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Mesh server configuration (§6.2 operator surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reject new sockets once this many connections are registered.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Base for the reader-idle timeout, which is `2 * connection_timeout`.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// How often an idle connection is sent a heartbeat.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Per-connection outbound queue capacity, in frames.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Tokio worker thread count (0 lets tokio pick the core count).
    #[serde(default)]
    pub worker_threads: usize,
    /// Token-bucket rate limit, requests per 60s window.
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            buffer_size: default_buffer_size(),
            worker_threads: 0,
            rate_limit_per_minute: default_rate_limit_per_minute(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_max_connections() -> usize {
    1000
}

fn default_connection_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    256
}

fn default_rate_limit_per_minute() -> u32 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path, `$XDG_CONFIG_HOME/mesh-server/config.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("mesh-server/config.toml")
    }

    /// Load config from the default path, or create a default one if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration, rejecting zero or absurd values.
    ///
    /// # Errors
    ///
    /// Returns an error if any field is out of its valid range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be nonzero");
        }

        if self.max_connections == 0 || self.max_connections > 1_000_000 {
            anyhow::bail!("max_connections must be between 1 and 1,000,000");
        }

        if self.connection_timeout_secs == 0 {
            anyhow::bail!("connection_timeout_secs must be nonzero");
        }

        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be nonzero");
        }

        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be nonzero");
        }

        if self.rate_limit_per_minute == 0 {
            anyhow::bail!("rate_limit_per_minute must be nonzero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7777);
        assert_eq!(config.rate_limit_per_minute, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.port, deserialized.port);
        assert_eq!(config.rate_limit_per_minute, deserialized.rate_limit_per_minute);
    }

    #[test]
    fn test_save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.port = 9999;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.port, 9999);
    }
}
