//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HOSTBRIDGE_CONFIG)
//! 3. Environment variables

use hostbridge_core::{BridgeConfig, TickBudget};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub dispatch: DispatchConfig,
    pub timeouts: TimeoutConfig,
    pub metrics: MetricsConfig,
    /// Settings of the bundled demo editor.
    pub editor: EditorConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HOSTBRIDGE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.dispatch.apply_env_overrides();
        self.timeouts.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Rejects values that would stall or disable the bridge.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.network.max_connections as u64, "network.max_connections"),
            (self.network.idle_timeout_secs, "network.idle_timeout_secs"),
            (self.dispatch.queue_capacity as u64, "dispatch.queue_capacity"),
            (self.dispatch.tick_command_budget as u64, "dispatch.tick_command_budget"),
            (self.dispatch.tick_time_budget_ms, "dispatch.tick_time_budget_ms"),
            (self.timeouts.command_timeout_ms, "timeouts.command_timeout_ms"),
            (self.timeouts.reload_timeout_secs, "timeouts.reload_timeout_secs"),
            (self.timeouts.sweep_interval_ms, "timeouts.sweep_interval_ms"),
            (self.editor.tick_interval_ms, "editor.tick_interval_ms"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Settings for the queue, dispatcher and reload bridge.
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            queue_capacity: self.dispatch.queue_capacity,
            budget: TickBudget {
                commands: self.dispatch.tick_command_budget,
                time: self.dispatch.tick_time_budget(),
            },
            command_timeout: self.timeouts.command_timeout(),
            reload_timeout: self.timeouts.reload_timeout(),
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], hostbridge_protocol::DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 64,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("HOSTBRIDGE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("HOSTBRIDGE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("HOSTBRIDGE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Command queue and host tick budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Commands buffered before clients get `ServerBusy`.
    pub queue_capacity: usize,
    /// Maximum commands executed per host tick.
    pub tick_command_budget: usize,
    /// Time budget per host tick in milliseconds.
    pub tick_time_budget_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            tick_command_budget: 64,
            tick_time_budget_ms: 8,
        }
    }
}

impl DispatchConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(cap) = std::env::var("HOSTBRIDGE_QUEUE_CAPACITY") {
            if let Ok(n) = cap.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(budget) = std::env::var("HOSTBRIDGE_TICK_BUDGET") {
            if let Ok(n) = budget.parse() {
                self.tick_command_budget = n;
            }
        }
    }

    pub fn tick_time_budget(&self) -> Duration {
        Duration::from_millis(self.tick_time_budget_ms)
    }
}

/// Request deadlines and background timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Deadline for an ordinary command, in milliseconds.
    pub command_timeout_ms: u64,
    /// Time the host has to report reload completion, in seconds.
    pub reload_timeout_secs: u64,
    /// Interval of the registry deadline sweep, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 30_000,
            reload_timeout_secs: 300,
            sweep_interval_ms: 250,
        }
    }
}

impl TimeoutConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("HOSTBRIDGE_COMMAND_TIMEOUT_MS") {
            if let Ok(n) = ms.parse() {
                self.command_timeout_ms = n;
            }
        }

        if let Ok(secs) = std::env::var("HOSTBRIDGE_RELOAD_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.reload_timeout_secs = n;
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9410)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("HOSTBRIDGE_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("HOSTBRIDGE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Demo editor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Interval between host ticks in milliseconds.
    pub tick_interval_ms: u64,
    /// How long the simulated compiler takes, in milliseconds.
    pub simulated_reload_ms: u64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            simulated_reload_ms: 3000,
        }
    }
}

impl EditorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn simulated_reload(&self) -> Duration {
        Duration::from_millis(self.simulated_reload_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serializes `SocketAddr` as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 7410);
        assert_eq!(config.network.max_connections, 64);
        assert_eq!(config.dispatch.queue_capacity, 1024);
        assert_eq!(config.timeouts.reload_timeout(), Duration::from_secs(300));
        assert_eq!(config.timeouts.sweep_interval(), Duration::from_millis(250));
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bridge_config() {
        let bridge = Config::default().bridge();
        assert_eq!(bridge.budget.commands, 64);
        assert_eq!(bridge.budget.time, Duration::from_millis(8));
        assert_eq!(bridge.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.metrics.bind_addr, config.metrics.bind_addr);
    }

    #[test]
    fn test_partial_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"127.0.0.1:9000\"\ndispatch:\n  queue_capacity: 8\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9000);
        assert_eq!(config.dispatch.queue_capacity, 8);
        // Unspecified fields keep their defaults
        assert_eq!(config.dispatch.tick_command_budget, 64);
        assert_eq!(config.network.idle_timeout_secs, 300);
    }

    #[test]
    fn test_invalid_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "network: [not, a, map]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/hostbridge.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = Config::default();
        config.dispatch.queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch.queue_capacity"));

        let mut config = Config::default();
        config.timeouts.sweep_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialized_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostbridge.yaml");

        let mut config = Config::default();
        config.timeouts.command_timeout_ms = 1234;
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.timeouts.command_timeout_ms, 1234);
    }
}
