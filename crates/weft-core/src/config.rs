//! Configuration for the weft fabric daemon.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WEFT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/weft/config.toml
//!   3. ~/.config/weft/config.toml

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host name used in the local-access policy and in DNS-SD records.
    /// Empty = resolve the OS hostname at startup.
    pub host: String,
    /// TCP port for the localhost WebSocket listener.
    /// Out-of-range values fall back to 9009.
    pub local_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Enable mDNS advertise/browse. Disabled fabrics still accept dials.
    pub enabled: bool,
    /// Seconds between browse sweeps.
    pub interval_secs: u64,
    /// Seconds each sweep collects responses.
    pub timeout_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            local_port: 9009,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 10,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FabricConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FabricConfig::default()
        };
        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WEFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply WEFT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEFT_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Ok(v) = std::env::var("WEFT_NETWORK__LOCAL_PORT") {
            if let Ok(p) = v.parse() {
                self.network.local_port = p;
            }
        }
        if let Ok(v) = std::env::var("WEFT_DISCOVERY__ENABLED") {
            self.discovery.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("WEFT_DISCOVERY__INTERVAL_SECS") {
            if let Ok(s) = v.parse() {
                self.discovery.interval_secs = s;
            }
        }
        if let Ok(v) = std::env::var("WEFT_DISCOVERY__TIMEOUT_SECS") {
            if let Ok(s) = v.parse() {
                self.discovery.timeout_secs = s;
            }
        }
    }

    /// Clamp values the listeners cannot serve on.
    pub fn normalize(&mut self) {
        if self.network.local_port <= 1024 || self.network.local_port >= 65534 {
            self.network.local_port = 9009;
        }
        if self.discovery.interval_secs == 0 {
            self.discovery.interval_secs = 10;
        }
        if self.discovery.timeout_secs == 0 {
            self.discovery.timeout_secs = self.discovery.interval_secs;
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("weft")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_serve_on_9009_with_discovery_on() {
        let config = FabricConfig::default();
        assert_eq!(config.network.local_port, 9009);
        assert!(config.discovery.enabled);
        assert_eq!(config.discovery.interval_secs, 10);
        assert_eq!(config.discovery.timeout_secs, 10);
    }

    #[test]
    fn normalize_rejects_privileged_ports() {
        let mut config = FabricConfig::default();
        config.network.local_port = 80;
        config.normalize();
        assert_eq!(config.network.local_port, 9009);

        config.network.local_port = 65535;
        config.normalize();
        assert_eq!(config.network.local_port, 9009);
    }

    #[test]
    fn normalize_backfills_timeout_from_interval() {
        let mut config = FabricConfig::default();
        config.discovery.interval_secs = 5;
        config.discovery.timeout_secs = 0;
        config.normalize();
        assert_eq!(config.discovery.timeout_secs, 5);
    }

    #[test]
    fn config_file_round_trips() {
        let config = FabricConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: FabricConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.local_port, config.network.local_port);
        assert_eq!(parsed.discovery.interval_secs, config.discovery.interval_secs);
    }
}
