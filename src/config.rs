use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Upper bound for session and ban timeouts (one year)
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 3600;

/// Main configuration for the stratum proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Pool name reported to the state sink
    pub name: String,
    pub stratum: Vec<EndpointConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            stratum: vec![EndpointConfig::default()],
            policy: PolicyConfig::default(),
            broadcast: BroadcastConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Production configuration: two difficulty tiers and strict policy
    pub fn production() -> Self {
        Self {
            name: "main".to_string(),
            stratum: vec![
                EndpointConfig {
                    name: "low".to_string(),
                    listen: "0.0.0.0:8008".to_string(),
                    max_conn: 8192,
                    timeout_secs: 120,
                    difficulty: 2_000_000_000,
                },
                EndpointConfig {
                    name: "high".to_string(),
                    listen: "0.0.0.0:8009".to_string(),
                    max_conn: 8192,
                    timeout_secs: 120,
                    difficulty: 8_000_000_000,
                },
            ],
            policy: PolicyConfig::production(),
            broadcast: BroadcastConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }

    /// Development configuration bound to localhost with relaxed policy
    pub fn development() -> Self {
        Self {
            name: "dev".to_string(),
            stratum: vec![EndpointConfig {
                listen: "127.0.0.1:8008".to_string(),
                max_conn: 64,
                timeout_secs: 30,
                difficulty: 100,
                ..Default::default()
            }],
            policy: PolicyConfig::development(),
            broadcast: BroadcastConfig {
                refresh_interval_ms: 500,
                ..Default::default()
            },
            protocol: ProtocolConfig::default(),
        }
    }

    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let config_str = std::fs::read_to_string(path)?;
        let mut config: ProxyConfig = toml::from_str(&config_str)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ProxyError> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("STRATUM_PROXY_NAME") {
            self.name = name;
        }

        // Only the first endpoint can be retargeted from the environment
        if let Some(endpoint) = self.stratum.first_mut() {
            if let Ok(listen) = std::env::var("STRATUM_PROXY_LISTEN") {
                endpoint.listen = listen;
            }
            if let Ok(max_conn) = std::env::var("STRATUM_PROXY_MAX_CONN") {
                if let Ok(max_conn) = max_conn.parse::<usize>() {
                    endpoint.max_conn = max_conn;
                }
            }
        }

        if let Ok(enabled) = std::env::var("STRATUM_PROXY_POLICY_ENABLED") {
            self.policy.enabled = enabled.to_lowercase() == "true";
        }

        if let Ok(concurrency) = std::env::var("STRATUM_PROXY_BROADCAST_CONCURRENCY") {
            if let Ok(concurrency) = concurrency.parse::<usize>() {
                self.broadcast.concurrency = concurrency;
            }
        }
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Pool name must not be empty".to_string());
        }
        if self.stratum.is_empty() {
            return Err("At least one stratum endpoint must be configured".to_string());
        }

        let mut names = HashSet::new();
        let mut listens = HashSet::new();
        for endpoint in &self.stratum {
            endpoint.validate()?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(format!("Duplicate stratum endpoint name '{}'", endpoint.name));
            }
            if !listens.insert(endpoint.listen.as_str()) {
                return Err(format!("Duplicate stratum listen address '{}'", endpoint.listen));
            }
        }

        self.policy.validate()?;
        self.broadcast.validate()?;
        Ok(())
    }
}

/// One listening stratum surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub listen: String,
    pub max_conn: usize,
    /// Idle timeout; a session with no activity for this long is dropped
    pub timeout_secs: u64,
    /// Fixed share difficulty handed to every miner on this endpoint
    pub difficulty: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "stratum".to_string(),
            listen: "0.0.0.0:8008".to_string(),
            max_conn: 8192,
            timeout_secs: 120,
            difficulty: 2_000_000_000,
        }
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Stratum endpoint name must not be empty".to_string());
        }
        if self.listen.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid listen address '{}' for endpoint '{}'",
                self.listen, self.name
            ));
        }
        if self.max_conn == 0 {
            return Err(format!("max_conn must be greater than 0 for endpoint '{}'", self.name));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(format!(
                "timeout_secs must be between 1 and {} for endpoint '{}'",
                MAX_TIMEOUT_SECS, self.name
            ));
        }
        if self.difficulty == 0 {
            return Err(format!("difficulty must be greater than 0 for endpoint '{}'", self.name));
        }
        Ok(())
    }
}

/// Ban and connection-rate policy for the built-in policy server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub ban_timeout_secs: u64,
    /// Connections allowed per IP between resets
    pub connection_limit: u32,
    /// No connection limits are enforced this long after startup
    pub connection_grace_secs: u64,
    pub limit_reset_secs: u64,
    /// Malformed requests tolerated before an IP is banned
    pub malformed_limit: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ban_timeout_secs: 1800, // 30 minutes
            connection_limit: 30,
            connection_grace_secs: 300,
            limit_reset_secs: 60,
            malformed_limit: 5,
        }
    }
}

impl PolicyConfig {
    pub fn production() -> Self {
        Self {
            ban_timeout_secs: 3600,
            connection_limit: 20,
            ..Default::default()
        }
    }

    pub fn development() -> Self {
        Self {
            ban_timeout_secs: 60,
            connection_limit: 1000,
            connection_grace_secs: 0,
            malformed_limit: 50,
            ..Default::default()
        }
    }

    pub fn ban_timeout(&self) -> Duration {
        Duration::from_secs(self.ban_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.limit_reset_secs == 0 {
            return Err("limit_reset_secs must be greater than 0".to_string());
        }
        if self.enabled && self.malformed_limit == 0 {
            return Err("malformed_limit must be greater than 0".to_string());
        }
        if self.ban_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(format!("ban_timeout_secs must not exceed {}", MAX_TIMEOUT_SECS));
        }
        Ok(())
    }
}

/// Job fan-out tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Maximum concurrent job pushes per broadcast
    pub concurrency: usize,
    /// How often the template source is polled for a new job
    pub refresh_interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            concurrency: 1024,
            refresh_interval_ms: 120,
        }
    }
}

impl BroadcastConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("Broadcast concurrency must be greater than 0".to_string());
        }
        if self.refresh_interval_ms == 0 {
            return Err("Broadcast refresh interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Wire dialect switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Attach `"id":0` to job notifications; Claymore rejects notifications without it
    pub notification_id_placeholder: bool,
    /// Drop the connection after answering an unknown method
    pub close_on_unknown_method: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            notification_id_placeholder: true,
            close_on_unknown_method: false,
        }
    }
}
