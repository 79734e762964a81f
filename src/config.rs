use serde::{Deserialize, Serialize};

use crate::discovery::paths::validate_path;
use crate::discovery::strategy::LoadBalanceStrategy;
use crate::error::{DiscoveryError, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// 注册与监听的根路径（`/base/service-name/instance-id`）
    pub base_path: String,
    #[serde(default = "default_register_attempts")]
    pub register_attempts: usize,
    #[serde(default)]
    pub default_strategy: LoadBalanceStrategy,
}

fn default_register_attempts() -> usize {
    3
}

impl DiscoveryConfig {
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            register_attempts: default_register_attempts(),
            default_strategy: LoadBalanceStrategy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_path(&self.base_path).map_err(DiscoveryError::Config)?;
        if self.base_path == "/" {
            return Err(DiscoveryError::config("base_path must not be the root node"));
        }
        if self.register_attempts == 0 {
            return Err(DiscoveryError::config("register_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Etcd,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(StoreBackend::Memory),
            "etcd" => Ok(StoreBackend::Etcd),
            _ => Err(format!("Unknown store backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// 会话租约 TTL（秒），临时节点在会话失联超过该时长后消失
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,
}

fn default_session_ttl() -> u64 {
    15
}

fn default_connect_attempts() -> usize {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoints: Vec::new(),
            session_ttl: default_session_ttl(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Etcd && self.endpoints.is_empty() {
            return Err(DiscoveryError::config("etcd endpoints not configured"));
        }
        if self.session_ttl == 0 {
            return Err(DiscoveryError::config("session_ttl must be at least 1 second"));
        }
        if self.connect_attempts == 0 {
            return Err(DiscoveryError::config("connect_attempts must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoveryError::config(format!("failed to read {}: {}", path, e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| DiscoveryError::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()?;
        self.store.validate()
    }
}
