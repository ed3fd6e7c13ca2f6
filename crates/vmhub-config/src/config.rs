use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// 获取配置值的快捷方法
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "bind"] => Some(self.server.bind.clone()),
            ["server", "max_connections"] => Some(self.server.max_connections.to_string()),
            ["server", "heartbeat_interval_secs"] => {
                Some(self.server.heartbeat_interval_secs.to_string())
            }
            ["session", "idle_timeout_secs"] => Some(self.session.idle_timeout_secs.to_string()),
            ["session", "sweep_interval_secs"] => Some(self.session.sweep_interval_secs.to_string()),
            ["pipeline", "translate_update_errors"] => {
                Some(self.pipeline.translate_update_errors.to_string())
            }
            ["pipeline", "mask_internal_errors"] => {
                Some(self.pipeline.mask_internal_errors.to_string())
            }
            ["pipeline", "trust_identity_header"] => {
                Some(self.pipeline.trust_identity_header.to_string())
            }
            ["pipeline", "identity_header"] => Some(self.pipeline.identity_header.clone()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            ["logging", "modules", module] => self
                .logging
                .module_levels
                .get(*module)
                .map(|level| level.as_str().to_string()),
            _ => None,
        }
    }

    /// 设置配置值
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["server", "bind"] => {
                self.server.bind = value.to_string();
            }
            ["server", "max_connections"] => {
                self.server.max_connections = parse_number(value)?;
            }
            ["server", "heartbeat_interval_secs"] => {
                self.server.heartbeat_interval_secs = parse_number(value)?;
            }
            ["session", "idle_timeout_secs"] => {
                self.session.idle_timeout_secs = parse_number(value)?;
            }
            ["session", "sweep_interval_secs"] => {
                self.session.sweep_interval_secs = parse_number(value)?;
            }
            ["pipeline", "translate_update_errors"] => {
                self.pipeline.translate_update_errors = parse_bool(value)?;
            }
            ["pipeline", "mask_internal_errors"] => {
                self.pipeline.mask_internal_errors = parse_bool(value)?;
            }
            ["pipeline", "trust_identity_header"] => {
                self.pipeline.trust_identity_header = parse_bool(value)?;
            }
            ["pipeline", "identity_header"] => {
                self.pipeline.identity_header = value.to_string();
            }
            ["logging", "level"] => {
                self.logging.level = value.parse()?;
            }
            ["logging", "json_format"] => {
                self.logging.json_format = parse_bool(value)?;
            }
            ["logging", "modules", module] => {
                self.logging
                    .module_levels
                    .insert((*module).to_string(), value.parse()?);
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

fn parse_bool(value: &str) -> ConfigResult<bool> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid boolean: {}", value)))
}

/// WebSocket 服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// 绑定地址 (e.g., "127.0.0.1:18790")
    pub bind: String,
    /// 最大并发连接数
    pub max_connections: usize,
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
            max_connections: 1000,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Registry lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// A connection's registry is evicted after this many idle seconds
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 20 * 60,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Pipeline switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Send update failures through the exception translators
    pub translate_update_errors: bool,
    /// Replace errors outside the public taxonomy with a generic one
    pub mask_internal_errors: bool,
    /// Take the caller identity from a message header
    pub trust_identity_header: bool,
    pub identity_header: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            translate_update_errors: true,
            mask_internal_errors: false,
            trust_identity_header: false,
            identity_header: "identity".to_string(),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// 输出 JSON 格式日志
    pub json_format: bool,
    /// Per-module overrides, e.g. `{"vmhub_session": "debug"}`
    pub module_levels: BTreeMap<String, LogLevel>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Watch error: {0}")]
    #[cfg(feature = "hot-reload")]
    Watch(#[from] notify::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
