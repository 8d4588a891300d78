//! Server and client configuration, loaded from TOML.
//!
//! ```toml
//! listen_addr = "0.0.0.0:16050"
//! handlers = 8
//! max_connections = 64
//! max_rows = 100000
//!
//! [log]
//! level = "info"
//! json = false
//!
//! [[sources]]
//! name = "tilt"
//! kind = "synthetic"
//! description = "Summit tilt"
//! options = { interval = 60, channels = 2 }
//! ```

use crate::source::BUILTIN_KINDS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 16050;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Kind-specific settings.
    #[serde(default)]
    pub options: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Requests processed concurrently across all connections.
    pub handlers: usize,
    /// Open sockets beyond this are refused.
    pub max_connections: usize,
    /// Row guard limit; 0 disables it.
    pub max_rows: usize,
    pub idle_timeout_secs: u64,
    pub log: LogConfig,
    pub sources: Vec<SourceConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            handlers: 8,
            max_connections: 64,
            max_rows: 0,
            idle_timeout_secs: 300,
            log: LogConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handlers == 0 {
            return Err(ConfigError::Invalid("handlers must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() || source.name.contains([';', '=', ':', '\n']) {
                return Err(ConfigError::Invalid(format!("bad source name '{}'", source.name)));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source '{}'", source.name)));
            }
            if !BUILTIN_KINDS.contains(&source.kind.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "source '{}' has unknown kind '{}' (known: {})",
                    source.name,
                    source.kind,
                    BUILTIN_KINDS.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_handlers(mut self, handlers: usize) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub addr: String,
    /// Applies to each read, not to a whole request.
    pub read_timeout_secs: u64,
    pub max_attempts: u32,
    /// Base delay before a retry; 0 retries immediately.
    pub backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            read_timeout_secs: 60,
            max_attempts: 3,
            backoff_ms: 0,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        ClientConfig {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("read_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn backoff(&self) -> Option<Duration> {
        (self.backoff_ms > 0).then(|| Duration::from_millis(self.backoff_ms))
    }

    pub fn with_read_timeout_secs(mut self, secs: u64) -> Self {
        self.read_timeout_secs = secs;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff_ms(mut self, ms: u64) -> Self {
        self.backoff_ms = ms;
        self
    }
}
