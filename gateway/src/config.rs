//! Gateway configuration.

use std::str::FromStr;

use pocketbank_ledger::{EngineConfig, StorageConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable lines.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("Unknown log format: {}", other)),
        }
    }
}

/// Main gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Balance engine configuration.
    pub engine: EngineConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Largest accepted request line in bytes.
    pub max_request_bytes: usize,
    /// Log level, used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            max_request_bytes: 64 * 1024,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self {
            engine: EngineConfig::from_env(),
            storage: StorageConfig::from_env()?,
            ..Self::default()
        };

        if let Ok(bytes) = std::env::var("POCKETBANK_MAX_REQUEST_BYTES") {
            if let Ok(bytes) = bytes.parse() {
                config.max_request_bytes = bytes;
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(format) = std::env::var("POCKETBANK_LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate()?;
        self.storage.validate()?;

        if self.max_request_bytes == 0 {
            return Err("Request size limit cannot be 0".to_string());
        }

        if self.log_level.is_empty() {
            return Err("Log level cannot be empty".to_string());
        }

        Ok(())
    }
}
