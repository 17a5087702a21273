// Configuration module for the ring node
//
// This module handles loading, validating and saving the node
// configuration.

use crate::error::{NodeError, Result};
use crate::overlay::rm_tman::RmConfig;
use crate::types::ProcessAddr;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Ring node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ring maintenance configuration
    pub ring: RingConfig,
    /// Protocol scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Ring maintenance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Bound on the predecessor list
    pub pred_list_length: usize,
    /// Bound on the successor list
    pub succ_list_length: usize,
    /// Bound on the random peer cache
    pub cyclon_cache_size: usize,
    /// Gossip period in milliseconds
    pub stabilization_interval_base_ms: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            pred_list_length: 9,
            succ_list_length: 9,
            cyclon_cache_size: 20,
            stabilization_interval_base_ms: 1000,
        }
    }
}

impl RingConfig {
    /// The gossip period as a duration
    pub fn stabilization_interval(&self) -> Duration {
        Duration::from_millis(self.stabilization_interval_base_ms)
    }

    /// Derive the ring maintenance process configuration
    pub fn rm_config(&self, cache_addr: ProcessAddr) -> RmConfig {
        RmConfig {
            pred_list_length: self.pred_list_length,
            succ_list_length: self.succ_list_length,
            max_cache_size: self.cyclon_cache_size,
            stabilization_interval_base: self.stabilization_interval(),
            cache_addr,
        }
    }
}

/// Protocol scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seed of the exploration stream
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { seed: 42 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (plain or json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Check the configured values for consistency
    pub fn validate(&self) -> Result<()> {
        if self.ring.pred_list_length < 1 {
            return Err(NodeError::Configuration(
                "pred_list_length must be at least 1".to_string(),
            ));
        }
        if self.ring.succ_list_length < 1 {
            return Err(NodeError::Configuration(
                "succ_list_length must be at least 1".to_string(),
            ));
        }
        if self.ring.cyclon_cache_size < 3 {
            return Err(NodeError::Configuration(
                "cyclon_cache_size must be at least 3".to_string(),
            ));
        }
        if self.ring.stabilization_interval_base_ms == 0 {
            return Err(NodeError::Configuration(
                "stabilization_interval_base_ms must be positive".to_string(),
            ));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(NodeError::Configuration(format!(
                    "unknown log level: {}",
                    other
                )))
            }
        }
        Ok(())
    }
}
