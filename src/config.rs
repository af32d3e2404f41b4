//! Configuration for the loop daemon and CLI.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::circuit::CircuitThresholds;

/// Main configuration. Serialized as JSON; unknown fields are ignored so
/// old files keep loading as the schema grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for persisted sessions, circuits, and histories.
    pub state_dir: PathBuf,

    /// Iteration cap per run.
    pub max_loops: u32,

    /// Seconds to pause between iterations.
    pub loop_delay_seconds: u64,

    /// Per-iteration timeout in seconds.
    pub loop_timeout_seconds: u64,

    /// Agent invocations per hour; zero disables the limiter.
    pub rate_limit_per_hour: i64,

    /// Hours before a dormant session is considered expired.
    pub session_ttl_hours: i64,

    /// Require completion phrases alongside the exit signal.
    pub strict_completion: bool,

    /// Circuit breaker thresholds; zeros fall back to the defaults.
    pub thresholds: CircuitThresholds,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("agent-loop");

        Self {
            state_dir,
            max_loops: 10,
            loop_delay_seconds: 2,
            loop_timeout_seconds: 30 * 60,
            rate_limit_per_hour: 100,
            session_ttl_hours: 24,
            strict_completion: false,
            thresholds: CircuitThresholds::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ensure the state directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        Ok(())
    }
}
