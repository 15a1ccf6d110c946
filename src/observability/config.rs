//! Logging Configuration
//!
//! Loaded from environment variables for 12-factor compliance:
//! - `TSDB_LOG_LEVEL`: default filter directive when `RUST_LOG` is unset (default: info)
//! - `TSDB_LOG_JSON`: emit JSON lines instead of human-readable output (default: false)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `tsdb_partition=debug,warn`
    pub level: String,
    pub json: bool,
    /// Include the module path of each event
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_from(|name| std::env::var(name).ok());
        config
    }

    /// Override fields from a variable lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("TSDB_LOG_LEVEL").filter(|l| !l.is_empty()) {
            self.level = level;
        }
        if let Some(json) = lookup("TSDB_LOG_JSON") {
            self.json = parse_flag(&json);
        }
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "yes" | "on")
}
