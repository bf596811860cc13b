//! Monitor configuration
//!
//! Loaded from TOML by the embedding application, e.g.:
//!
//! ```toml
//! recursive = true
//! ignore_patterns = ["*.tmp", "target/"]
//! default_debounce_ms = 100
//! thread_count = 4
//!
//! [polling_fallback]
//! enabled = false
//! poll_interval = 1.0
//! hash_size = 65536
//! ```

use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Options for one monitoring engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Watch subdirectories for `**` and name-only patterns (default: true)
    pub recursive: bool,

    /// Gitignore-syntax patterns; matching events are dropped
    pub ignore_patterns: Vec<String>,

    /// Also honor `<project_root>/.gitignore` (default: false)
    pub use_gitignore: bool,

    /// Debounce applied when a listener asks for less (default: 100ms)
    pub default_debounce_ms: u64,

    /// Worker threads executing listener callbacks (default: 4)
    pub thread_count: usize,

    /// Polling monitor settings
    pub polling_fallback: PollingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            ignore_patterns: Vec::new(),
            use_gitignore: false,
            default_debounce_ms: 100,
            thread_count: 4,
            polling_fallback: PollingConfig::default(),
        }
    }
}

/// Polling monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Use the polling monitor even where a native one exists
    pub enabled: bool,

    /// Seconds between snapshots (default: 1.0)
    pub poll_interval: f64,

    /// Files up to this many bytes are content-hashed to confirm a
    /// modification; 0 disables hashing (default: 64 KiB)
    pub hash_size: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: 1.0,
            hash_size: 64 * 1024,
        }
    }
}

impl PollingConfig {
    /// Poll interval, falling back to one second for unvalidated values
    pub fn interval(&self) -> Duration {
        match Duration::try_from_secs_f64(self.poll_interval) {
            Ok(d) if !d.is_zero() => d,
            _ => Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: MonitorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(MonitorError::Config(
                "thread_count must be at least 1".to_string(),
            ));
        }

        let interval = self.polling_fallback.poll_interval;
        if !interval.is_finite() || interval <= 0.0 {
            return Err(MonitorError::Config(format!(
                "polling_fallback.poll_interval must be a positive number of seconds, got {}",
                interval
            )));
        }

        for pattern in &self.ignore_patterns {
            ignore::gitignore::GitignoreBuilder::new("/")
                .add_line(None, pattern)
                .map_err(|e| {
                    MonitorError::Config(format!("invalid ignore pattern '{}': {}", pattern, e))
                })?;
        }

        Ok(())
    }

    pub fn default_debounce(&self) -> Duration {
        Duration::from_millis(self.default_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = MonitorConfig::from_toml_str("").unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert!(config.recursive);
        assert_eq!(config.polling_fallback.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml() {
        let config = MonitorConfig::from_toml_str(
            r#"
            recursive = false
            ignore_patterns = ["*.tmp"]
            default_debounce_ms = 250

            [polling_fallback]
            enabled = true
            poll_interval = 0.5
            "#,
        )
        .unwrap();

        assert!(!config.recursive);
        assert_eq!(config.ignore_patterns, vec!["*.tmp".to_string()]);
        assert_eq!(config.default_debounce(), Duration::from_millis(250));
        assert_eq!(config.thread_count, 4);
        assert!(config.polling_fallback.enabled);
        assert_eq!(config.polling_fallback.interval(), Duration::from_millis(500));
        assert_eq!(config.polling_fallback.hash_size, 64 * 1024);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = MonitorConfig::from_toml_str("thread_count = 0").unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));

        let err = MonitorConfig::from_toml_str("[polling_fallback]\npoll_interval = 0.0").unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn test_type_errors_surface_as_toml() {
        let err = MonitorConfig::from_toml_str("thread_count = \"many\"").unwrap_err();
        assert!(matches!(err, MonitorError::Toml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("monitor.toml");
        std::fs::write(&path, "thread_count = 2\n").unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.thread_count, 2);
    }
}
