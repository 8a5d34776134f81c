//! WolfGroup Configuration
//!
//! This module provides configuration structures for the group
//! membership and leader election engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main WolfGroup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfGroupConfig {
    /// Group configuration
    pub group: GroupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Base path under which members register
    pub path: String,

    /// Name prefix for member nodes (the store appends the sequence number)
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,

    /// Grace period for the worker to stop during close, in milliseconds
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_node_prefix() -> String {
    "member-".to_string()
}

fn default_close_grace_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GroupConfig {
    /// Create a group configuration for a base path with default settings
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node_prefix: default_node_prefix(),
            close_grace_ms: default_close_grace_ms(),
        }
    }

    /// Validate the group settings
    pub fn validate(&self) -> crate::Result<()> {
        if self.path.is_empty() {
            return Err(crate::Error::Config("group.path cannot be empty".into()));
        }

        if !self.path.starts_with('/') {
            return Err(crate::Error::Config(format!(
                "group.path must be absolute, got {:?}",
                self.path
            )));
        }

        if self.path.len() > 1 && self.path.ends_with('/') {
            return Err(crate::Error::Config(format!(
                "group.path must not end with '/', got {:?}",
                self.path
            )));
        }

        if self.path.len() > 1 && self.path[1..].split('/').any(|s| s.is_empty()) {
            return Err(crate::Error::Config(format!(
                "group.path contains an empty segment: {:?}",
                self.path
            )));
        }

        if self.node_prefix.contains('/') {
            return Err(crate::Error::Config(
                "group.node_prefix cannot contain '/'".into(),
            ));
        }

        if self.close_grace_ms == 0 {
            return Err(crate::Error::Config(
                "group.close_grace_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Get the close grace period as Duration
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Path handed to the store when creating this member's node
    pub fn node_path(&self) -> String {
        if self.path == "/" {
            format!("/{}", self.node_prefix)
        } else {
            format!("{}/{}", self.path, self.node_prefix)
        }
    }

    /// Full path of a child node name under the base path
    pub fn child_path(&self, name: &str) -> String {
        if self.path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.path, name)
        }
    }
}

impl WolfGroupConfig {
    /// Build a configuration with defaults for the given base path
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            group: GroupConfig::new(path),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfGroupConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfGroupConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.group.validate()?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.level must be one of trace, debug, info, warn, error (got {:?})",
                    other
                )))
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be pretty or json (got {:?})",
                    other
                )))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[group]
path = "/wolfscale/masters"
node_prefix = "node-"
close_grace_ms = 2500

[logging]
level = "debug"
format = "json"
"#;

        let config = WolfGroupConfig::from_str(toml).unwrap();
        assert_eq!(config.group.path, "/wolfscale/masters");
        assert_eq!(config.group.node_prefix, "node-");
        assert_eq!(config.group.close_grace(), Duration::from_millis(2500));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_defaults_applied() {
        let config = WolfGroupConfig::from_str("[group]\npath = \"/fleet\"\n").unwrap();
        assert_eq!(config.group.node_prefix, "member-");
        assert_eq!(config.group.close_grace_ms, 5000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.group.node_path(), "/fleet/member-");
        assert_eq!(config.group.child_path("member-0000000007"), "/fleet/member-0000000007");
    }

    #[test]
    fn test_invalid_paths_rejected() {
        for path in ["", "fleet", "/fleet/", "/fleet//a"] {
            let config = WolfGroupConfig::with_path(path);
            assert!(config.validate().is_err(), "path {:?} should be rejected", path);
        }

        let mut config = WolfGroupConfig::with_path("/fleet");
        config.group.node_prefix = "a/b".into();
        assert!(config.validate().is_err());

        let mut config = WolfGroupConfig::with_path("/fleet");
        config.group.close_grace_ms = 0;
        assert!(config.validate().is_err());

        let mut config = WolfGroupConfig::with_path("/fleet");
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = WolfGroupConfig::with_path("/fleet");
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_root_path_children() {
        let config = GroupConfig::new("/");
        assert!(config.validate().is_ok());
        assert_eq!(config.node_path(), "/member-");
        assert_eq!(config.child_path("member-0000000001"), "/member-0000000001");
    }

    #[test]
    fn test_file_round_trip() {
        let config = WolfGroupConfig::with_path("/fleet/brokers");
        let rendered = config.to_toml_string().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        let loaded = WolfGroupConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.group.path, "/fleet/brokers");
        assert_eq!(loaded.group.node_prefix, config.group.node_prefix);
    }
}
