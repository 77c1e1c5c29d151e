//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/librarium/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use librarium_plugin_api::{GuardOptions, HookTimeouts, PoolSizes};
use librarium_runtime::{ManifestValidator, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon-specific configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Plugin loading configuration
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Per-hook-type deadlines and worker pools
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Capability guard limits
    #[serde(default)]
    pub guard: GuardConfig,
}

/// Daemon paths and logging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
    /// Directory holding installed plugins
    /// If None, uses XDG_DATA_HOME/librarium/plugins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugins_dir: Option<PathBuf>,
    /// Ordering and field settings file
    /// If None, uses XDG_DATA_HOME/librarium/settings.toml
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<PathBuf>,
    /// Root for per-call temp directories
    /// If None, uses the system temp directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

/// Plugin loading configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    /// Manifest versions this host accepts
    /// Default: [1]
    pub supported_manifest_versions: Vec<u32>,
    /// Reject plugins exporting undeclared hooks instead of dropping the export
    /// Default: true
    pub strict_exports: bool,
    /// Deadline for evaluating a plugin's entry code, in seconds
    /// Default: 30
    pub init_timeout_secs: u64,
    /// How long a replaced runtime may take to finish in-flight calls, in seconds
    /// Default: 60
    pub drain_timeout_secs: u64,
    /// Consecutive timeouts after which a runtime is flagged (0 disables)
    /// Default: 3
    pub flag_after_timeouts: u32,
}

/// Per-hook-type deadlines (seconds) and worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HooksConfig {
    pub input_converter_timeout_secs: u64,
    pub file_parser_timeout_secs: u64,
    pub output_generator_timeout_secs: u64,
    pub metadata_enricher_timeout_secs: u64,
    pub input_converter_workers: usize,
    pub file_parser_workers: usize,
    pub output_generator_workers: usize,
    pub metadata_enricher_workers: usize,
}

/// Capability guard limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    /// Catalog-wide roots reachable by plugins declaring file access
    pub catalog_roots: Vec<PathBuf>,
    /// Maximum HTTP response body size in bytes
    /// Default: 10485760 (10 MiB)
    pub max_response_bytes: usize,
    /// Maximum redirect hops per request
    /// Default: 10
    pub max_redirects: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            plugins_dir: None,
            settings_path: None,
            temp_dir: None,
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            supported_manifest_versions: vec![1],
            strict_exports: true,
            init_timeout_secs: 30,
            drain_timeout_secs: 60,
            flag_after_timeouts: 3,
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        let timeouts = HookTimeouts::default();
        let pools = PoolSizes::default();
        Self {
            input_converter_timeout_secs: timeouts.input_converter.as_secs(),
            file_parser_timeout_secs: timeouts.file_parser.as_secs(),
            output_generator_timeout_secs: timeouts.output_generator.as_secs(),
            metadata_enricher_timeout_secs: timeouts.metadata_enricher.as_secs(),
            input_converter_workers: pools.input_converter,
            file_parser_workers: pools.file_parser,
            output_generator_workers: pools.output_generator,
            metadata_enricher_workers: pools.metadata_enricher,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        let options = GuardOptions::default();
        Self {
            catalog_roots: options.catalog_roots,
            max_response_bytes: options.max_response_bytes,
            max_redirects: options.max_redirects,
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "raibid-labs", "librarium")
        .context("Failed to determine project directories")
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Get the default configuration file path
    ///
    /// Returns `$XDG_CONFIG_HOME/librarium/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join("config.toml"))
    }

    /// Create a default configuration file with documented comments
    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    fn default_config_content() -> String {
        r#"# Librarium Daemon Configuration
# This file configures the librarium-daemon plugin host.

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG overrides this when set.
# Default: "info"
log_level = "info"

# Directory holding installed plugins, laid out as <scope>/<id>/
# If not specified, defaults to $XDG_DATA_HOME/librarium/plugins
# plugins_dir = "/path/to/plugins"

# Ordering and field settings ([[order]] and [[field]] rows)
# If not specified, defaults to $XDG_DATA_HOME/librarium/settings.toml
# settings_path = "/path/to/settings.toml"

# Root for per-call temp directories
# If not specified, the system temp directory is used
# temp_dir = "/path/to/tmp"

[plugins]
# Manifest versions accepted by this host
supported_manifest_versions = [1]

# Reject plugins exporting hooks they did not declare.
# When false the export is dropped with a warning.
strict_exports = true

# Deadline for evaluating a plugin's entry code (seconds)
init_timeout_secs = 30

# How long a replaced plugin version may take to finish in-flight calls (seconds)
drain_timeout_secs = 60

# Consecutive timeouts after which a plugin is flagged (0 disables)
flag_after_timeouts = 3

[hooks]
# Per-call deadlines (seconds)
input_converter_timeout_secs = 300
file_parser_timeout_secs = 60
output_generator_timeout_secs = 300
metadata_enricher_timeout_secs = 60

# Concurrent plugin calls per hook type
input_converter_workers = 2
file_parser_workers = 4
output_generator_workers = 2
metadata_enricher_workers = 8

[guard]
# Catalog-wide roots plugins may reach with file_access "read" or "readwrite"
catalog_roots = []

# Maximum HTTP response body size (bytes)
max_response_bytes = 10485760

# Maximum redirect hops followed per request
max_redirects = 10
"#
        .to_string()
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are valid and within acceptable ranges.
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                valid_log_levels.join(", ")
            );
        }

        if self.plugins.supported_manifest_versions.is_empty() {
            anyhow::bail!("plugins.supported_manifest_versions cannot be empty");
        }
        if self.plugins.init_timeout_secs == 0 {
            anyhow::bail!("plugins.init_timeout_secs must be greater than 0");
        }
        if self.plugins.drain_timeout_secs == 0 {
            anyhow::bail!("plugins.drain_timeout_secs must be greater than 0");
        }

        let hooks = &self.hooks;
        let values = [
            ("input_converter_timeout_secs", hooks.input_converter_timeout_secs as usize),
            ("file_parser_timeout_secs", hooks.file_parser_timeout_secs as usize),
            ("output_generator_timeout_secs", hooks.output_generator_timeout_secs as usize),
            ("metadata_enricher_timeout_secs", hooks.metadata_enricher_timeout_secs as usize),
            ("input_converter_workers", hooks.input_converter_workers),
            ("file_parser_workers", hooks.file_parser_workers),
            ("output_generator_workers", hooks.output_generator_workers),
            ("metadata_enricher_workers", hooks.metadata_enricher_workers),
        ];
        for (name, value) in values {
            if value == 0 {
                anyhow::bail!("hooks.{} must be greater than 0", name);
            }
        }

        if self.guard.max_response_bytes == 0 {
            anyhow::bail!("guard.max_response_bytes must be greater than 0");
        }

        Ok(())
    }

    /// Get the plugins directory
    ///
    /// Returns the configured directory or the default XDG data directory path
    pub fn plugins_dir(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.daemon.plugins_dir {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("plugins"))
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.daemon.settings_path {
            return Ok(path.clone());
        }
        Ok(project_dirs()?.data_dir().join("settings.toml"))
    }

    pub fn manifest_validator(&self) -> ManifestValidator {
        ManifestValidator::new(self.plugins.supported_manifest_versions.clone())
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            strict_exports: self.plugins.strict_exports,
            init_timeout: Duration::from_secs(self.plugins.init_timeout_secs),
            flag_after_timeouts: self.plugins.flag_after_timeouts,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.drain_timeout_secs)
    }

    pub fn guard_options(&self) -> GuardOptions {
        GuardOptions {
            catalog_roots: self.guard.catalog_roots.clone(),
            max_response_bytes: self.guard.max_response_bytes,
            max_redirects: self.guard.max_redirects,
        }
    }

    pub fn hook_timeouts(&self) -> HookTimeouts {
        HookTimeouts {
            input_converter: Duration::from_secs(self.hooks.input_converter_timeout_secs),
            file_parser: Duration::from_secs(self.hooks.file_parser_timeout_secs),
            output_generator: Duration::from_secs(self.hooks.output_generator_timeout_secs),
            metadata_enricher: Duration::from_secs(self.hooks.metadata_enricher_timeout_secs),
        }
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        PoolSizes {
            input_converter: self.hooks.input_converter_workers,
            file_parser: self.hooks.file_parser_workers,
            output_generator: self.hooks.output_generator_workers,
            metadata_enricher: self.hooks.metadata_enricher_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.plugins_dir.is_none());
        assert_eq!(config.plugins.supported_manifest_versions, vec![1]);
        assert!(config.plugins.strict_exports);
        assert_eq!(config.hooks.input_converter_timeout_secs, 300);
        assert_eq!(config.hooks.metadata_enricher_timeout_secs, 60);
        assert_eq!(config.guard.max_redirects, 10);
    }

    #[test]
    fn test_default_content_matches_defaults() {
        let parsed: Config = toml::from_str(&Config::default_config_content()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_load_partial_config() {
        let config_content = r#"
[daemon]
log_level = "debug"
plugins_dir = "/srv/librarium/plugins"

[hooks]
metadata_enricher_timeout_secs = 15
metadata_enricher_workers = 2

[guard]
catalog_roots = ["/srv/books"]
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.plugins_dir().unwrap(), PathBuf::from("/srv/librarium/plugins"));
        assert_eq!(config.hook_timeouts().metadata_enricher, Duration::from_secs(15));
        assert_eq!(config.hook_timeouts().file_parser, Duration::from_secs(60));
        assert_eq!(config.pool_sizes().metadata_enricher, 2);
        assert_eq!(config.guard_options().catalog_roots, vec![PathBuf::from("/srv/books")]);
        assert!(config.plugins.strict_exports);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = Config::default();
        config.hooks.file_parser_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.hooks.output_generator_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.plugins.supported_manifest_versions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_runtime_options() {
        let mut config = Config::default();
        config.plugins.strict_exports = false;
        config.plugins.flag_after_timeouts = 0;

        let options = config.runtime_options();
        assert!(!options.strict_exports);
        assert_eq!(options.flag_after_timeouts, 0);
        assert_eq!(options.init_timeout, Duration::from_secs(30));
        assert_eq!(config.drain_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_settings_path_default() {
        let config = Config::default();
        let path = config.settings_path().unwrap();
        assert!(path.to_string_lossy().contains("librarium"));
        assert!(path.to_string_lossy().ends_with("settings.toml"));
    }

    #[test]
    fn test_full_config_roundtrip() {
        let mut config = Config::default();
        config.daemon.settings_path = Some(PathBuf::from("/etc/librarium/settings.toml"));
        config.hooks.file_parser_workers = 16;

        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
    }
}
