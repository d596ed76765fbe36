//! TOML Configuration File Support
//!
//! Configuration is read from `~/.config/runview/runview.toml` (XDG config
//! directory) or from an explicit path.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RUNVIEW_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [relay]
//! capacity = 1024
//! mode = "queued"
//! max_per_tick = 256
//!
//! [placement]
//! mode = "overplot"
//! current = "focused"
//!
//! [artist]
//! label_template = "{scan_id} [{uid:.8}]"
//!
//! [[plots]]
//! x = "motor"
//! y = "det"
//!
//! [handlers]
//! AD_HDF5 = "hdf5_handler"
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::label::DEFAULT_TEMPLATE;
use crate::plots::PlotSpec;
use crate::registry::{CurrentContainer, PlacementMode, PlacementPolicy};
use crate::relay::{RelayConfig, RelayMode};
use crate::router::HandlerRegistry;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration last changed from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[relay]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Queue capacity in documents
    pub capacity: Option<usize>,

    /// `auto`, `queued` or `direct`
    pub mode: Option<RelayMode>,

    /// Documents delivered per drain call (0 = unlimited)
    pub max_per_tick: Option<usize>,
}

/// `[placement]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementToml {
    /// `paged` or `overplot`
    pub mode: Option<PlacementMode>,

    /// `focused` or `most_recently_created`
    pub current: Option<CurrentContainer>,
}

/// `[artist]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtistToml {
    /// Default label template for every plot
    pub label_template: Option<String>,
}

/// Root of the TOML file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunviewToml {
    /// Relay settings
    pub relay: RelayToml,

    /// Placement settings
    pub placement: PlacementToml,

    /// Artist settings
    pub artist: ArtistToml,

    /// Line plots created for every run
    pub plots: Vec<PlotSpec>,

    /// Resource spec -> handler name
    pub handlers: HandlerRegistry,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Fully resolved configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RunviewConfig {
    /// Relay settings
    pub relay: RelayConfig,

    /// Container placement
    pub placement: PlacementPolicy,

    /// Default label template
    pub label_template: String,

    /// Configured plots
    pub plots: Vec<PlotSpec>,

    /// Resource spec -> handler name
    pub handler_registry: HandlerRegistry,

    /// File the configuration was loaded from, if any
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for RunviewConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            placement: PlacementPolicy::default(),
            label_template: DEFAULT_TEMPLATE.to_string(),
            plots: Vec::new(),
            handler_registry: HandlerRegistry::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RunviewConfig {
    /// Where the configuration last changed from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check the resolved values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero relay capacity or a
    /// plot whose expressions do not parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "relay.capacity must be at least 1".to_string(),
            ));
        }
        for (i, plot) in self.plots.iter().enumerate() {
            plot.validate().map_err(|e| {
                ConfigError::ValidationError(format!("plots[{i}] ({}): {e}", plot.title()))
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/runview/runview.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("runview").join("runview.toml"))
}

/// Load configuration from the default path plus the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed or does
/// not validate. A missing config file is not an error.
pub fn load_config() -> Result<RunviewConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path plus the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed or validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RunviewConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment variables through `env`
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<E>(path: Option<PathBuf>, env: E) -> Result<RunviewConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let mut config = RunviewConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RunviewToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                plots = config.plots.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_overrides(&mut config, env);
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut RunviewConfig, toml: RunviewToml) {
    if let Some(capacity) = toml.relay.capacity {
        config.relay.capacity = capacity;
    }
    if let Some(mode) = toml.relay.mode {
        config.relay.mode = mode;
    }
    if let Some(max) = toml.relay.max_per_tick {
        config.relay.max_per_tick = max;
    }

    if let Some(mode) = toml.placement.mode {
        config.placement.mode = mode;
    }
    if let Some(current) = toml.placement.current {
        config.placement.current = current;
    }

    if let Some(template) = toml.artist.label_template {
        config.label_template = template;
    }

    config.plots = toml.plots;
    config.handler_registry = toml.handlers;
}

/// Apply `RUNVIEW_*` overrides read through `env`
///
/// Values that fail to parse are logged and ignored.
pub fn apply_env_overrides<E>(config: &mut RunviewConfig, env: E)
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(capacity) = env("RUNVIEW_RELAY_CAPACITY") {
        match capacity.parse::<usize>() {
            Ok(n) => {
                config.relay.capacity = n;
                config.source = ConfigSource::Env;
            }
            Err(e) => {
                tracing::warn!(value = %capacity, error = %e, "Ignoring RUNVIEW_RELAY_CAPACITY");
            }
        }
    }
    if let Some(mode) = env("RUNVIEW_RELAY_MODE") {
        match mode.parse::<RelayMode>() {
            Ok(m) => {
                config.relay.mode = m;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring RUNVIEW_RELAY_MODE"),
        }
    }
    if let Some(placement) = env("RUNVIEW_PLACEMENT") {
        match placement.parse::<PlacementMode>() {
            Ok(m) => {
                config.placement.mode = m;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring RUNVIEW_PLACEMENT"),
        }
    }
    if let Some(template) = env("RUNVIEW_LABEL_TEMPLATE") {
        config.label_template = template;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Relay mode override
    pub relay_mode: Option<RelayMode>,

    /// Placement mode override
    pub placement: Option<PlacementMode>,

    /// Label template override
    pub label_template: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set relay mode override
    #[must_use]
    pub fn with_relay_mode(mut self, mode: RelayMode) -> Self {
        self.relay_mode = Some(mode);
        self
    }

    /// Set placement override
    #[must_use]
    pub fn with_placement(mut self, mode: PlacementMode) -> Self {
        self.placement = Some(mode);
        self
    }

    /// Set label template override
    #[must_use]
    pub fn with_label_template(mut self, template: impl Into<String>) -> Self {
        self.label_template = Some(template.into());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RunviewConfig) {
        if self.relay_mode.is_some() || self.placement.is_some() || self.label_template.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(mode) = self.relay_mode {
            config.relay.mode = mode;
        }
        if let Some(mode) = self.placement {
            config.placement.mode = mode;
        }
        if let Some(ref template) = self.label_template {
            config.label_template = template.clone();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn fake_env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = RunviewConfig::default();
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.placement.mode, PlacementMode::Overplot);
        assert_eq!(config.placement.current, CurrentContainer::Focused);
        assert_eq!(config.label_template, DEFAULT_TEMPLATE);
        assert!(config.plots.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = PathBuf::from("/nonexistent/runview/runview.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("runview/runview.toml"));
        }
    }

    // =========================================================================
    // File Loading
    // =========================================================================

    #[test]
    fn test_load_full_file() {
        let file = write_config(
            r#"
            [relay]
            capacity = 64
            mode = "direct"
            max_per_tick = 8

            [placement]
            mode = "paged"
            current = "most_recently_created"

            [artist]
            label_template = "scan {scan_id}"

            [[plots]]
            x = "motor"
            y = "det / I0"

            [handlers]
            AD_HDF5 = "hdf5"
            "#,
        );
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.relay.capacity, 64);
        assert_eq!(config.relay.mode, RelayMode::Direct);
        assert_eq!(config.relay.max_per_tick, 8);
        assert_eq!(config.placement.mode, PlacementMode::Paged);
        assert_eq!(config.placement.current, CurrentContainer::MostRecentlyCreated);
        assert_eq!(config.label_template, "scan {scan_id}");
        assert_eq!(config.plots, vec![PlotSpec::new("motor", "det / I0")]);
        assert_eq!(config.handler_registry.get("AD_HDF5").map(String::as_str), Some("hdf5"));
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config("[relay]\ncapacity = 10\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.relay.capacity, 10);
        assert_eq!(config.relay.mode, RelayMode::Auto);
        assert_eq!(config.placement, PlacementPolicy::default());
    }

    #[test]
    fn test_invalid_toml() {
        let file = write_config("[relay\ncapacity = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_enum_value_is_parse_error() {
        let file = write_config("[placement]\nmode = \"tiled\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_zero_capacity_rejected() {
        let file = write_config("[relay]\ncapacity = 0\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_bad_plot_expression_rejected() {
        let file = write_config("[[plots]]\nx = \"seq_num\"\ny = \"det *\"\n");
        let err = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap_err();
        match err {
            ConfigError::ValidationError(message) => assert!(message.starts_with("plots[0]")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    // =========================================================================
    // Environment and CLI Overrides
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[relay]\ncapacity = 64\nmode = \"direct\"\n");
        let env = fake_env(&[
            ("RUNVIEW_RELAY_CAPACITY", "16"),
            ("RUNVIEW_RELAY_MODE", "queued"),
            ("RUNVIEW_PLACEMENT", "paged"),
            ("RUNVIEW_LABEL_TEMPLATE", "{plan_name}"),
        ]);
        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.relay.capacity, 16);
        assert_eq!(config.relay.mode, RelayMode::Queued);
        assert_eq!(config.placement.mode, PlacementMode::Paged);
        assert_eq!(config.label_template, "{plan_name}");
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = RunviewConfig::default();
        apply_env_overrides(
            &mut config,
            fake_env(&[
                ("RUNVIEW_RELAY_CAPACITY", "lots"),
                ("RUNVIEW_RELAY_MODE", "sideways"),
            ]),
        );
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = RunviewConfig::default();
        ConfigOverrides::new()
            .with_relay_mode(RelayMode::Direct)
            .with_placement(PlacementMode::Paged)
            .apply(&mut config);
        assert_eq!(config.relay.mode, RelayMode::Direct);
        assert_eq!(config.placement.mode, PlacementMode::Paged);
        assert_eq!(config.source(), ConfigSource::Cli);

        let mut untouched = RunviewConfig::default();
        ConfigOverrides::new().apply(&mut untouched);
        assert_eq!(untouched.source(), ConfigSource::Default);
    }
}
