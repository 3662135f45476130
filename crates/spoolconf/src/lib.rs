//! Minimal configuration loading for spool.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): storage roots and telemetry. Fixed
//!   for the lifetime of the process.
//!
//! - **Capture** (`CaptureConfig`): timing and batching values copied into
//!   each recording session when it starts.
//!
//! # Usage
//!
//! ```rust,no_run
//! use spoolconf::SpoolConfig;
//!
//! let config = SpoolConfig::load().expect("Failed to load config");
//! println!("temp recordings: {}", config.infra.paths.temp_dir.display());
//! println!("poll every {}ms", config.capture.poll_interval_ms);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/spool/config.toml` (system)
//! 2. `~/.config/spool/config.toml` (user)
//! 3. `./spool.toml` (local override, or the `--config` path)
//! 4. Environment variables (`SPOOL_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! temp_dir = "/tmp/spool"
//! perm_dir = "/mnt/data/recordings"
//! extension = ".spool"
//!
//! [capture]
//! poll_interval_ms = 100
//! block_timeout_ms = 1000
//! max_batch = 1000
//! default_duration_secs = 10
//! empty_batch = "stop"
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod capture;
pub mod infra;
pub mod loader;

pub use capture::{CaptureConfig, EmptyBatchPolicy};
pub use infra::{InfraConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete spool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SpoolConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Capture - seeds each recording session.
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl SpoolConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/spool/config.toml`
    /// 3. `~/.config/spool/config.toml`
    /// 4. `./spool.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit file, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./spool.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = SpoolConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand so sections come out in a stable, readable order
        let mut output = String::new();

        output.push_str("# spool configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "temp_dir = \"{}\"\n",
            self.infra.paths.temp_dir.display()
        ));
        output.push_str(&format!(
            "perm_dir = \"{}\"\n",
            self.infra.paths.perm_dir.display()
        ));
        output.push_str(&format!("extension = \"{}\"\n", self.infra.paths.extension));

        output.push_str("\n[capture]\n");
        output.push_str(&format!(
            "poll_interval_ms = {}\n",
            self.capture.poll_interval_ms
        ));
        output.push_str(&format!(
            "block_timeout_ms = {}\n",
            self.capture.block_timeout_ms
        ));
        output.push_str(&format!("max_batch = {}\n", self.capture.max_batch));
        output.push_str(&format!(
            "default_duration_secs = {}\n",
            self.capture.default_duration_secs
        ));
        output.push_str(&format!(
            "empty_batch = \"{}\"\n",
            self.capture.empty_batch.as_str()
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output
    }
}
