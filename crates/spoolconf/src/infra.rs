//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage roots for recording files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Scratch recordings. Created on demand.
    /// Default: $TMPDIR/spool
    #[serde(default = "PathsConfig::default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Durable recordings. Never created by spool; if it is missing the
    /// volume is treated as unmounted.
    /// Default: ~/.local/share/spool/recordings
    #[serde(default = "PathsConfig::default_perm_dir")]
    pub perm_dir: PathBuf,

    /// File extension (including the dot) for recording files.
    /// Default: .spool
    #[serde(default = "PathsConfig::default_extension")]
    pub extension: String,
}

impl PathsConfig {
    fn default_temp_dir() -> PathBuf {
        std::env::temp_dir().join("spool")
    }

    fn default_perm_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/spool/recordings"))
            .unwrap_or_else(|| PathBuf::from(".local/share/spool/recordings"))
    }

    fn default_extension() -> String {
        ".spool".to_string()
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            temp_dir: Self::default_temp_dir(),
            perm_dir: Self::default_perm_dir(),
            extension: Self::default_extension(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or full `EnvFilter` directive.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Infrastructure configuration - cannot change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Storage roots.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_defaults() {
        let paths = PathsConfig::default();
        assert!(paths.temp_dir.ends_with("spool"));
        assert!(paths.perm_dir.to_string_lossy().contains("spool/recordings"));
        assert_eq!(paths.extension, ".spool");
    }

    #[test]
    fn test_telemetry_defaults() {
        let telemetry = TelemetryConfig::default();
        assert_eq!(telemetry.log_level, "info");
    }
}
