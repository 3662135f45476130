//! Config file discovery, loading, and environment variable overlay.

use crate::{CaptureConfig, ConfigError, InfraConfig, SpoolConfig};
use crate::infra::{PathsConfig, TelemetryConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/spool/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("spool/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("spool.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<SpoolConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from TOML string. Missing sections and keys take defaults.
fn parse_toml(contents: &str, path: &Path) -> Result<SpoolConfig, ConfigError> {
    let mut config: SpoolConfig =
        toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let paths = &mut config.infra.paths;
    paths.temp_dir = expand_path(&paths.temp_dir.to_string_lossy());
    paths.perm_dir = expand_path(&paths.perm_dir.to_string_lossy());
    paths.extension = normalize_extension(&paths.extension);

    if config.capture.default_duration_secs == 0 {
        return Err(ConfigError::Parse {
            path: path.to_path_buf(),
            message: "capture.default_duration_secs must be at least 1".to_string(),
        });
    }

    Ok(config)
}

/// Extensions are stored with their leading dot.
fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{}", ext)
    }
}

/// Pick the overlay value when it differs from the compiled default.
fn layer<T: PartialEq>(base: T, overlay: T, default: &T) -> T {
    if overlay != *default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence field by field.
pub fn merge_configs(base: SpoolConfig, overlay: SpoolConfig) -> SpoolConfig {
    let paths = PathsConfig::default();
    let telemetry = TelemetryConfig::default();
    let capture = CaptureConfig::default();

    SpoolConfig {
        infra: InfraConfig {
            paths: PathsConfig {
                temp_dir: layer(base.infra.paths.temp_dir, overlay.infra.paths.temp_dir, &paths.temp_dir),
                perm_dir: layer(base.infra.paths.perm_dir, overlay.infra.paths.perm_dir, &paths.perm_dir),
                extension: layer(base.infra.paths.extension, overlay.infra.paths.extension, &paths.extension),
            },
            telemetry: TelemetryConfig {
                log_level: layer(
                    base.infra.telemetry.log_level,
                    overlay.infra.telemetry.log_level,
                    &telemetry.log_level,
                ),
            },
        },
        capture: CaptureConfig {
            poll_interval_ms: layer(
                base.capture.poll_interval_ms,
                overlay.capture.poll_interval_ms,
                &capture.poll_interval_ms,
            ),
            block_timeout_ms: layer(
                base.capture.block_timeout_ms,
                overlay.capture.block_timeout_ms,
                &capture.block_timeout_ms,
            ),
            max_batch: layer(base.capture.max_batch, overlay.capture.max_batch, &capture.max_batch),
            default_duration_secs: layer(
                base.capture.default_duration_secs,
                overlay.capture.default_duration_secs,
                &capture.default_duration_secs,
            ),
            empty_batch: layer(base.capture.empty_batch, overlay.capture.empty_batch, &capture.empty_batch),
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut SpoolConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

fn apply_overrides_from<F>(config: &mut SpoolConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut note = |key: &str| sources.env_overrides.push(key.to_string());

    // Paths
    if let Some(v) = lookup("SPOOL_TEMP_DIR") {
        config.infra.paths.temp_dir = expand_path(&v);
        note("SPOOL_TEMP_DIR");
    }
    if let Some(v) = lookup("SPOOL_PERM_DIR") {
        config.infra.paths.perm_dir = expand_path(&v);
        note("SPOOL_PERM_DIR");
    }
    if let Some(v) = lookup("SPOOL_EXTENSION") {
        config.infra.paths.extension = normalize_extension(&v);
        note("SPOOL_EXTENSION");
    }

    // Capture tuning; unparseable or out-of-range values are ignored
    if let Some(v) = lookup("SPOOL_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.capture.poll_interval_ms = v;
        note("SPOOL_POLL_INTERVAL_MS");
    }
    if let Some(v) = lookup("SPOOL_BLOCK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.capture.block_timeout_ms = v;
        note("SPOOL_BLOCK_TIMEOUT_MS");
    }
    if let Some(v) = lookup("SPOOL_MAX_BATCH").and_then(|v| v.parse().ok()) {
        config.capture.max_batch = v;
        note("SPOOL_MAX_BATCH");
    }
    if let Some(v) = lookup("SPOOL_DEFAULT_DURATION_SECS")
        .and_then(|v| v.parse().ok())
        .filter(|secs: &u64| *secs > 0)
    {
        config.capture.default_duration_secs = v;
        note("SPOOL_DEFAULT_DURATION_SECS");
    }
    if let Some(v) = lookup("SPOOL_EMPTY_BATCH").and_then(|v| v.parse().ok()) {
        config.capture.empty_batch = v;
        note("SPOOL_EMPTY_BATCH");
    }

    // Telemetry
    if let Some(v) = lookup("SPOOL_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        note("SPOOL_LOG_LEVEL");
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmptyBatchPolicy;
    use std::collections::HashMap;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[paths]
temp_dir = "/custom/scratch"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.paths.temp_dir, PathBuf::from("/custom/scratch"));
        assert_eq!(config.infra.paths.extension, ".spool");
        assert_eq!(config.capture.block_timeout_ms, 1000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[paths]
temp_dir = "/data/tmp"
perm_dir = "/mnt/perm"
extension = "rec"

[capture]
poll_interval_ms = 5
block_timeout_ms = 50
max_batch = 10
default_duration_secs = 3
empty_batch = "retry"

[telemetry]
log_level = "debug"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.paths.temp_dir, PathBuf::from("/data/tmp"));
        assert_eq!(config.infra.paths.perm_dir, PathBuf::from("/mnt/perm"));
        assert_eq!(config.infra.paths.extension, ".rec");
        assert_eq!(config.capture.poll_interval_ms, 5);
        assert_eq!(config.capture.block_timeout_ms, 50);
        assert_eq!(config.capture.max_batch, 10);
        assert_eq!(config.capture.default_duration_secs, 3);
        assert_eq!(config.capture.empty_batch, EmptyBatchPolicy::Retry);
        assert_eq!(config.infra.telemetry.log_level, "debug");
    }

    #[test]
    fn test_parse_rejects_bad_policy() {
        let toml = "[capture]\nempty_batch = \"sometimes\"\n";
        let err = parse_toml(toml, Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_zero_default_duration() {
        let toml = "[capture]\ndefault_duration_secs = 0\n";
        let err = parse_toml(toml, Path::new("zero.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_zero_default_duration_ignored() {
        let mut config = SpoolConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| {
            (k == "SPOOL_DEFAULT_DURATION_SECS").then(|| "0".to_string())
        });
        assert_eq!(config.capture.default_duration_secs, 10);
        assert!(sources.env_overrides.is_empty());
    }

    #[test]
    fn test_merge_keeps_base_where_overlay_is_default() {
        let mut base = SpoolConfig::default();
        base.capture.max_batch = 42;
        base.infra.telemetry.log_level = "warn".to_string();

        let mut overlay = SpoolConfig::default();
        overlay.capture.poll_interval_ms = 7;

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.capture.max_batch, 42);
        assert_eq!(merged.capture.poll_interval_ms, 7);
        assert_eq!(merged.infra.telemetry.log_level, "warn");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SPOOL_TEMP_DIR", "/env/tmp"),
            ("SPOOL_MAX_BATCH", "9"),
            ("SPOOL_POLL_INTERVAL_MS", "not-a-number"),
            ("SPOOL_EMPTY_BATCH", "retry"),
        ]
        .into_iter()
        .collect();

        let mut config = SpoolConfig::default();
        let mut sources = ConfigSources::default();
        apply_overrides_from(&mut config, &mut sources, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.infra.paths.temp_dir, PathBuf::from("/env/tmp"));
        assert_eq!(config.capture.max_batch, 9);
        assert_eq!(config.capture.poll_interval_ms, 100);
        assert_eq!(config.capture.empty_batch, EmptyBatchPolicy::Retry);
        assert_eq!(
            sources.env_overrides,
            vec!["SPOOL_TEMP_DIR", "SPOOL_MAX_BATCH", "SPOOL_EMPTY_BATCH"]
        );
    }
}
