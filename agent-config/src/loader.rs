//! TOML loader with path resolution and size limits.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::schema::KernelConfig;

/// Default config filename, resolved against the working directory.
pub const DEFAULT_CONFIG_NAME: &str = "agent-kernel.toml";
/// Environment variable overriding the config path.
pub const CONFIG_ENV_VAR: &str = "AGENT_KERNEL_CONFIG";
/// Maximum accepted config file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 256 * 1024;

/// Where the effective config path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Passed by the caller.
    Explicit(PathBuf),
    /// Read from [`CONFIG_ENV_VAR`].
    Environment(PathBuf),
    /// [`DEFAULT_CONFIG_NAME`]; allowed to be missing.
    Default(PathBuf),
}

impl ConfigSource {
    /// Returns the resolved path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Explicit(path) | Self::Environment(path) | Self::Default(path) => path,
        }
    }

    fn may_be_missing(&self) -> bool {
        matches!(self, Self::Default(_))
    }
}

/// Resolves the config path from an explicit path, then the supplied
/// environment value, then the default filename.
#[must_use]
pub fn resolve_source(explicit: Option<&Path>, env_value: Option<String>) -> ConfigSource {
    if let Some(path) = explicit {
        return ConfigSource::Explicit(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        return ConfigSource::Environment(PathBuf::from(value));
    }
    ConfigSource::Default(PathBuf::from(DEFAULT_CONFIG_NAME))
}

impl KernelConfig {
    /// Loads and validates configuration.
    ///
    /// A missing default file yields [`KernelConfig::default`]; a missing
    /// explicit or environment-provided file is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when reading, parsing, or validation fails.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let source = resolve_source(path, env::var(CONFIG_ENV_VAR).ok());
        Self::load_from(&source)
    }

    /// Loads and validates configuration from an already resolved source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when reading, parsing, or validation fails.
    pub fn load_from(source: &ConfigSource) -> ConfigResult<Self> {
        let path = source.path();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound && source.may_be_missing() => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        let config = Self::from_bytes(&bytes)?;
        info!(path = %path.display(), "loaded kernel config");
        Ok(config)
    }

    /// Parses and validates configuration from raw file contents.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TooLarge`], [`ConfigError::NotUtf8`],
    /// [`ConfigError::Parse`], or [`ConfigError::Invalid`].
    pub fn from_bytes(bytes: &[u8]) -> ConfigResult<Self> {
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                size: bytes.len(),
                limit: MAX_CONFIG_FILE_SIZE,
            });
        }
        let content = std::str::from_utf8(bytes).map_err(|_| ConfigError::NotUtf8)?;
        Self::from_toml_str(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_telemetry::LogFormat;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("agent-kernel-{}.toml", uuid::Uuid::new_v4()))
    }

    #[test]
    fn resolution_order() {
        let explicit = Path::new("explicit.toml");
        assert_eq!(
            resolve_source(Some(explicit), Some("env.toml".into())),
            ConfigSource::Explicit(explicit.to_path_buf())
        );
        assert_eq!(
            resolve_source(None, Some("env.toml".into())),
            ConfigSource::Environment(PathBuf::from("env.toml"))
        );
        assert_eq!(
            resolve_source(None, Some("  ".into())),
            ConfigSource::Default(PathBuf::from(DEFAULT_CONFIG_NAME))
        );
    }

    #[test]
    fn parses_partial_file_over_defaults() {
        let config = KernelConfig::from_toml_str(
            r#"
            [approval]
            high_ttl_ms = 5000

            [safe_mode]
            error_threshold = 5

            [memory]
            journal_path = "traces.ndjson"

            [telemetry]
            filter = "agent_kernel=debug"
            format = "pretty"
            "#,
        )
        .unwrap();

        assert_eq!(config.approval.high_ttl_ms, 5000);
        assert_eq!(config.approval.low_ttl_ms, 300_000);
        assert_eq!(config.safe_mode.error_threshold, 5);
        assert_eq!(config.audit.window, 50);
        assert_eq!(config.memory.journal_path, Some(PathBuf::from("traces.ndjson")));
        assert_eq!(config.telemetry.format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = KernelConfig::from_toml_str("[approval]\nmystery = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_oversized_and_non_utf8() {
        let big = vec![b'#'; MAX_CONFIG_FILE_SIZE + 1];
        assert!(matches!(
            KernelConfig::from_bytes(&big),
            Err(ConfigError::TooLarge { .. })
        ));
        assert!(matches!(
            KernelConfig::from_bytes(&[0xff, 0xfe]),
            Err(ConfigError::NotUtf8)
        ));
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        let source = ConfigSource::Default(temp_path());
        assert_eq!(KernelConfig::load_from(&source).unwrap(), KernelConfig::default());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = KernelConfig::load(Some(&temp_path())).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn loads_explicit_file() {
        let path = temp_path();
        fs::write(&path, "[scheduler]\nmax_concurrency = 4\n").unwrap();

        let config = KernelConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.max_concurrency, 4);

        let _ = fs::remove_file(path);
    }
}
