//! Program configuration, read from a TOML file.
//!
//! ```toml
//! process_names = ["SGuard64.exe", "SGuardSvc64.exe"]
//! interval_seconds = 60
//! tick_milliseconds = 1000
//! ```
//!
//! Every key is optional. Unknown keys are rejected.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::{AllowList, Schedule};

/// Processes targeted when the configuration names none.
pub const DEFAULT_PROCESS_NAMES: &[&str] = &["SGuard64.exe", "SGuardSvc64.exe"];

/// Seconds between two binding passes when the configuration does not say.
pub const DEFAULT_INTERVAL_SECONDS: u64 = 60;

/// Milliseconds between two progress ticks when the configuration does not say.
pub const DEFAULT_TICK_MILLISECONDS: u64 = 1000;

/// Settings of the binding worker.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    process_names: Vec<String>,
    interval_seconds: u64,
    tick_milliseconds: u64,
}

impl Config {
    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] if the text is not valid TOML or has unknown or mistyped keys,
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str()`][Self::from_toml_str].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&text)
    }

    /// Names of the processes to bind.
    #[must_use]
    pub fn process_names(&self) -> &[String] {
        &self.process_names
    }

    /// The process names as an allow-list.
    #[must_use]
    pub fn allow_list(&self) -> AllowList {
        self.process_names.iter().map(String::as_str).collect()
    }

    /// Delay between the end of one pass and the start of the next.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Delay between two progress ticks while waiting for the next pass.
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_milliseconds)
    }

    /// The worker schedule described by this configuration.
    #[must_use]
    pub fn schedule(&self) -> Schedule {
        Schedule::new(self.interval(), self.tick())
    }

    /// Overrides the pass interval.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `seconds` is zero.
    pub fn set_interval_seconds(&mut self, seconds: u64) -> Result<(), ConfigError> {
        if seconds == 0 {
            return Err(ConfigError::Invalid("interval_seconds must be greater than zero"));
        }

        self.interval_seconds = seconds;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds == 0 {
            return Err(ConfigError::Invalid("interval_seconds must be greater than zero"));
        }

        if self.tick_milliseconds == 0 {
            return Err(ConfigError::Invalid("tick_milliseconds must be greater than zero"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            process_names: DEFAULT_PROCESS_NAMES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            tick_milliseconds: DEFAULT_TICK_MILLISECONDS,
        }
    }
}

/// Errors that can occur while loading the configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration file {}: {source}", .path.display())]
    Read {
        /// The file we attempted to read.
        path: PathBuf,

        /// The underlying I/O error.
        source: io::Error,
    },

    /// The configuration is not valid TOML or does not have the expected shape.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ConfigError: Send, Sync, std::error::Error);

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.process_names(), ["SGuard64.exe", "SGuardSvc64.exe"]);
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.tick(), Duration::from_secs(1));
    }

    #[test]
    fn all_keys() {
        let config = Config::from_toml_str(
            r#"
process_names = ["a.exe", "b.exe"]
interval_seconds = 5
tick_milliseconds = 250
"#,
        )
        .unwrap();

        assert!(config.allow_list().contains("a.exe"));
        assert!(config.allow_list().contains("b.exe"));
        assert_eq!(config.allow_list().len(), 2);
        assert_eq!(
            config.schedule(),
            Schedule::new(Duration::from_secs(5), Duration::from_millis(250))
        );
    }

    #[test]
    fn empty_process_list_is_allowed() {
        let config = Config::from_toml_str("process_names = []").unwrap();

        assert!(config.allow_list().is_empty());
    }

    #[test]
    fn zero_interval_is_invalid() {
        assert!(matches!(
            Config::from_toml_str("interval_seconds = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml_str("tick_milliseconds = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("process_name = [\"a.exe\"]"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn wrong_type_is_rejected() {
        assert!(matches!(
            Config::from_toml_str("interval_seconds = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn interval_override() {
        let mut config = Config::default();

        config.set_interval_seconds(15).unwrap();
        assert_eq!(config.interval(), Duration::from_secs(15));

        assert!(config.set_interval_seconds(0).is_err());
        assert_eq!(config.interval(), Duration::from_secs(15));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "process_names = [\"x.exe\"]").unwrap();
        file.flush().unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.process_names(), ["x.exe"]);
        assert_eq!(config.interval(), Duration::from_secs(60));
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let error = Config::load(&path).unwrap_err();

        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().contains("missing.toml"));
    }
}
