//! Resolution settings.
//!
//! A [`ResolutionConfig`] is built once per run, from a TOML file or the
//! `with_*` builders, and is only read afterwards.
//!
//! ```toml
//! frozen = true
//! source-mode = "strict"
//! disable-checksum-validation = false
//! record-checksums = true
//! update-mode = "conservative"
//! local = false
//! tool-version = "2.6.0"
//! ```

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How ambiguous source choices are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    /// Ambiguity and aggregate lock sections are warnings.
    #[default]
    Lenient,
    /// Ambiguity and aggregate lock sections are errors.
    Strict,
}

/// Version ordering used when updating locked packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    /// Prefer the smallest version change.
    #[default]
    Conservative,
    /// Prefer the newest version.
    Aggressive,
}

/// Settings threaded through every step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ResolutionConfig {
    frozen: bool,
    source_mode: SourceMode,
    disable_checksum_validation: bool,
    record_checksums: bool,
    update_mode: UpdateMode,
    local: bool,
    tool_version: semver::Version,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            frozen: false,
            source_mode: SourceMode::default(),
            disable_checksum_validation: false,
            record_checksums: true,
            update_mode: UpdateMode::default(),
            local: false,
            tool_version: current_tool_version(),
        }
    }
}

fn current_tool_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

impl ResolutionConfig {
    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown keys.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Refuse to change the lockfile.
    #[must_use]
    pub fn with_frozen(mut self, frozen: bool) -> Self {
        self.frozen = frozen;
        self
    }

    #[must_use]
    pub fn with_source_mode(mut self, mode: SourceMode) -> Self {
        self.source_mode = mode;
        self
    }

    #[must_use]
    pub fn with_checksum_validation(mut self, enabled: bool) -> Self {
        self.disable_checksum_validation = !enabled;
        self
    }

    #[must_use]
    pub fn with_record_checksums(mut self, record: bool) -> Self {
        self.record_checksums = record;
        self
    }

    #[must_use]
    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    /// Resolve from the lockfile and local cache only.
    #[must_use]
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Version written to `BUNDLED WITH`.
    #[must_use]
    pub fn with_tool_version(mut self, version: semver::Version) -> Self {
        self.tool_version = version;
        self
    }

    #[must_use]
    pub fn frozen(&self) -> bool {
        self.frozen
    }

    #[must_use]
    pub fn source_mode(&self) -> SourceMode {
        self.source_mode
    }

    /// Returns true in strict source mode.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.source_mode == SourceMode::Strict
    }

    #[must_use]
    pub fn validates_checksums(&self) -> bool {
        !self.disable_checksum_validation
    }

    #[must_use]
    pub fn records_checksums(&self) -> bool {
        self.record_checksums
    }

    #[must_use]
    pub fn update_mode(&self) -> UpdateMode {
        self.update_mode
    }

    #[must_use]
    pub fn local(&self) -> bool {
        self.local
    }

    #[must_use]
    pub fn tool_version(&self) -> &semver::Version {
        &self.tool_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ResolutionConfig::default();
        assert!(!config.frozen());
        assert_eq!(config.source_mode(), SourceMode::Lenient);
        assert!(config.validates_checksums());
        assert!(config.records_checksums());
        assert_eq!(config.update_mode(), UpdateMode::Conservative);
        assert!(!config.local());
        assert_eq!(config.tool_version().to_string(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn parse_overrides() {
        let config = ResolutionConfig::parse(
            r#"
frozen = true
source-mode = "strict"
disable-checksum-validation = true
record-checksums = false
update-mode = "aggressive"
tool-version = "2.6.0"
"#,
        )
        .unwrap();
        assert!(config.frozen());
        assert!(config.is_strict());
        assert!(!config.validates_checksums());
        assert!(!config.records_checksums());
        assert_eq!(config.update_mode(), UpdateMode::Aggressive);
        assert_eq!(*config.tool_version(), semver::Version::new(2, 6, 0));
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(ResolutionConfig::parse("").unwrap(), ResolutionConfig::default());
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            ResolutionConfig::parse("frozn = true"),
            Err(ConfigError::Parse(_))
        ));
        assert!(ResolutionConfig::parse("source-mode = \"loose\"").is_err());
    }

    #[test]
    fn builders() {
        let config = ResolutionConfig::default()
            .with_frozen(true)
            .with_checksum_validation(false)
            .with_local(true);
        assert!(config.frozen());
        assert!(!config.validates_checksums());
        assert!(config.local());
    }
}
