//! Manifest (`gems.toml`) parsing and validation.
//!
//! ```toml
//! sources = ["https://gem.repo1"]
//! platforms = ["ruby"]
//!
//! [[gem]]
//! name = "myrack"
//! version = "~> 1.0"
//!
//! [[gem]]
//! name = "handsoap"
//! source = "https://gem.repo3"
//!
//! [[block]]
//! remote = "https://gem.repo4"
//!
//! [[block.gem]]
//! name = "example"
//! ```
//!
//! Sources listed in `sources` are global. A `[[block]]` scopes its gems to
//! its remote, and a `source` key pins a single gem.

use crate::source::SourceId;
use crate::version::{Requirement, VersionError};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Default manifest file name.
pub const MANIFEST_FILE: &str = "gems.toml";

/// Errors that can occur when working with manifests.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid gem name '{0}': {1}")]
    InvalidName(String, &'static str),

    #[error("invalid requirement for '{gem}': {error}")]
    InvalidRequirement { gem: String, error: VersionError },

    #[error("invalid source '{uri}': {reason}")]
    InvalidSource { uri: String, reason: String },

    #[error("gem '{0}' is declared more than once")]
    DuplicateGem(String),

    #[error("gem '{gem}' is inside the block for {block} but pinned to {pin}")]
    ConflictingSource {
        gem: String,
        block: String,
        pin: String,
    },

    #[error("source '{0}' is declared more than once")]
    DuplicateSource(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    sources: Vec<String>,

    #[serde(default)]
    platforms: Vec<String>,

    #[serde(default, rename = "gem")]
    gems: Vec<RawGem>,

    #[serde(default, rename = "block")]
    blocks: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGem {
    name: String,

    /// Comma separated requirement; omitted means `>= 0`.
    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBlock {
    remote: String,

    #[serde(default, rename = "gem")]
    gems: Vec<RawGem>,
}

/// How a top-level requirement is tied to a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceBinding {
    /// Resolved from the global sources.
    Global,
    /// Declared with an explicit `source` option.
    Pinned(SourceId),
    /// Declared inside a source block.
    Scoped(SourceId),
}

/// A top-level requirement declared in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequirement {
    pub name: String,
    pub requirement: Requirement,
    pub binding: SourceBinding,
}

impl PackageRequirement {
    /// The source this requirement must be resolved from, if any.
    #[must_use]
    pub fn source(&self) -> Option<&SourceId> {
        match &self.binding {
            SourceBinding::Global => None,
            SourceBinding::Pinned(id) | SourceBinding::Scoped(id) => Some(id),
        }
    }

    /// Returns true if the requirement is tied to a source. Such requirements
    /// are marked with `!` in the lockfile.
    #[must_use]
    pub fn is_source_bound(&self) -> bool {
        self.source().is_some()
    }
}

/// A validated manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    global_sources: Vec<SourceId>,
    scoped_sources: Vec<SourceId>,
    platforms: Vec<String>,
    requirements: Vec<PackageRequirement>,
}

impl Manifest {
    /// Load a manifest from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a manifest from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the declarations are
    /// inconsistent.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(content)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawManifest) -> Result<Self, ManifestError> {
        let mut manifest = Self {
            platforms: raw.platforms,
            ..Self::default()
        };

        for uri in &raw.sources {
            let id = parse_source(uri)?;
            if manifest.global_sources.contains(&id) {
                return Err(ManifestError::DuplicateSource(id.to_string()));
            }
            manifest.global_sources.push(id);
        }

        for gem in raw.gems {
            let binding = match &gem.source {
                Some(uri) => {
                    let id = parse_source(uri)?;
                    manifest.add_scoped_source(&id);
                    SourceBinding::Pinned(id)
                }
                None => SourceBinding::Global,
            };
            manifest.add_requirement(gem, binding)?;
        }

        for block in raw.blocks {
            let remote = parse_source(&block.remote)?;
            manifest.add_scoped_source(&remote);
            for gem in block.gems {
                if let Some(uri) = &gem.source {
                    let pin = parse_source(uri)?;
                    if pin != remote {
                        return Err(ManifestError::ConflictingSource {
                            gem: gem.name,
                            block: remote.to_string(),
                            pin: pin.to_string(),
                        });
                    }
                }
                manifest.add_requirement(gem, SourceBinding::Scoped(remote.clone()))?;
            }
        }

        manifest.platforms.sort();
        manifest.platforms.dedup();
        Ok(manifest)
    }

    fn add_scoped_source(&mut self, id: &SourceId) {
        if !self.scoped_sources.contains(id) {
            self.scoped_sources.push(id.clone());
        }
    }

    fn add_requirement(&mut self, gem: RawGem, binding: SourceBinding) -> Result<(), ManifestError> {
        validate_name(&gem.name)?;
        if self.requirement(&gem.name).is_some() {
            return Err(ManifestError::DuplicateGem(gem.name));
        }
        let requirement = Requirement::parse(gem.version.as_deref().unwrap_or_default())
            .map_err(|error| ManifestError::InvalidRequirement {
                gem: gem.name.clone(),
                error,
            })?;
        self.requirements.push(PackageRequirement {
            name: gem.name,
            requirement,
            binding,
        });
        Ok(())
    }

    /// Sources declared outside any block, in declaration order.
    #[must_use]
    pub fn global_sources(&self) -> &[SourceId] {
        &self.global_sources
    }

    /// Sources of blocks and pins, in declaration order.
    #[must_use]
    pub fn scoped_sources(&self) -> &[SourceId] {
        &self.scoped_sources
    }

    /// Every declared source, ordered by URI.
    #[must_use]
    pub fn all_sources(&self) -> BTreeSet<SourceId> {
        self.global_sources
            .iter()
            .chain(&self.scoped_sources)
            .cloned()
            .collect()
    }

    /// Returns true if `id` is declared anywhere in the manifest.
    #[must_use]
    pub fn declares(&self, id: &SourceId) -> bool {
        self.global_sources.contains(id) || self.scoped_sources.contains(id)
    }

    /// Sources a resolution cannot do without: those of source-bound
    /// requirements, plus every global source when any requirement is global.
    #[must_use]
    pub fn mandatory_sources(&self) -> BTreeSet<SourceId> {
        let mut mandatory: BTreeSet<SourceId> = self
            .requirements
            .iter()
            .filter_map(|r| r.source().cloned())
            .collect();
        if self.requirements.iter().any(|r| !r.is_source_bound()) {
            mandatory.extend(self.global_sources.iter().cloned());
        }
        mandatory
    }

    /// Declared platforms, sorted.
    #[must_use]
    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Top-level requirements in declaration order.
    #[must_use]
    pub fn requirements(&self) -> &[PackageRequirement] {
        &self.requirements
    }

    /// Look up a top-level requirement by name.
    #[must_use]
    pub fn requirement(&self, name: &str) -> Option<&PackageRequirement> {
        self.requirements.iter().find(|r| r.name == name)
    }
}

fn parse_source(uri: &str) -> Result<SourceId, ManifestError> {
    SourceId::parse(uri).map_err(|reason| ManifestError::InvalidSource {
        uri: uri.to_string(),
        reason,
    })
}

fn validate_name(name: &str) -> Result<(), ManifestError> {
    if name.is_empty() {
        return Err(ManifestError::InvalidName(
            name.to_string(),
            "name cannot be empty",
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ManifestError::InvalidName(
            name.to_string(),
            "name can only contain alphanumeric characters, '-', '_' and '.'",
        ));
    }

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ManifestError::InvalidName(
            name.to_string(),
            "name must start with a letter, digit or underscore",
        ));
    }

    Ok(())
}
