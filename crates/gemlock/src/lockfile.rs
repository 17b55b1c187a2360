//! The lockfile (`gems.lock`) model and its text format.
//!
//! ```text
//! GEM
//!   remote: https://gem.repo1/
//!   specs:
//!     myrack (1.0.0)
//!     myrack-obama (1.0)
//!       myrack
//!
//! PLATFORMS
//!   ruby
//!
//! DEPENDENCIES
//!   myrack-obama
//!   thin!
//!
//! CHECKSUMS
//!   myrack (1.0.0) sha256=...
//!
//! BUNDLED WITH
//!    2.6.0
//! ```
//!
//! Serialization is canonical: identical inputs always give identical bytes.

use crate::checksum::Checksum;
use crate::source::{Dependency, SourceId};
use crate::version::{GemVersion, Requirement};
use log::debug;
use std::fmt::{self, Write as _};
use thiserror::Error;

/// Default lockfile name.
pub const LOCK_FILE: &str = "gems.lock";

/// Errors parsing a lockfile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {reason}")]
pub struct LockfileError {
    pub line: usize,
    pub reason: String,
}

/// A locked package version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedSpec {
    pub name: String,
    pub version: GemVersion,
    pub dependencies: Vec<Dependency>,
}

/// A `GEM` section: specs resolved from the listed remotes.
///
/// A section with more than one remote is an aggregate section, written by
/// older tools that did not record which remote a spec came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSection {
    pub remotes: Vec<SourceId>,
    pub specs: Vec<LockedSpec>,
}

impl SourceSection {
    /// Returns true if the section lists more than one remote.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.remotes.len() > 1
    }

    /// The remote of a single-remote section.
    #[must_use]
    pub fn single_remote(&self) -> Option<&SourceId> {
        match self.remotes.as_slice() {
            [remote] => Some(remote),
            _ => None,
        }
    }
}

/// A top-level requirement as recorded in `DEPENDENCIES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedDependency {
    pub name: String,
    pub requirement: Requirement,
    /// Written as a trailing `!`: the requirement is tied to a source.
    pub source_bound: bool,
}

/// A `CHECKSUMS` entry. The digest is absent when it was unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub name: String,
    pub version: GemVersion,
    pub checksum: Option<Checksum>,
}

/// A complete lockfile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockedSet {
    pub sections: Vec<SourceSection>,
    pub platforms: Vec<String>,
    pub dependencies: Vec<LockedDependency>,
    /// `None` when the lockfile has no CHECKSUMS section.
    pub checksums: Option<Vec<ChecksumEntry>>,
    pub bundled_with: Option<semver::Version>,
}

impl LockedSet {
    /// Put every list into canonical order.
    pub fn normalize(&mut self) {
        for section in &mut self.sections {
            section.remotes.sort();
            section.remotes.dedup();
            section
                .specs
                .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
            for spec in &mut section.specs {
                spec.dependencies.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
        self.sections.sort_by(|a, b| a.remotes.cmp(&b.remotes));
        self.platforms.sort();
        self.platforms.dedup();
        self.dependencies.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(checksums) = &mut self.checksums {
            checksums.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        }
    }

    /// Every locked spec with the section it belongs to.
    pub fn specs(&self) -> impl Iterator<Item = (&SourceSection, &LockedSpec)> {
        self.sections
            .iter()
            .flat_map(|section| section.specs.iter().map(move |spec| (section, spec)))
    }

    /// Find the locked spec for `name`.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<(&SourceSection, &LockedSpec)> {
        self.specs().find(|(_, spec)| spec.name == name)
    }

    /// Returns true if any section lists more than one remote.
    #[must_use]
    pub fn has_aggregate_sections(&self) -> bool {
        self.sections.iter().any(SourceSection::is_aggregate)
    }

    /// Find the top-level entry for `name`.
    #[must_use]
    pub fn dependency(&self, name: &str) -> Option<&LockedDependency> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    /// The recorded digest for a spec.
    #[must_use]
    pub fn checksum(&self, name: &str, version: &GemVersion) -> Option<Checksum> {
        self.checksums
            .as_ref()?
            .iter()
            .find(|c| c.name == name && c.version == *version)
            .and_then(|c| c.checksum)
    }

    /// Every remote named by any section.
    pub fn remotes(&self) -> impl Iterator<Item = &SourceId> {
        self.sections.iter().flat_map(|s| &s.remotes)
    }

    /// Parse lockfile text.
    ///
    /// Unknown sections are skipped.
    ///
    /// # Errors
    ///
    /// Returns the line number and reason of the first malformed line.
    pub fn parse(text: &str) -> Result<Self, LockfileError> {
        Parser::default().parse(text)
    }

    /// Parse raw lockfile bytes, which must be valid UTF-8.
    ///
    /// # Errors
    ///
    /// Invalid UTF-8 is reported on the line where it starts, otherwise as
    /// [`LockedSet::parse`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LockfileError> {
        let text = std::str::from_utf8(bytes).map_err(|err| {
            let valid = &bytes[..err.valid_up_to()];
            LockfileError {
                line: valid.iter().filter(|&&b| b == b'\n').count() + 1,
                reason: "invalid UTF-8".to_string(),
            }
        })?;
        Self::parse(text)
    }

    /// Canonical text form. The receiver is expected to be normalized.
    #[must_use]
    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

fn write_requirement(out: &mut fmt::Formatter<'_>, requirement: &Requirement) -> fmt::Result {
    if requirement.is_any() {
        Ok(())
    } else {
        write!(out, " ({requirement})")
    }
}

impl fmt::Display for LockedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for section in &self.sections {
            writeln!(f, "GEM")?;
            for remote in &section.remotes {
                writeln!(f, "  remote: {remote}")?;
            }
            writeln!(f, "  specs:")?;
            for spec in &section.specs {
                writeln!(f, "    {} ({})", spec.name, spec.version)?;
                for dep in &spec.dependencies {
                    write!(f, "      {}", dep.name)?;
                    write_requirement(f, &dep.requirement)?;
                    writeln!(f)?;
                }
            }
            writeln!(f)?;
        }

        writeln!(f, "PLATFORMS")?;
        for platform in &self.platforms {
            writeln!(f, "  {platform}")?;
        }
        writeln!(f)?;

        writeln!(f, "DEPENDENCIES")?;
        for dep in &self.dependencies {
            write!(f, "  {}", dep.name)?;
            write_requirement(f, &dep.requirement)?;
            if dep.source_bound {
                f.write_char('!')?;
            }
            writeln!(f)?;
        }

        if let Some(checksums) = &self.checksums {
            writeln!(f)?;
            writeln!(f, "CHECKSUMS")?;
            for entry in checksums {
                write!(f, "  {} ({})", entry.name, entry.version)?;
                if let Some(checksum) = entry.checksum {
                    write!(f, " {checksum}")?;
                }
                writeln!(f)?;
            }
        }

        if let Some(version) = &self.bundled_with {
            writeln!(f)?;
            writeln!(f, "BUNDLED WITH")?;
            writeln!(f, "   {version}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Gem,
    Platforms,
    Dependencies,
    Checksums,
    BundledWith,
    Unknown,
}

#[derive(Debug)]
struct Parser {
    lock: LockedSet,
    state: State,
    line: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            lock: LockedSet::default(),
            state: State::Start,
            line: 0,
        }
    }
}

/// Split `name (inner)` into its parts; the parentheses are optional.
fn split_parens(text: &str) -> (&str, Option<&str>) {
    match text.split_once(" (") {
        Some((name, rest)) => (name, Some(rest.trim_end_matches(')'))),
        None => (text, None),
    }
}

impl Parser {
    fn error(&self, reason: impl Into<String>) -> LockfileError {
        LockfileError {
            line: self.line,
            reason: reason.into(),
        }
    }

    fn parse(mut self, text: &str) -> Result<LockedSet, LockfileError> {
        for (number, raw) in text.lines().enumerate() {
            self.line = number + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let indent = raw.len() - raw.trim_start().len();
            if indent == 0 {
                self.header(raw.trim_end())?;
            } else {
                self.entry(indent, raw.trim())?;
            }
        }
        Ok(self.lock)
    }

    fn header(&mut self, header: &str) -> Result<(), LockfileError> {
        self.state = match header {
            "GEM" => {
                self.lock.sections.push(SourceSection {
                    remotes: Vec::new(),
                    specs: Vec::new(),
                });
                State::Gem
            }
            "PLATFORMS" => State::Platforms,
            "DEPENDENCIES" => State::Dependencies,
            "CHECKSUMS" => {
                self.lock.checksums.get_or_insert_with(Vec::new);
                State::Checksums
            }
            "BUNDLED WITH" => State::BundledWith,
            other => {
                debug!("skipping unknown lockfile section {other}");
                State::Unknown
            }
        };
        Ok(())
    }

    fn entry(&mut self, indent: usize, text: &str) -> Result<(), LockfileError> {
        match self.state {
            State::Start => Err(self.error("entry outside of any section")),
            State::Unknown => Ok(()),
            State::Gem => self.gem_entry(indent, text),
            State::Platforms => {
                self.lock.platforms.push(text.to_string());
                Ok(())
            }
            State::Dependencies => {
                let (text, source_bound) = match text.strip_suffix('!') {
                    Some(stripped) => (stripped, true),
                    None => (text, false),
                };
                let (name, requirement) = split_parens(text);
                let requirement = self.requirement(requirement)?;
                self.lock.dependencies.push(LockedDependency {
                    name: name.to_string(),
                    requirement,
                    source_bound,
                });
                Ok(())
            }
            State::Checksums => {
                let (name_version, digest) = match text.split_once(") ") {
                    Some((head, digest)) => (format!("{head})"), Some(digest.trim())),
                    None => (text.to_string(), None),
                };
                let (name, version) = split_parens(&name_version);
                let version = self.version(version)?;
                let checksum = digest
                    .map(|d| d.parse::<Checksum>().map_err(|e| self.error(e.to_string())))
                    .transpose()?;
                let entry = ChecksumEntry {
                    name: name.to_string(),
                    version,
                    checksum,
                };
                if let Some(checksums) = &mut self.lock.checksums {
                    checksums.push(entry);
                }
                Ok(())
            }
            State::BundledWith => {
                let version = semver::Version::parse(text)
                    .map_err(|e| self.error(format!("invalid tool version '{text}': {e}")))?;
                self.lock.bundled_with = Some(version);
                Ok(())
            }
        }
    }

    fn gem_entry(&mut self, indent: usize, text: &str) -> Result<(), LockfileError> {
        let line = self.line;
        match indent {
            2 => {
                let section = self.lock.sections.last_mut().ok_or_else(|| LockfileError {
                    line,
                    reason: "entry outside of any section".to_string(),
                })?;
                if let Some(uri) = text.strip_prefix("remote:") {
                    let remote = SourceId::parse(uri.trim()).map_err(|reason| LockfileError {
                        line,
                        reason: format!("invalid remote '{}': {reason}", uri.trim()),
                    })?;
                    section.remotes.push(remote);
                } else if text != "specs:" {
                    debug!("ignoring lockfile option on line {line}: {text}");
                }
                Ok(())
            }
            4 => {
                let (name, version) = split_parens(text);
                let version = self.version(version)?;
                if let Some(section) = self.lock.sections.last_mut() {
                    section.specs.push(LockedSpec {
                        name: name.to_string(),
                        version,
                        dependencies: Vec::new(),
                    });
                }
                Ok(())
            }
            6 => {
                let (name, requirement) = split_parens(text);
                let requirement = self.requirement(requirement)?;
                let spec = self
                    .lock
                    .sections
                    .last_mut()
                    .and_then(|s| s.specs.last_mut())
                    .ok_or_else(|| LockfileError {
                        line,
                        reason: "dependency before any spec".to_string(),
                    })?;
                spec.dependencies.push(Dependency::new(name, requirement));
                Ok(())
            }
            _ => Err(self.error(format!("unexpected indentation of {indent} spaces"))),
        }
    }

    fn version(&self, version: Option<&str>) -> Result<GemVersion, LockfileError> {
        let version = version.ok_or_else(|| self.error("missing version"))?;
        GemVersion::parse(version).map_err(|e| self.error(e.to_string()))
    }

    fn requirement(&self, requirement: Option<&str>) -> Result<Requirement, LockfileError> {
        Requirement::parse(requirement.unwrap_or_default()).map_err(|e| self.error(e.to_string()))
    }
}
