//! Errors and warnings produced by a resolution run.

use crate::checksum::MismatchReport;
use crate::config::ConfigError;
use crate::lockfile::LockfileError;
use crate::manifest::ManifestError;
use crate::priority::AmbiguousSource;
use crate::reconcile::LockChange;
use crate::source::{IndexError, SourceUnreachable};
use std::fmt;
use thiserror::Error;

/// Errors that terminate a resolution run.
///
/// No lockfile is written when a run fails; the previous lock is left as is.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    SourceUnreachable(#[from] SourceUnreachable),

    #[error(transparent)]
    InvalidIndex(#[from] IndexError),

    #[error("{}", .0.render(true))]
    AmbiguousSource(AmbiguousSource),

    #[error("{0}")]
    ChecksumMismatch(MismatchReport),

    #[error("Could not find compatible versions\n\n{explanation}")]
    Unsolvable { explanation: String },

    #[error("{}", format_frozen(.changes))]
    FrozenLock { changes: Vec<LockChange> },

    #[error(
        "Your lockfile contains a single rubygems source section with multiple remotes, \
         which is insecure. Run in non frozen mode and commit the result to make your \
         lockfile secure."
    )]
    AggregateSourceSecurity { remotes: Vec<String> },

    #[error("{}", format_not_found(.name, .requirement, .location, .available))]
    PackageNotFound {
        name: String,
        requirement: Option<String>,
        location: String,
        available: Vec<String>,
    },

    #[error("Could not find gem '{name}' in the lockfile, so it cannot be updated")]
    PackageNotLocked { name: String },

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("lockfile error: {0}")]
    Lockfile(#[from] LockfileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolveError {
    /// The process exit status conventionally used for this error.
    #[must_use]
    pub fn status_code(&self) -> i32 {
        match self {
            Self::SourceUnreachable(_) => 17,
            Self::AmbiguousSource(_) => 4,
            Self::ChecksumMismatch(_) => 37,
            Self::Unsolvable { .. } => 6,
            Self::FrozenLock { .. } | Self::AggregateSourceSecurity { .. } => 16,
            Self::PackageNotFound { .. } | Self::PackageNotLocked { .. } => 7,
            Self::InvalidIndex(_)
            | Self::Manifest(_)
            | Self::Config(_)
            | Self::Lockfile(_)
            | Self::Io(_) => 1,
        }
    }

    /// Returns true for integrity failures (checksum mismatches).
    #[must_use]
    pub fn is_security_error(&self) -> bool {
        matches!(self, Self::ChecksumMismatch(_))
    }
}

fn format_frozen(changes: &[LockChange]) -> String {
    let mut out = String::from("The lockfile can't be updated because frozen mode is set\n");
    for change in changes {
        out.push_str(&format!("\n* {change}"));
    }
    out.push_str("\n\nDisable frozen mode (`frozen = false`) to allow the lockfile to be updated.");
    out
}

fn format_not_found(
    name: &str,
    requirement: &Option<String>,
    location: &str,
    available: &[String],
) -> String {
    let wanted = match requirement {
        Some(req) => format!("{name} ({req})"),
        None => name.to_string(),
    };
    let mut out = format!("Could not find gem '{wanted}' in {location}.");
    if !available.is_empty() {
        out.push_str(&format!(
            "\n\nThe source contains the following gems matching '{name}':"
        ));
        for version in available {
            out.push_str(&format!("\n  * {name}-{version}"));
        }
    }
    out
}

/// Non-fatal conditions collected during a run and returned with its outcome.
#[derive(Debug, Clone)]
pub enum Warning {
    /// A package was found in more than one relevant source.
    AmbiguousSource(AmbiguousSource),
    /// More than one source was declared outside of a source block.
    MultipleGlobalSources,
    /// Checksums disagreed but validation is disabled.
    ChecksumMismatch(MismatchReport),
    /// The lock has a section listing several remotes and was not rewritten.
    AggregateSource,
    /// A source that no requirement depends on could not be fetched.
    UnreachableSource(SourceUnreachable),
    /// The lockfile was written by a newer tool than the running one.
    NewerLockfileTool {
        locked: semver::Version,
        running: semver::Version,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbiguousSource(ambiguity) => f.write_str(&ambiguity.render(false)),
            Self::MultipleGlobalSources => f.write_str(
                "[DEPRECATED] Your manifest contains multiple global sources. Declaring more \
                 than one source outside a block is a security risk, and may result in \
                 installing unexpected gems. To resolve this warning, use a block to indicate \
                 which gems should come from the secondary source.",
            ),
            Self::ChecksumMismatch(report) => write!(f, "{report}"),
            Self::AggregateSource => f.write_str(
                "[DEPRECATED] Your lockfile contains a single rubygems source section with \
                 multiple remotes, which is insecure. Make sure you run in non frozen mode and \
                 commit the result to make your lockfile secure.",
            ),
            Self::UnreachableSource(err) => write!(f, "{err} Continuing without it."),
            Self::NewerLockfileTool { locked, running } => write!(
                f,
                "The running version ({running}) is older than the version that created the \
                 lockfile ({locked})."
            ),
        }
    }
}
