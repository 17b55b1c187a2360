//! Package checksums and cross-source validation.
//!
//! Every digest observed for a resolved `(name, version)` is recorded in a
//! [`ChecksumLedger`] together with where it came from. Two origins that
//! disagree about the same artifact are a potential supply-chain attack.

use crate::source::SourceId;
use crate::version::GemVersion;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Errors parsing a checksum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("invalid sha256 digest '{0}'")]
    InvalidDigest(String),

    #[error("unsupported checksum algorithm '{0}'")]
    UnsupportedAlgorithm(String),
}

/// A SHA-256 digest of a package artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Digest raw artifact bytes.
    #[must_use]
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Parse a 64 character hex digest.
    ///
    /// # Errors
    ///
    /// Returns an error if `hex` is not exactly 32 bytes of hex.
    pub fn from_hex(text: &str) -> Result<Self, ChecksumError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|_| ChecksumError::InvalidDigest(text.to_string()))?;
        Ok(Self(bytes))
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256={}", self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    /// Accepts `sha256=<hex>` as written in lockfiles, or bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some(("sha256", hex)) => Self::from_hex(hex),
            Some((algorithm, _)) => Err(ChecksumError::UnsupportedAlgorithm(algorithm.to_string())),
            None => Self::from_hex(s),
        }
    }
}

/// Where a recorded digest came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// The index of a remote source.
    Source(SourceId),
    /// An artifact already present in the local cache.
    Cache(PathBuf),
    /// The CHECKSUMS section of the existing lockfile.
    Lockfile,
}

impl Origin {
    fn is_authoritative(&self) -> bool {
        !matches!(self, Self::Cache(_))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(uri) => write!(f, "the API at {uri}"),
            Self::Cache(path) => write!(f, "the gem at {}", path.display()),
            Self::Lockfile => f.write_str("the lockfile CHECKSUMS"),
        }
    }
}

/// Origins that agree on one digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestGroup {
    pub checksum: Checksum,
    pub origins: Vec<Origin>,
}

/// Disagreeing digests for one resolved package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub name: String,
    pub version: GemVersion,
    /// Ordered by first observation; the chosen source's group comes first.
    pub groups: Vec<DigestGroup>,
}

impl Mismatch {
    fn remediation(&self) -> String {
        let mut out = String::new();
        let cached: Vec<&Origin> = self
            .groups
            .iter()
            .filter(|g| g.origins.iter().all(|o| !o.is_authoritative()))
            .flat_map(|g| &g.origins)
            .collect();
        let trusted = self.groups[0].origins.iter().find(|o| o.is_authoritative());

        match trusted {
            Some(trusted) if !cached.is_empty() => {
                out.push_str(&format!(
                    "If you trust {trusted}, to resolve this issue you can:\n"
                ));
                let mut step = 1;
                for origin in cached {
                    out.push_str(&format!("  {step}. remove {origin}\n"));
                    step += 1;
                }
                out.push_str(&format!("  {step}. install again\n"));
            }
            _ => {
                out.push_str("Mismatched checksums each have an authoritative source:\n");
                let authorities = self
                    .groups
                    .iter()
                    .filter_map(|g| g.origins.iter().find(|o| o.is_authoritative()));
                for (i, origin) in authorities.enumerate() {
                    out.push_str(&format!("  {}. {origin}\n", i + 1));
                }
                out.push_str("You may need to alter your manifest sources to resolve this issue.\n");
            }
        }
        out
    }
}

/// Every mismatch found by [`ChecksumLedger::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MismatchReport {
    pub mismatches: Vec<Mismatch>,
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Found mismatched checksums. This is a potential security risk.")?;
        for mismatch in &self.mismatches {
            for group in &mismatch.groups {
                writeln!(
                    f,
                    "  {} ({}) {}",
                    mismatch.name, mismatch.version, group.checksum
                )?;
                for (i, origin) in group.origins.iter().enumerate() {
                    let lead = if i == 0 { "from" } else { "and" };
                    writeln!(f, "    {lead} {origin}")?;
                }
            }
        }
        for mismatch in &self.mismatches {
            write!(f, "\n{}", mismatch.remediation())?;
        }
        write!(
            f,
            "\nTo ignore checksum security warnings, disable checksum validation with\n  \
             `disable-checksum-validation = true`"
        )
    }
}

/// Collects digests for resolved packages from every origin.
#[derive(Debug, Default)]
pub struct ChecksumLedger {
    records: BTreeMap<(String, GemVersion), Vec<(Origin, Checksum)>>,
}

impl ChecksumLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a digest. Recording the same origin twice keeps the first.
    pub fn record(&mut self, name: &str, version: &GemVersion, origin: Origin, checksum: Checksum) {
        let entry = self
            .records
            .entry((name.to_string(), version.clone()))
            .or_default();
        if !entry.iter().any(|(o, _)| *o == origin) {
            entry.push((origin, checksum));
        }
    }

    /// The first digest recorded for a package, which is the chosen source's
    /// when sources are recorded first.
    #[must_use]
    pub fn preferred(&self, name: &str, version: &GemVersion) -> Option<Checksum> {
        self.records
            .get(&(name.to_string(), version.clone()))
            .and_then(|r| r.first())
            .map(|(_, c)| *c)
    }

    /// Check that every package's recorded digests agree.
    ///
    /// # Errors
    ///
    /// Returns a report listing every package with disagreeing digests.
    pub fn validate(&self) -> Result<(), MismatchReport> {
        let mismatches: Vec<Mismatch> = self
            .records
            .iter()
            .filter_map(|((name, version), records)| {
                let mut groups: Vec<DigestGroup> = Vec::new();
                for (origin, checksum) in records {
                    match groups.iter_mut().find(|g| g.checksum == *checksum) {
                        Some(group) => group.origins.push(origin.clone()),
                        None => groups.push(DigestGroup {
                            checksum: *checksum,
                            origins: vec![origin.clone()],
                        }),
                    }
                }
                (groups.len() > 1).then(|| Mismatch {
                    name: name.clone(),
                    version: version.clone(),
                    groups,
                })
            })
            .collect();

        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(MismatchReport { mismatches })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(uri: &str) -> Origin {
        Origin::Source(SourceId::parse(uri).unwrap())
    }

    fn v(s: &str) -> GemVersion {
        GemVersion::parse(s).unwrap()
    }

    #[test]
    fn digest_known_value() {
        let checksum = Checksum::digest(b"");
        assert_eq!(
            checksum.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum.to_string(), format!("sha256={}", checksum.to_hex()));
    }

    #[test]
    fn parse_lockfile_notation() {
        let checksum = Checksum::digest(b"myrack");
        let parsed: Checksum = checksum.to_string().parse().unwrap();
        assert_eq!(parsed, checksum);
        assert_eq!(checksum.to_hex().parse::<Checksum>().unwrap(), checksum);
        assert!("md5=abc".parse::<Checksum>().is_err());
        assert!(Checksum::from_hex("abc").is_err());
    }

    #[test]
    fn agreeing_origins_validate() {
        let mut ledger = ChecksumLedger::new();
        let digest = Checksum::digest(b"myrack-1.0.0");
        ledger.record("myrack", &v("1.0.0"), source("https://gem.repo1"), digest);
        ledger.record("myrack", &v("1.0.0"), source("https://gem.repo4"), digest);
        ledger.record("myrack", &v("1.0.0"), Origin::Lockfile, digest);
        assert!(ledger.validate().is_ok());
        assert_eq!(ledger.preferred("myrack", &v("1.0")), Some(digest));
    }

    #[test]
    fn disagreeing_sources_report_both() {
        let mut ledger = ChecksumLedger::new();
        let good = Checksum::digest(b"good");
        let evil = Checksum::digest(b"evil");
        ledger.record("myrack", &v("1.0.0"), source("https://gem.repo1"), good);
        ledger.record("myrack", &v("1.0.0"), source("https://gem.repo3"), evil);

        let report = ledger.validate().unwrap_err();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].groups[0].checksum, good);

        let text = report.to_string();
        assert!(text.contains(&format!("myrack (1.0.0) {good}")));
        assert!(text.contains("from the API at https://gem.repo1/"));
        assert!(text.contains(&format!("myrack (1.0.0) {evil}")));
        assert!(text.contains("from the API at https://gem.repo3/"));
        assert!(text.contains("Mismatched checksums each have an authoritative source:"));
        assert!(text.contains("  1. the API at https://gem.repo1/"));
        assert!(text.contains("  2. the API at https://gem.repo3/"));
        assert!(text.contains("disable-checksum-validation"));
    }

    #[test]
    fn cache_only_mismatch_suggests_removal() {
        let mut ledger = ChecksumLedger::new();
        let path = PathBuf::from("/cache/myrack-1.0.0.gem");
        ledger.record(
            "myrack",
            &v("1.0.0"),
            source("https://gem.repo1"),
            Checksum::digest(b"good"),
        );
        ledger.record(
            "myrack",
            &v("1.0.0"),
            Origin::Cache(path),
            Checksum::digest(b"tampered"),
        );

        let text = ledger.validate().unwrap_err().to_string();
        assert!(text.contains("If you trust the API at https://gem.repo1/"));
        assert!(text.contains("  1. remove the gem at /cache/myrack-1.0.0.gem"));
        assert!(text.contains("  2. install again"));
    }

    #[test]
    fn duplicate_origin_is_ignored() {
        let mut ledger = ChecksumLedger::new();
        ledger.record("a", &v("1"), Origin::Lockfile, Checksum::digest(b"one"));
        ledger.record("a", &v("1"), Origin::Lockfile, Checksum::digest(b"two"));
        assert!(ledger.validate().is_ok());
    }
}
