//! Rubygems-style versions and requirements.
//!
//! Gem versions are not semver: they have any number of segments and may mix
//! numeric and alphabetic parts (`6.0.3.4`, `2.0.1.1.forked`, `1.0.0.pre`).

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing versions and requirements.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("malformed version number string '{0}'")]
    Version(String),

    #[error("unknown requirement operator '{op}' in '{requirement}'")]
    Operator { requirement: String, op: String },

    #[error("malformed requirement '{0}'")]
    Requirement(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Segment {
    // Variant order matters: alphabetic segments sort before numeric ones.
    Text(String),
    Number(u64),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

const ZERO: Segment = Segment::Number(0);

/// A package version such as `1.0`, `6.0.3.4` or `1.0.0.pre`.
///
/// Trailing zero segments are insignificant for comparison (`1.0 == 1.0.0`),
/// but the original text is kept for display.
#[derive(Debug, Clone)]
pub struct GemVersion {
    text: String,
    segments: Vec<Segment>,
}

impl GemVersion {
    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is empty, does not start with a digit or
    /// contains characters other than ASCII alphanumerics and dots.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let text = text.trim();
        let malformed = || VersionError::Version(text.to_string());

        if !text.starts_with(|c: char| c.is_ascii_digit())
            || text.ends_with('.')
            || text.contains("..")
        {
            return Err(malformed());
        }

        let mut segments = Vec::new();
        let mut chars = text.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '.' {
                chars.next();
            } else if c.is_ascii_digit() {
                let mut digits = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(d);
                    chars.next();
                }
                let n = digits.parse().map_err(|_| malformed())?;
                segments.push(Segment::Number(n));
            } else if c.is_ascii_alphabetic() {
                let mut word = String::new();
                while let Some(&a) = chars.peek().filter(|a| a.is_ascii_alphabetic()) {
                    word.push(a);
                    chars.next();
                }
                segments.push(Segment::Text(word));
            } else {
                return Err(malformed());
            }
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    fn from_segments(segments: Vec<Segment>) -> Self {
        let text = segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self { text, segments }
    }

    /// The version as originally written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns true if any segment is alphabetic.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Text(_)))
    }

    /// The upper bound used by the pessimistic operator: drop the prerelease
    /// part and the last segment, then increment the new last segment.
    ///
    /// `1.4.2` bumps to `1.5`, `1.4` bumps to `2`, `1` bumps to `2`.
    #[must_use]
    pub fn bump(&self) -> Self {
        let mut release: Vec<Segment> = self
            .segments
            .iter()
            .take_while(|s| matches!(s, Segment::Number(_)))
            .cloned()
            .collect();
        if release.len() > 1 {
            release.pop();
        }
        match release.last_mut() {
            Some(Segment::Number(n)) => *n += 1,
            _ => release.push(Segment::Number(1)),
        }
        Self::from_segments(release)
    }

    fn canonical(&self) -> &[Segment] {
        let end = self
            .segments
            .iter()
            .rposition(|s| *s != ZERO)
            .map_or(0, |i| i + 1);
        &self.segments[..end]
    }
}

impl PartialEq for GemVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GemVersion {}

impl Hash for GemVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl Ord for GemVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let zero = ZERO;
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).unwrap_or(&zero);
            let b = other.segments.get(i).unwrap_or(&zero);
            match a.cmp(b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for GemVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for GemVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for GemVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A comparison operator in a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// `~>`, the pessimistic operator.
    Pessimistic,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Pessimistic => "~>",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `op version` predicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Comparator {
    pub op: Op,
    pub version: GemVersion,
}

impl Comparator {
    /// Check a version against this predicate.
    #[must_use]
    pub fn matches(&self, version: &GemVersion) -> bool {
        match self.op {
            Op::Eq => version == &self.version,
            Op::Ne => version != &self.version,
            Op::Gt => version > &self.version,
            Op::Lt => version < &self.version,
            Op::Ge => version >= &self.version,
            Op::Le => version <= &self.version,
            Op::Pessimistic => version >= &self.version && version < &self.version.bump(),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.version)
    }
}

impl FromStr for Comparator {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| VersionError::Requirement(s.to_string()))?;
        let (op, version) = s.split_at(split);
        let op = match op.trim() {
            "" | "=" => Op::Eq,
            "!=" => Op::Ne,
            ">" => Op::Gt,
            "<" => Op::Lt,
            ">=" => Op::Ge,
            "<=" => Op::Le,
            "~>" => Op::Pessimistic,
            other => {
                return Err(VersionError::Operator {
                    requirement: s.to_string(),
                    op: other.to_string(),
                })
            }
        };
        Ok(Self {
            op,
            version: GemVersion::parse(version)?,
        })
    }
}

/// A set of comparators that must all hold, e.g. `~> 1.0, >= 1.0.2`.
///
/// Comparators keep their declaration order for display; equality ignores it.
#[derive(Debug, Clone, Eq)]
pub struct Requirement {
    comparators: Vec<Comparator>,
}

impl Requirement {
    /// The requirement every version satisfies: `>= 0`.
    #[must_use]
    pub fn any() -> Self {
        Self {
            comparators: vec![Comparator {
                op: Op::Ge,
                version: GemVersion::from_segments(vec![ZERO]),
            }],
        }
    }

    /// A requirement pinning exactly one version.
    #[must_use]
    pub fn exact(version: &GemVersion) -> Self {
        Self {
            comparators: vec![Comparator {
                op: Op::Eq,
                version: version.clone(),
            }],
        }
    }

    /// Parse a comma separated list of comparators. An empty string is `>= 0`.
    ///
    /// # Errors
    ///
    /// Returns an error if any comparator is malformed.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::any());
        }
        let comparators = text
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<Comparator>, _>>()?;
        Ok(Self { comparators })
    }

    /// The comparators in declaration order.
    #[must_use]
    pub fn comparators(&self) -> &[Comparator] {
        &self.comparators
    }

    /// Returns true if this is the unconstrained `>= 0` requirement.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.comparators
            .iter()
            .all(|c| c.op == Op::Ge && c.version.canonical().is_empty())
    }

    /// Returns true if a comparator names a prerelease version, which opts
    /// this requirement into prerelease candidates.
    #[must_use]
    pub fn allows_prerelease(&self) -> bool {
        self.comparators.iter().any(|c| c.version.is_prerelease())
    }

    /// Check a version against every comparator.
    #[must_use]
    pub fn matches(&self, version: &GemVersion) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    fn sorted(&self) -> Vec<&Comparator> {
        let mut sorted: Vec<_> = self.comparators.iter().collect();
        sorted.sort();
        sorted.dedup();
        sorted
    }
}

impl Default for Requirement {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        (self.is_any() && other.is_any()) || self.sorted() == other.sorted()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.comparators.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(", "))
    }
}

impl FromStr for Requirement {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> GemVersion {
        GemVersion::parse(s).unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    #[test]
    fn test_trailing_zeros_are_insignificant() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("1.0").to_string(), "1.0");
        assert!(v("1.0.1") > v("1.0"));
    }

    #[test]
    fn test_multi_segment_ordering() {
        assert!(v("6.1.2.1") > v("6.0.3.4"));
        assert!(v("2.0.1.1.forked") > v("2.0.1.1"));
        assert!(v("0.2.5.5") < v("0.3"));
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        assert!(v("1.0.0.pre") < v("1.0.0"));
        assert!(v("1.0.a") < v("1.0.b"));
        assert!(v("1.0a1").is_prerelease());
        assert!(!v("1.0.1").is_prerelease());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(GemVersion::parse("").is_err());
        assert!(GemVersion::parse("v1.0").is_err());
        assert!(GemVersion::parse("1..0").is_err());
        assert!(GemVersion::parse("1.0-beta").is_err());
    }

    #[test]
    fn test_bump() {
        assert_eq!(v("1.4.2").bump(), v("1.5"));
        assert_eq!(v("1.4").bump(), v("2"));
        assert_eq!(v("5").bump(), v("6"));
        assert_eq!(v("1.0.0.pre").bump(), v("1.1"));
    }

    #[test]
    fn test_pessimistic_requirement() {
        let r = req("~> 1.4");
        assert!(r.matches(&v("1.4")));
        assert!(r.matches(&v("1.9.9")));
        assert!(!r.matches(&v("2.0")));

        let r = req("~> 2.2, >= 2.2.2");
        assert!(!r.matches(&v("2.2.1")));
        assert!(r.matches(&v("2.4.2")));
    }

    #[test]
    fn test_range_requirement() {
        let r = req(">= 0.7, < 2");
        assert!(r.matches(&v("1.8.9")));
        assert!(!r.matches(&v("2")));
        assert!(!r.matches(&v("0.6")));
    }

    #[test]
    fn test_bare_version_is_exact() {
        let r = req("1.0.0");
        assert!(r.matches(&v("1.0")));
        assert!(!r.matches(&v("1.0.1")));
        assert_eq!(r.to_string(), "= 1.0.0");
    }

    #[test]
    fn test_default_requirement() {
        assert!(req("").is_any());
        assert!(req(">= 0").is_any());
        assert!(!req(">= 1").is_any());
        assert_eq!(Requirement::any().to_string(), ">= 0");
    }

    #[test]
    fn test_display_keeps_declaration_order() {
        assert_eq!(req("~> 1.0, >= 1.0.2").to_string(), "~> 1.0, >= 1.0.2");
    }

    #[test]
    fn test_equality_ignores_order() {
        assert_eq!(req(">= 0.7, < 2"), req("< 2, >= 0.7"));
        assert_ne!(req(">= 0.7"), req(">= 0.8"));
    }

    #[test]
    fn test_invalid_operator() {
        assert!(matches!(
            Requirement::parse("=> 1.0"),
            Err(VersionError::Operator { .. })
        ));
        assert!(Requirement::parse(">=").is_err());
    }

    #[test]
    fn test_allows_prerelease() {
        assert!(req(">= 1.0.0.pre").allows_prerelease());
        assert!(!req(">= 1.0").allows_prerelease());
    }
}
