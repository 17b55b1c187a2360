//! Remote sources, their version indexes and the registry that loads them.
//!
//! A source is identified by its canonical URI. Its index lists every
//! version it offers for each package name, one line per version:
//!
//! ```text
//! # name version dependencies|checksum:<sha256 hex>
//! myrack 1.0.0 |checksum:8f9e...
//! myrack-obama 1.0 myrack:>= 0|checksum:1c2d...
//! thin 1.0 myrack:>= 1&< 3,daemons:~> 1.0
//! ```
//!
//! Indexes are fetched through an [`IndexFetcher`], at most once per run, and
//! the sources a run cannot do without are prefetched in parallel.

use crate::checksum::Checksum;
use crate::error::{ResolveError, Warning};
use crate::version::{GemVersion, Requirement};
use log::debug;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use url::Url;

/// A source could not be fetched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Could not reach host {host}. Check your network connection and try again.")]
pub struct SourceUnreachable {
    /// The source that failed.
    pub uri: SourceId,
    /// The host part of the source URI.
    pub host: String,
    /// Transport-level detail, for logs.
    pub reason: String,
}

impl SourceUnreachable {
    /// Create an error for `uri` with a transport-level reason.
    #[must_use]
    pub fn new(uri: &SourceId, reason: impl Into<String>) -> Self {
        Self {
            uri: uri.clone(),
            host: uri.host(),
            reason: reason.into(),
        }
    }
}

/// A source index could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid index from {uri} on line {line}: {reason}")]
pub struct IndexError {
    pub uri: SourceId,
    pub line: usize,
    pub reason: String,
}

/// Canonical identity of a remote source.
///
/// URIs are normalized by the `url` crate and always end with `/`, so
/// `https://gem.repo1` and `https://gem.repo1/` are the same source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(String);

impl SourceId {
    /// Parse and canonicalize a source URI.
    ///
    /// # Errors
    ///
    /// Returns the parser's message if `uri` is not an absolute URL.
    pub fn parse(uri: &str) -> Result<Self, String> {
        let mut url = Url::parse(uri.trim()).map_err(|e| e.to_string())?;
        if url.cannot_be_a_base() {
            return Err("not a hierarchical URL".to_string());
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(Self(url.into()))
    }

    /// The canonical URI.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host name, used in connectivity errors.
    #[must_use]
    pub fn host(&self) -> String {
        Url::parse(&self.0)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| self.0.clone())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dependency edge: `name` constrained by `requirement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub requirement: Requirement,
}

impl Dependency {
    /// Create a dependency edge.
    #[must_use]
    pub fn new(name: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            name: name.into(),
            requirement,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.requirement)
    }
}

/// One version of a package as offered by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedSpec {
    pub version: GemVersion,
    pub dependencies: Vec<Dependency>,
    pub checksum: Option<Checksum>,
}

/// The parsed index of a single source.
#[derive(Debug, Clone, Default)]
pub struct Index {
    packages: BTreeMap<String, Vec<IndexedSpec>>,
}

impl Index {
    /// Parse index text.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending line if any entry is malformed or
    /// a version is listed twice.
    pub fn parse(uri: &SourceId, bytes: &[u8]) -> Result<Self, IndexError> {
        let error = |line: usize, reason: String| IndexError {
            uri: uri.clone(),
            line,
            reason,
        };
        let text = std::str::from_utf8(bytes).map_err(|e| error(0, e.to_string()))?;

        let mut packages: BTreeMap<String, Vec<IndexedSpec>> = BTreeMap::new();
        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, spec) = parse_entry(line).map_err(|reason| error(number + 1, reason))?;
            let versions = packages.entry(name.clone()).or_default();
            if versions.iter().any(|s| s.version == spec.version) {
                return Err(error(
                    number + 1,
                    format!("duplicate entry for {name} {}", spec.version),
                ));
            }
            versions.push(spec);
        }

        for versions in packages.values_mut() {
            versions.sort_by(|a, b| b.version.cmp(&a.version));
        }
        Ok(Self { packages })
    }

    /// Versions offered for `name`, newest first.
    #[must_use]
    pub fn versions(&self, name: &str) -> &[IndexedSpec] {
        self.packages.get(name).map_or(&[], Vec::as_slice)
    }

    /// Look up one version.
    #[must_use]
    pub fn spec(&self, name: &str, version: &GemVersion) -> Option<&IndexedSpec> {
        self.versions(name).iter().find(|s| s.version == *version)
    }

    /// Returns true if any version of `name` is offered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    /// Number of package names in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns true if the index offers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

fn parse_entry(line: &str) -> Result<(String, IndexedSpec), String> {
    let (body, meta) = match line.split_once('|') {
        Some((body, meta)) => (body.trim(), Some(meta.trim())),
        None => (line, None),
    };

    let mut parts = body.splitn(3, ' ');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or("missing name")?;
    let version = parts.next().ok_or_else(|| format!("missing version for {name}"))?;
    let version = GemVersion::parse(version).map_err(|e| e.to_string())?;

    let mut dependencies = Vec::new();
    if let Some(deps) = parts.next().map(str::trim).filter(|d| !d.is_empty()) {
        for dep in deps.split(',') {
            let (dep_name, req) = dep
                .split_once(':')
                .ok_or_else(|| format!("malformed dependency '{dep}'"))?;
            let requirement =
                Requirement::parse(&req.replace('&', ",")).map_err(|e| e.to_string())?;
            dependencies.push(Dependency::new(dep_name.trim(), requirement));
        }
    }
    dependencies.sort_by(|a, b| a.name.cmp(&b.name));

    let mut checksum = None;
    for field in meta.into_iter().flat_map(|m| m.split(',')) {
        match field.trim().split_once(':') {
            Some(("checksum", hex)) => {
                checksum = Some(Checksum::from_hex(hex.trim()).map_err(|e| e.to_string())?);
            }
            Some((key, _)) => debug!("ignoring index field '{key}' for {name}"),
            None if field.trim().is_empty() => {}
            None => return Err(format!("malformed metadata '{field}'")),
        }
    }

    Ok((
        name.to_string(),
        IndexedSpec {
            version,
            dependencies,
            checksum,
        },
    ))
}

/// Retrieves raw index bytes for a source.
///
/// Implementations perform the network access; everything after the bytes
/// arrive is handled by [`Index::parse`].
pub trait IndexFetcher: Send + Sync {
    /// Fetch the full index of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceUnreachable`] on any transport failure.
    fn fetch_index(&self, source: &SourceId) -> Result<Vec<u8>, SourceUnreachable>;
}

/// An in-memory fetcher serving fixed index texts.
///
/// Sources that were never registered are unreachable. Every call is counted
/// so callers can check how much network a run would have used.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    indexes: BTreeMap<SourceId, Vec<u8>>,
    requests: Mutex<Vec<SourceId>>,
}

impl StaticFetcher {
    /// Create a fetcher with no reachable sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `index` for `uri`.
    ///
    /// # Panics
    ///
    /// Panics if `uri` is not a valid source URI.
    #[must_use]
    pub fn with_index(mut self, uri: &str, index: &str) -> Self {
        let id = SourceId::parse(uri).unwrap_or_else(|e| panic!("invalid source {uri}: {e}"));
        self.indexes.insert(id, index.as_bytes().to_vec());
        self
    }

    /// Sources requested so far, in request order.
    #[must_use]
    pub fn requests(&self) -> Vec<SourceId> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl IndexFetcher for StaticFetcher {
    fn fetch_index(&self, source: &SourceId) -> Result<Vec<u8>, SourceUnreachable> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(source.clone());
        }
        self.indexes
            .get(source)
            .cloned()
            .ok_or_else(|| SourceUnreachable::new(source, "connection refused"))
    }
}

/// Errors from loading a single catalog.
#[derive(Debug, Clone)]
enum LoadError {
    Unreachable(SourceUnreachable),
    Invalid(IndexError),
}

impl From<LoadError> for ResolveError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::Unreachable(e) => Self::SourceUnreachable(e),
            LoadError::Invalid(e) => Self::InvalidIndex(e),
        }
    }
}

/// The lazily loaded index of one source.
pub struct SourceCatalog<'f> {
    id: SourceId,
    fetcher: &'f dyn IndexFetcher,
    index: OnceLock<Result<Index, LoadError>>,
}

impl<'f> SourceCatalog<'f> {
    fn new(id: SourceId, fetcher: &'f dyn IndexFetcher) -> Self {
        Self {
            id,
            fetcher,
            index: OnceLock::new(),
        }
    }

    /// The source this catalog belongs to.
    #[must_use]
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    fn fetch(&self) -> Result<Index, LoadError> {
        debug!("fetching index for {}", self.id);
        let bytes = self
            .fetcher
            .fetch_index(&self.id)
            .map_err(LoadError::Unreachable)?;
        let index = Index::parse(&self.id, &bytes).map_err(LoadError::Invalid)?;
        debug!("{} offers {} packages", self.id, index.len());
        Ok(index)
    }

    /// Fetch the index on first use and return it.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is unreachable or its index is invalid.
    /// Failures are remembered; the source is not fetched again.
    pub fn index(&self) -> Result<&Index, ResolveError> {
        self.index
            .get_or_init(|| self.fetch())
            .as_ref()
            .map_err(|e| e.clone().into())
    }

    /// Like [`Self::index`], but an unreachable source degrades to an empty
    /// index and is reported as a warning.
    fn load_optional(&self) -> Result<Option<Warning>, ResolveError> {
        let mut degraded = None;
        let loaded = self.index.get_or_init(|| match self.fetch() {
            Err(LoadError::Unreachable(e)) => {
                degraded = Some(Warning::UnreachableSource(e));
                Ok(Index::default())
            }
            other => other,
        });
        match loaded {
            Ok(_) => Ok(degraded),
            Err(e) => Err(e.clone().into()),
        }
    }

    /// Versions of `name` offered by this source, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be loaded.
    pub fn versions(&self, name: &str) -> Result<&[IndexedSpec], ResolveError> {
        Ok(self.index()?.versions(name))
    }

    /// Dependency edges of one version, or `None` if the source does not
    /// offer it.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be loaded.
    pub fn dependencies(
        &self,
        name: &str,
        version: &GemVersion,
    ) -> Result<Option<&[Dependency]>, ResolveError> {
        Ok(self
            .index()?
            .spec(name, version)
            .map(|spec| spec.dependencies.as_slice()))
    }

    /// Returns true if the source offers any version of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be loaded.
    pub fn carries(&self, name: &str) -> Result<bool, ResolveError> {
        Ok(self.index()?.contains(name))
    }
}

impl fmt::Debug for SourceCatalog<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCatalog")
            .field("id", &self.id)
            .field("loaded", &self.index.get().is_some())
            .finish_non_exhaustive()
    }
}

/// Catalogs for every source a manifest declares.
#[derive(Debug)]
pub struct SourceRegistry<'f> {
    catalogs: BTreeMap<SourceId, SourceCatalog<'f>>,
}

impl<'f> SourceRegistry<'f> {
    /// Create a registry. Nothing is fetched until a catalog is queried or
    /// [`Self::prefetch`] runs.
    pub fn new(fetcher: &'f dyn IndexFetcher, sources: impl IntoIterator<Item = SourceId>) -> Self {
        let catalogs = sources
            .into_iter()
            .map(|id| (id.clone(), SourceCatalog::new(id, fetcher)))
            .collect();
        Self { catalogs }
    }

    /// The catalog of a declared source.
    #[must_use]
    pub fn catalog(&self, id: &SourceId) -> Option<&SourceCatalog<'f>> {
        self.catalogs.get(id)
    }

    /// All catalogs, ordered by URI.
    pub fn catalogs(&self) -> impl Iterator<Item = &SourceCatalog<'f>> {
        self.catalogs.values()
    }

    /// Versions of `name` offered by `source`; empty for undeclared sources.
    ///
    /// # Errors
    ///
    /// Returns an error if the source's index cannot be loaded.
    pub fn versions(&self, source: &SourceId, name: &str) -> Result<&[IndexedSpec], ResolveError> {
        match self.catalog(source) {
            Some(catalog) => catalog.versions(name),
            None => Ok(&[]),
        }
    }

    /// Fetch every index in parallel.
    ///
    /// A failing source in `mandatory` aborts the run as soon as it is
    /// observed. Any other unreachable source is replaced by an empty index
    /// and reported as a warning.
    ///
    /// # Errors
    ///
    /// Returns the first failure of a mandatory source, or any invalid index.
    pub fn prefetch(&self, mandatory: &BTreeSet<SourceId>) -> Result<Vec<Warning>, ResolveError> {
        let catalogs: Vec<&SourceCatalog<'f>> = self.catalogs.values().collect();
        let warnings = catalogs
            .par_iter()
            .map(|catalog| {
                if mandatory.contains(catalog.id()) {
                    catalog.index().map(|_| None)
                } else {
                    catalog.load_optional()
                }
            })
            .collect::<Result<Vec<Option<Warning>>, ResolveError>>()?;

        Ok(warnings.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUM: &str = "8f9e0b3c4a5d6e7f8091a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f7";

    fn id(uri: &str) -> SourceId {
        SourceId::parse(uri).unwrap()
    }

    #[test]
    fn source_ids_are_canonical() {
        assert_eq!(id("https://gem.repo1"), id("https://gem.repo1/"));
        assert_eq!(id("https://gem.repo1").as_str(), "https://gem.repo1/");
        assert_eq!(
            id("https://scoped.source/extra").as_str(),
            "https://scoped.source/extra/"
        );
        assert_eq!(id("HTTPS://Gem.Repo1").as_str(), "https://gem.repo1/");
        assert_eq!(id("https://gem.repo4/").host(), "gem.repo4");
    }

    #[test]
    fn source_ids_reject_relative_uris() {
        assert!(SourceId::parse("gem.repo1").is_err());
        assert!(SourceId::parse("").is_err());
    }

    #[test]
    fn parse_index_entries() {
        let text = format!(
            "# comment\n\
             myrack 1.0.0 |checksum:{CHECKSUM}\n\
             myrack 0.9.1\n\
             thin 1.0 myrack:>= 1&< 3,daemons:~> 1.0\n"
        );
        let index = Index::parse(&id("https://gem.repo1"), text.as_bytes()).unwrap();

        let versions = index.versions("myrack");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version.as_str(), "1.0.0");
        assert_eq!(versions[0].checksum.unwrap().to_hex(), CHECKSUM);
        assert!(versions[1].checksum.is_none());

        let thin = &index.versions("thin")[0];
        assert_eq!(thin.dependencies.len(), 2);
        assert_eq!(thin.dependencies[0].name, "daemons");
        assert_eq!(thin.dependencies[1].name, "myrack");
        assert_eq!(thin.dependencies[1].requirement.to_string(), ">= 1, < 3");
        assert!(index.versions("missing").is_empty());
    }

    #[test]
    fn parse_index_reports_line_numbers() {
        let err = Index::parse(&id("https://gem.repo1"), b"ok 1.0\n\nbroken\n").unwrap_err();
        assert_eq!(err.line, 3);

        let err = Index::parse(&id("https://gem.repo1"), b"a 1.0\na 1.0.0\n").unwrap_err();
        assert!(err.reason.contains("duplicate"));
    }

    #[test]
    fn unreachable_message_names_host() {
        let err = SourceUnreachable::new(&id("https://gem.repo4"), "timeout");
        assert_eq!(
            err.to_string(),
            "Could not reach host gem.repo4. Check your network connection and try again."
        );
    }

    #[test]
    fn catalogs_fetch_once() {
        let fetcher = StaticFetcher::new().with_index("https://gem.repo1", "myrack 1.0.0\n");
        let registry = SourceRegistry::new(&fetcher, [id("https://gem.repo1")]);
        let catalog = registry.catalog(&id("https://gem.repo1")).unwrap();

        assert!(catalog.carries("myrack").unwrap());
        assert!(!catalog.carries("thin").unwrap());
        let version = GemVersion::parse("1.0").unwrap();
        assert_eq!(catalog.dependencies("myrack", &version).unwrap(), Some(&[][..]));
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[test]
    fn prefetch_fails_on_mandatory_source() {
        let fetcher = StaticFetcher::new().with_index("https://gem.repo1", "myrack 1.0.0\n");
        let sources = [id("https://gem.repo1"), id("https://gem.repo4")];
        let registry = SourceRegistry::new(&fetcher, sources.clone());

        let mandatory: BTreeSet<SourceId> = sources.into_iter().collect();
        let err = registry.prefetch(&mandatory).unwrap_err();
        assert_eq!(err.status_code(), 17);
    }

    #[test]
    fn prefetch_degrades_optional_source() {
        let fetcher = StaticFetcher::new().with_index("https://gem.repo1", "myrack 1.0.0\n");
        let registry =
            SourceRegistry::new(&fetcher, [id("https://gem.repo1"), id("https://gem.repo4")]);

        let mandatory = BTreeSet::from([id("https://gem.repo1")]);
        let warnings = registry.prefetch(&mandatory).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(warnings[0], Warning::UnreachableSource(_)));

        let optional = registry.catalog(&id("https://gem.repo4")).unwrap();
        assert!(optional.versions("myrack").unwrap().is_empty());
    }
}
