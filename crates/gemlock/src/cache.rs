//! Locally cached package artifacts.
//!
//! The cache is only consulted for checksums (and, in local mode, to check a
//! lock can be installed without network access).

use crate::checksum::Checksum;
use crate::version::GemVersion;
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Artifact file extension.
pub const ARTIFACT_EXT: &str = "gem";

/// A cached artifact and its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub version: GemVersion,
    pub checksum: Checksum,
    pub path: PathBuf,
}

/// Access to artifacts already present on this machine.
pub trait ArtifactCache {
    /// Every cached version of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read.
    fn locally_cached_versions(&self, name: &str) -> io::Result<Vec<CachedArtifact>>;
}

/// A cache that holds nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ArtifactCache for NoCache {
    fn locally_cached_versions(&self, _name: &str) -> io::Result<Vec<CachedArtifact>> {
        Ok(Vec::new())
    }
}

/// A flat directory of `<name>-<version>.gem` files.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    root: PathBuf,
}

impl DirectoryCache {
    /// Use `root` as the cache directory. It need not exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact for `name` at `version` is stored.
    #[must_use]
    pub fn artifact_path(&self, name: &str, version: &GemVersion) -> PathBuf {
        self.root.join(format!("{name}-{version}.{ARTIFACT_EXT}"))
    }
}

/// Split `<name>-<version>` at the last dash followed by a valid version.
fn split_file_stem(stem: &str) -> Option<(&str, GemVersion)> {
    let (name, version) = stem.rsplit_once('-')?;
    if name.is_empty() {
        return None;
    }
    GemVersion::parse(version).ok().map(|v| (name, v))
}

impl ArtifactCache for DirectoryCache {
    fn locally_cached_versions(&self, name: &str) -> io::Result<Vec<CachedArtifact>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((found, version)) = split_file_stem(stem) else {
                debug!("skipping unrecognized cache entry {}", path.display());
                continue;
            };
            if found != name {
                continue;
            }
            let checksum = Checksum::digest(&fs::read(&path)?);
            artifacts.push(CachedArtifact {
                version,
                checksum,
                path,
            });
        }
        artifacts.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn split_names_with_dashes() {
        let (name, version) = split_file_stem("myrack-obama-1.0").unwrap();
        assert_eq!(name, "myrack-obama");
        assert_eq!(version.as_str(), "1.0");
        assert!(split_file_stem("noversion").is_none());
        assert!(split_file_stem("-1.0").is_none());
    }

    #[test]
    fn lists_cached_versions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("myrack-1.0.0.gem"), b"one").unwrap();
        fs::write(dir.path().join("myrack-1.2.gem"), b"two").unwrap();
        fs::write(dir.path().join("myrack-obama-1.0.gem"), b"three").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let cache = DirectoryCache::new(dir.path());
        let found = cache.locally_cached_versions("myrack").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].version.as_str(), "1.2");
        assert_eq!(found[1].checksum, Checksum::digest(b"one"));
        assert_eq!(
            found[1].path,
            cache.artifact_path("myrack", &GemVersion::parse("1.0.0").unwrap())
        );
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = DirectoryCache::new(dir.path().join("absent"));
        assert!(cache.locally_cached_versions("myrack").unwrap().is_empty());
        assert!(NoCache.locally_cached_versions("myrack").unwrap().is_empty());
    }
}
