//! A complete resolution run: read the previous lock, decide whether it can be
//! reused, resolve what changed, verify checksums and write the new lock.

use crate::cache::{ArtifactCache, NoCache};
use crate::checksum::{ChecksumLedger, Origin};
use crate::config::ResolutionConfig;
use crate::error::{ResolveError, Warning};
use crate::lockfile::{ChecksumEntry, LockedDependency, LockedSet, LockedSpec, SourceSection};
use crate::manifest::Manifest;
use crate::priority::SourcePriorityResolver;
use crate::provider::{Pins, SourceCandidates};
use crate::reconcile::{LockChange, LockReconciler, Plan, Request, UpdateScope};
use crate::solver::{CandidateProvider, Solution, VersionSolver};
use crate::source::{IndexFetcher, SourceId, SourceRegistry};
use crate::storage::LockStorage;
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const DEFAULT_PLATFORM: &str = "ruby";
const LOCAL_LOCATION: &str = "locally installed gems";

/// The result of a successful run.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The lock now in effect.
    pub lock: LockedSet,
    /// Whether new lockfile bytes were written.
    pub written: bool,
    /// Whether the previous lock was used without running the solver.
    pub reused: bool,
    pub warnings: Vec<Warning>,
}

/// Everything a run needs, borrowed from the caller.
pub struct Resolution<'a> {
    manifest: &'a Manifest,
    config: &'a ResolutionConfig,
    fetcher: &'a dyn IndexFetcher,
    storage: &'a dyn LockStorage,
    cache: &'a dyn ArtifactCache,
}

impl<'a> Resolution<'a> {
    #[must_use]
    pub fn new(
        manifest: &'a Manifest,
        config: &'a ResolutionConfig,
        fetcher: &'a dyn IndexFetcher,
        storage: &'a dyn LockStorage,
    ) -> Self {
        Self {
            manifest,
            config,
            fetcher,
            storage,
            cache: &NoCache,
        }
    }

    /// Use `cache` for offline runs and checksum verification.
    #[must_use]
    pub fn with_cache(mut self, cache: &'a dyn ArtifactCache) -> Self {
        self.cache = cache;
        self
    }

    /// Install: reuse the lock at `lock_path` when possible.
    ///
    /// # Errors
    ///
    /// See [`Resolution::run`].
    pub fn install(&self, lock_path: &Path) -> Result<Outcome, ResolveError> {
        self.run(lock_path, &Request::Install)
    }

    /// Update the named packages, or everything when `names` is empty.
    ///
    /// # Errors
    ///
    /// See [`Resolution::run`].
    pub fn update<I, S>(&self, lock_path: &Path, names: I) -> Result<Outcome, ResolveError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let scope = if names.is_empty() {
            UpdateScope::All
        } else {
            UpdateScope::Only(names)
        };
        self.run(lock_path, &Request::Update(scope))
    }

    /// Run one resolution against the lock at `lock_path`.
    ///
    /// The lockfile is written only when the run succeeds and its serialized
    /// form differs from what is on disk.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolveError`] for unreachable sources, unsolvable
    /// manifests, checksum mismatches, frozen-mode violations and strict
    /// source ambiguities. Nothing is written on error.
    pub fn run(&self, lock_path: &Path, request: &Request) -> Result<Outcome, ResolveError> {
        let previous_bytes = self.storage.read_lock(lock_path)?;
        let previous = match &previous_bytes {
            Some(bytes) => Some(LockedSet::from_bytes(bytes)?),
            None => None,
        };

        let mut warnings = Vec::new();
        if self.manifest.global_sources().len() > 1 {
            warnings.push(Warning::MultipleGlobalSources);
        }
        if let Some(locked) = previous.as_ref().and_then(|lock| lock.bundled_with.as_ref()) {
            if locked > self.config.tool_version() {
                warnings.push(Warning::NewerLockfileTool {
                    locked: locked.clone(),
                    running: self.config.tool_version().clone(),
                });
            }
        }

        let plan = LockReconciler::new(self.manifest, previous.as_ref(), self.config).plan(request)?;
        let outcome = match plan {
            Plan::Reuse {
                lock,
                rewrite,
                warnings: extra,
            } => {
                warnings.extend(extra);
                let ledger = self.reuse(&lock, &mut warnings)?;
                let (lock, written) = if rewrite {
                    let lock = self.refresh(lock, &ledger);
                    let written = self.write_if_changed(lock_path, previous_bytes.as_deref(), &lock)?;
                    (lock, written)
                } else {
                    (lock, false)
                };
                Outcome {
                    lock,
                    written,
                    reused: true,
                    warnings,
                }
            }
            Plan::Resolve {
                pins,
                locked_sources,
                changes,
            } => {
                for change in &changes {
                    debug!("re-resolving: {change}");
                }
                let lock = self.resolve(
                    previous.as_ref(),
                    &pins,
                    locked_sources,
                    &changes,
                    &mut warnings,
                )?;
                let written = self.write_if_changed(lock_path, previous_bytes.as_deref(), &lock)?;
                Outcome {
                    lock,
                    written,
                    reused: false,
                    warnings,
                }
            }
        };

        for warning in &outcome.warnings {
            warn!("{warning}");
        }
        Ok(outcome)
    }

    fn write_if_changed(
        &self,
        lock_path: &Path,
        previous: Option<&[u8]>,
        lock: &LockedSet,
    ) -> Result<bool, ResolveError> {
        let bytes = lock.serialize();
        let written = previous != Some(bytes.as_bytes());
        if written {
            info!("writing {}", lock_path.display());
            self.storage.write_lock(lock_path, bytes.as_bytes())?;
        }
        Ok(written)
    }

    /// Verify a reusable lock against every digest available without
    /// resolving, and return the ledger.
    fn reuse(&self, lock: &LockedSet, warnings: &mut Vec<Warning>) -> Result<ChecksumLedger, ResolveError> {
        let mut ledger = ChecksumLedger::new();

        // Aggregate sections say nothing about which remote served a spec, so
        // every remote listed is asked for its digest. Offline runs skip this.
        let aggregate: Vec<SourceId> = lock
            .sections
            .iter()
            .filter(|section| section.is_aggregate() && !self.config.local())
            .flat_map(|section| section.remotes.iter().cloned())
            .collect();
        let registry = SourceRegistry::new(self.fetcher, aggregate);
        for (section, spec) in lock.specs().filter(|(section, _)| section.is_aggregate()) {
            for remote in &section.remotes {
                let offered = registry.versions(remote, &spec.name)?;
                if let Some(checksum) = offered
                    .iter()
                    .find(|s| s.version == spec.version)
                    .and_then(|s| s.checksum)
                {
                    ledger.record(&spec.name, &spec.version, Origin::Source(remote.clone()), checksum);
                }
            }
        }

        for (_, spec) in lock.specs() {
            if let Some(checksum) = lock.checksum(&spec.name, &spec.version) {
                ledger.record(&spec.name, &spec.version, Origin::Lockfile, checksum);
            }
            let cached = self.cache.locally_cached_versions(&spec.name)?;
            match cached.iter().find(|artifact| artifact.version == spec.version) {
                Some(artifact) => ledger.record(
                    &spec.name,
                    &spec.version,
                    Origin::Cache(artifact.path.clone()),
                    artifact.checksum,
                ),
                None if self.config.local() => {
                    return Err(ResolveError::PackageNotFound {
                        name: spec.name.clone(),
                        requirement: Some(format!("= {}", spec.version)),
                        location: LOCAL_LOCATION.to_string(),
                        available: cached.iter().map(|a| a.version.to_string()).collect(),
                    });
                }
                None => {}
            }
        }

        self.check_ledger(&ledger, warnings)?;
        Ok(ledger)
    }

    /// Bring the cosmetic parts of a reused lock up to date: BUNDLED WITH
    /// and the CHECKSUMS section.
    fn refresh(&self, mut lock: LockedSet, ledger: &ChecksumLedger) -> LockedSet {
        let checksums = self.config.records_checksums().then(|| {
            lock.specs()
                .map(|(_, spec)| ChecksumEntry {
                    name: spec.name.clone(),
                    version: spec.version.clone(),
                    checksum: ledger.preferred(&spec.name, &spec.version),
                })
                .collect()
        });
        let bundled_with = self.bundled_with(Some(&lock));
        lock.checksums = checksums;
        lock.bundled_with = Some(bundled_with);
        lock.normalize();
        lock
    }

    fn bundled_with(&self, previous: Option<&LockedSet>) -> semver::Version {
        let running = self.config.tool_version().clone();
        match previous.and_then(|lock| lock.bundled_with.clone()) {
            Some(locked) if locked > running => locked,
            _ => running,
        }
    }

    fn resolve(
        &self,
        previous: Option<&LockedSet>,
        pins: &Pins,
        locked_sources: BTreeMap<String, SourceId>,
        changes: &[LockChange],
        warnings: &mut Vec<Warning>,
    ) -> Result<LockedSet, ResolveError> {
        if self.config.local() {
            return Err(self.offline_failure(changes)?);
        }

        info!("resolving dependencies");
        let registry = SourceRegistry::new(self.fetcher, self.manifest.all_sources());
        warnings.extend(registry.prefetch(&self.manifest.mandatory_sources())?);

        let priority = SourcePriorityResolver::new(self.manifest, &registry, locked_sources)?;
        let provider = SourceCandidates::new(&registry, &priority, pins, self.config.update_mode());
        self.check_top_level(&provider)?;

        let solution = VersionSolver::new(&provider).solve(self.manifest.requirements())?;
        debug!("resolved {} package(s)", solution.len());
        warnings.extend(
            priority.ambiguities(
                solution.iter().map(|(name, c)| (name, &c.source)),
                self.config,
            )?,
        );

        let mut ledger = ChecksumLedger::new();
        for (name, candidate) in solution.iter() {
            for source in &candidate.offered_by {
                let offered = registry.versions(source, name)?;
                if let Some(checksum) = offered
                    .iter()
                    .find(|s| s.version == candidate.version)
                    .and_then(|s| s.checksum)
                {
                    ledger.record(name, &candidate.version, Origin::Source(source.clone()), checksum);
                }
            }
            if let Some(checksum) = previous.and_then(|lock| lock.checksum(name, &candidate.version)) {
                ledger.record(name, &candidate.version, Origin::Lockfile, checksum);
            }
            for artifact in self.cache.locally_cached_versions(name)? {
                if artifact.version == candidate.version {
                    ledger.record(name, &candidate.version, Origin::Cache(artifact.path), artifact.checksum);
                }
            }
        }
        self.check_ledger(&ledger, warnings)?;

        Ok(self.build_lock(&solution, &ledger, previous))
    }

    fn check_ledger(&self, ledger: &ChecksumLedger, warnings: &mut Vec<Warning>) -> Result<(), ResolveError> {
        if let Err(report) = ledger.validate() {
            if self.config.validates_checksums() {
                return Err(ResolveError::ChecksumMismatch(report));
            }
            warnings.push(Warning::ChecksumMismatch(report));
        }
        Ok(())
    }

    /// A top-level package that no permitted source offers gets a direct
    /// error instead of a derivation.
    fn check_top_level(&self, provider: &dyn CandidateProvider) -> Result<(), ResolveError> {
        for requirement in self.manifest.requirements() {
            let candidates = provider.candidates(&requirement.name)?;
            let wanted = (!requirement.requirement.is_any()).then(|| requirement.requirement.to_string());
            if candidates.is_empty() {
                return Err(ResolveError::PackageNotFound {
                    name: requirement.name.clone(),
                    requirement: wanted,
                    location: provider.location(&requirement.name)?,
                    available: Vec::new(),
                });
            }
            if !candidates.iter().any(|c| requirement.requirement.matches(&c.version)) {
                let mut available: Vec<_> = candidates.iter().map(|c| &c.version).collect();
                available.sort();
                return Err(ResolveError::PackageNotFound {
                    name: requirement.name.clone(),
                    requirement: wanted,
                    location: provider.location(&requirement.name)?,
                    available: available.into_iter().map(ToString::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    fn offline_failure(&self, changes: &[LockChange]) -> Result<ResolveError, ResolveError> {
        let name = changes
            .iter()
            .find_map(LockChange::package)
            .or_else(|| self.manifest.requirements().first().map(|r| r.name.as_str()))
            .unwrap_or_default()
            .to_string();
        let requirement = self
            .manifest
            .requirement(&name)
            .filter(|r| !r.requirement.is_any())
            .map(|r| r.requirement.to_string());
        let available = self
            .cache
            .locally_cached_versions(&name)?
            .iter()
            .map(|artifact| artifact.version.to_string())
            .collect();
        Ok(ResolveError::PackageNotFound {
            name,
            requirement,
            location: LOCAL_LOCATION.to_string(),
            available,
        })
    }

    fn build_lock(&self, solution: &Solution, ledger: &ChecksumLedger, previous: Option<&LockedSet>) -> LockedSet {
        let mut sections: BTreeMap<SourceId, Vec<LockedSpec>> = self
            .manifest
            .all_sources()
            .into_iter()
            .map(|source| (source, Vec::new()))
            .collect();
        for (name, candidate) in solution.iter() {
            sections
                .entry(candidate.source.clone())
                .or_default()
                .push(LockedSpec {
                    name: name.to_string(),
                    version: candidate.version.clone(),
                    dependencies: candidate.dependencies.clone(),
                });
        }

        let mut platforms: Vec<String> = self.manifest.platforms().to_vec();
        if let Some(lock) = previous {
            platforms.extend(lock.platforms.iter().cloned());
        }
        if platforms.is_empty() {
            platforms.push(DEFAULT_PLATFORM.to_string());
        }

        let dependencies = self
            .manifest
            .requirements()
            .iter()
            .map(|r| LockedDependency {
                name: r.name.clone(),
                requirement: r.requirement.clone(),
                source_bound: r.is_source_bound(),
            })
            .collect();

        let checksums = self.config.records_checksums().then(|| {
            solution
                .iter()
                .map(|(name, candidate)| ChecksumEntry {
                    name: name.to_string(),
                    version: candidate.version.clone(),
                    checksum: ledger.preferred(name, &candidate.version),
                })
                .collect()
        });

        let bundled_with = self.bundled_with(previous);

        let mut lock = LockedSet {
            sections: sections
                .into_iter()
                .map(|(remote, specs)| SourceSection {
                    remotes: vec![remote],
                    specs,
                })
                .collect(),
            platforms,
            dependencies,
            checksums,
            bundled_with: Some(bundled_with),
        };
        lock.normalize();
        lock
    }
}

impl std::fmt::Debug for Resolution<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("manifest", self.manifest)
            .field("config", self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::source::StaticFetcher;
    use crate::storage::MemoryStorage;

    const LOCK: &str = "gems.lock";

    fn digest(text: &str) -> String {
        Checksum::digest(text.as_bytes()).to_hex()
    }

    fn run(
        manifest: &str,
        config: &ResolutionConfig,
        fetcher: &StaticFetcher,
        storage: &MemoryStorage,
    ) -> Result<Outcome, ResolveError> {
        let manifest = Manifest::parse(manifest).unwrap();
        Resolution::new(&manifest, config, fetcher, storage).install(Path::new(LOCK))
    }

    #[test]
    fn fresh_install_writes_lock() {
        let fetcher = StaticFetcher::new().with_index(
            "https://gem.repo1",
            "myrack 1.0.0\nthin 1.0 myrack:>= 0\n",
        );
        let storage = MemoryStorage::new();
        let config = ResolutionConfig::default().with_record_checksums(false);
        let outcome = run(
            "sources = [\"https://gem.repo1\"]\n[[gem]]\nname = \"thin\"\n",
            &config,
            &fetcher,
            &storage,
        )
        .unwrap();

        assert!(outcome.written);
        assert!(!outcome.reused);
        let text = storage.contents(Path::new(LOCK)).unwrap();
        assert!(text.starts_with("GEM\n  remote: https://gem.repo1/\n  specs:\n    myrack (1.0.0)\n    thin (1.0)\n      myrack\n"));
        assert!(text.contains("PLATFORMS\n  ruby\n"));
        assert!(text.contains("DEPENDENCIES\n  thin\n"));
        assert!(!text.contains("CHECKSUMS"));
    }

    #[test]
    fn second_install_reuses_lock() {
        let fetcher = StaticFetcher::new().with_index("https://gem.repo1", "myrack 1.0.0\n");
        let storage = MemoryStorage::new();
        let config = ResolutionConfig::default();
        let manifest = "sources = [\"https://gem.repo1\"]\n[[gem]]\nname = \"myrack\"\n";

        run(manifest, &config, &fetcher, &storage).unwrap();
        let requests = fetcher.requests().len();
        let outcome = run(manifest, &config, &fetcher, &storage).unwrap();

        assert!(outcome.reused);
        assert!(!outcome.written);
        assert_eq!(fetcher.requests().len(), requests);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn records_source_checksums() {
        let sum = digest("myrack-1.0.0");
        let fetcher = StaticFetcher::new()
            .with_index("https://gem.repo1", &format!("myrack 1.0.0 |checksum:{sum}\n"));
        let storage = MemoryStorage::new();
        run(
            "sources = [\"https://gem.repo1\"]\n[[gem]]\nname = \"myrack\"\n",
            &ResolutionConfig::default(),
            &fetcher,
            &storage,
        )
        .unwrap();

        let text = storage.contents(Path::new(LOCK)).unwrap();
        assert!(text.contains(&format!("CHECKSUMS\n  myrack (1.0.0) sha256={sum}\n")));
    }

    #[test]
    fn local_mode_without_lock_fails() {
        let fetcher = StaticFetcher::new();
        let storage = MemoryStorage::new();
        let config = ResolutionConfig::default().with_local(true);
        let err = run(
            "sources = [\"https://gem.repo1\"]\n[[gem]]\nname = \"myrack\"\n",
            &config,
            &fetcher,
            &storage,
        )
        .unwrap_err();

        assert_eq!(err.status_code(), 7);
        assert_eq!(
            err.to_string(),
            "Could not find gem 'myrack' in locally installed gems."
        );
        assert!(fetcher.requests().is_empty());
    }

    #[test]
    fn top_level_version_not_offered() {
        let fetcher = StaticFetcher::new().with_index("https://gem.repo1", "myrack 1.0.0\nmyrack 0.9.1\n");
        let storage = MemoryStorage::new();
        let err = run(
            "sources = [\"https://gem.repo1\"]\n[[gem]]\nname = \"myrack\"\nversion = \"~> 2.0\"\n",
            &ResolutionConfig::default(),
            &fetcher,
            &storage,
        )
        .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("Could not find gem 'myrack (~> 2.0)' in rubygems repository https://gem.repo1/."));
        assert!(message.contains("  * myrack-0.9.1\n  * myrack-1.0.0"));
        assert_eq!(storage.write_count(), 0);
    }

    #[test]
    fn multiple_global_sources_warn() {
        let fetcher = StaticFetcher::new()
            .with_index("https://gem.repo1", "myrack 1.0.0\n")
            .with_index("https://gem.repo2", "thin 1.0\n");
        let storage = MemoryStorage::new();
        let outcome = run(
            "sources = [\"https://gem.repo1\", \"https://gem.repo2\"]\n[[gem]]\nname = \"myrack\"\n",
            &ResolutionConfig::default(),
            &fetcher,
            &storage,
        )
        .unwrap();

        assert!(outcome
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::MultipleGlobalSources)));
    }
}
