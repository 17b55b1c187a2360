//! Candidate lists built from source catalogs, lock pins and update policy.

use crate::config::UpdateMode;
use crate::error::ResolveError;
use crate::priority::SourcePriorityResolver;
use crate::solver::{Candidate, CandidateProvider};
use crate::source::{Dependency, SourceId, SourceRegistry};
use crate::version::GemVersion;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How a previously locked version shapes a package's candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pin {
    /// Try the locked version first, then the usual order.
    Prefer(GemVersion),
    /// Only the locked version is allowed, from the locked source when known.
    Force {
        version: GemVersion,
        source: Option<SourceId>,
        dependencies: Vec<Dependency>,
    },
    /// The package is being updated away from this locked version.
    Unlock(GemVersion),
}

/// Lock-derived pins by package name.
pub type Pins = BTreeMap<String, Pin>;

/// Builds candidates for the solver.
#[derive(Debug)]
pub struct SourceCandidates<'a, 'f> {
    registry: &'a SourceRegistry<'f>,
    priority: &'a SourcePriorityResolver<'a, 'f>,
    pins: &'a Pins,
    mode: UpdateMode,
}

impl<'a, 'f> SourceCandidates<'a, 'f> {
    pub fn new(
        registry: &'a SourceRegistry<'f>,
        priority: &'a SourcePriorityResolver<'a, 'f>,
        pins: &'a Pins,
        mode: UpdateMode,
    ) -> Self {
        Self {
            registry,
            priority,
            pins,
            mode,
        }
    }

    /// Every version offered by the permitted sources, newest first, merged
    /// across sources in priority order.
    fn offered(&self, sources: &[SourceId], name: &str) -> Result<Vec<Candidate>, ResolveError> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for source in sources {
            for spec in self.registry.versions(source, name)? {
                match candidates.iter_mut().find(|c| c.version == spec.version) {
                    Some(candidate) => candidate.offered_by.push(source.clone()),
                    None => candidates.push(Candidate {
                        version: spec.version.clone(),
                        source: source.clone(),
                        dependencies: spec.dependencies.clone(),
                        offered_by: vec![source.clone()],
                    }),
                }
            }
        }
        candidates.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(candidates)
    }
}

/// Conservative ordering around `locked`: newer versions from the smallest
/// bump up, then the locked version, then older versions newest first.
fn conservative_order(locked: &GemVersion, a: &GemVersion, b: &GemVersion) -> Ordering {
    let rank = |v: &GemVersion| match v.cmp(locked) {
        Ordering::Greater => 0,
        Ordering::Equal => 1,
        Ordering::Less => 2,
    };
    rank(a).cmp(&rank(b)).then_with(|| {
        if rank(a) == 0 {
            a.cmp(b)
        } else {
            b.cmp(a)
        }
    })
}

fn prefer_source(candidate: &mut Candidate, source: &SourceId) {
    if let Some(position) = candidate.offered_by.iter().position(|s| s == source) {
        let preferred = candidate.offered_by.remove(position);
        candidate.offered_by.insert(0, preferred);
        candidate.source = source.clone();
    }
}

impl CandidateProvider for SourceCandidates<'_, '_> {
    fn candidates(&self, name: &str) -> Result<Vec<Candidate>, ResolveError> {
        let choice = self.priority.choose(name)?;
        let mut candidates = self.offered(&choice.sources, name)?;

        match self.pins.get(name) {
            None => {}
            Some(Pin::Prefer(locked)) => {
                candidates.sort_by_key(|c| c.version != *locked);
            }
            Some(Pin::Force {
                version,
                source,
                dependencies,
            }) => {
                candidates.retain(|c| c.version == *version);
                if let Some(source) = source {
                    for candidate in &mut candidates {
                        prefer_source(candidate, source);
                    }
                }
                if candidates.is_empty() {
                    let fallback = source.clone().or_else(|| choice.sources.first().cloned());
                    if let Some(source) = fallback {
                        candidates.push(Candidate {
                            version: version.clone(),
                            source: source.clone(),
                            dependencies: dependencies.clone(),
                            offered_by: vec![source],
                        });
                    }
                }
            }
            Some(Pin::Unlock(locked)) => {
                if self.mode == UpdateMode::Conservative {
                    candidates.sort_by(|a, b| conservative_order(locked, &a.version, &b.version));
                }
            }
        }
        Ok(candidates)
    }

    fn location(&self, name: &str) -> Result<String, ResolveError> {
        Ok(self.priority.choose(name)?.location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::source::StaticFetcher;

    fn v(s: &str) -> GemVersion {
        GemVersion::parse(s).unwrap()
    }

    fn id(uri: &str) -> SourceId {
        SourceId::parse(uri).unwrap()
    }

    fn versions(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(|c| c.version.to_string()).collect()
    }

    fn with_provider(pins: &Pins, mode: UpdateMode, check: impl FnOnce(&SourceCandidates<'_, '_>)) {
        let manifest = Manifest::parse(
            "sources = [\"https://gem.repo1\", \"https://gem.repo2\"]\n[[gem]]\nname = \"myrack\"\n",
        )
        .unwrap();
        let fetcher = StaticFetcher::new()
            .with_index("https://gem.repo1", "myrack 1.0.0\nmyrack 0.9.1\nmyrack 1.2\n")
            .with_index("https://gem.repo2", "myrack 1.0.0\nmyrack 1.1\nmyrack 2.0\n");
        let registry = SourceRegistry::new(&fetcher, manifest.all_sources());
        let priority = SourcePriorityResolver::new(&manifest, &registry, BTreeMap::new()).unwrap();
        let provider = SourceCandidates::new(&registry, &priority, pins, mode);
        check(&provider);
    }

    #[test]
    fn merges_sources_newest_first() {
        with_provider(&Pins::new(), UpdateMode::Conservative, |provider| {
            let candidates = provider.candidates("myrack").unwrap();
            assert_eq!(versions(&candidates), ["2.0", "1.2", "1.1", "1.0.0", "0.9.1"]);

            let shared = &candidates[3];
            assert_eq!(shared.source, id("https://gem.repo2"));
            assert_eq!(shared.offered_by, [id("https://gem.repo2"), id("https://gem.repo1")]);
            assert_eq!(
                provider.location("myrack").unwrap(),
                "any of the sources"
            );
        });
    }

    #[test]
    fn prefer_pin_moves_locked_first() {
        let pins = Pins::from([("myrack".to_string(), Pin::Prefer(v("1.0.0")))]);
        with_provider(&pins, UpdateMode::Conservative, |provider| {
            let candidates = provider.candidates("myrack").unwrap();
            assert_eq!(versions(&candidates), ["1.0.0", "2.0", "1.2", "1.1", "0.9.1"]);
        });
    }

    #[test]
    fn force_pin_keeps_locked_source() {
        let pins = Pins::from([(
            "myrack".to_string(),
            Pin::Force {
                version: v("1.0"),
                source: Some(id("https://gem.repo1")),
                dependencies: Vec::new(),
            },
        )]);
        with_provider(&pins, UpdateMode::Conservative, |provider| {
            let candidates = provider.candidates("myrack").unwrap();
            assert_eq!(candidates.len(), 1);
            assert_eq!(candidates[0].source, id("https://gem.repo1"));
        });
    }

    #[test]
    fn force_pin_falls_back_to_lock_data() {
        let pins = Pins::from([(
            "myrack".to_string(),
            Pin::Force {
                version: v("0.5"),
                source: Some(id("https://gem.repo1")),
                dependencies: Vec::new(),
            },
        )]);
        with_provider(&pins, UpdateMode::Conservative, |provider| {
            let candidates = provider.candidates("myrack").unwrap();
            assert_eq!(versions(&candidates), ["0.5"]);
        });
    }

    #[test]
    fn unlock_orders_by_update_mode() {
        let pins = Pins::from([("myrack".to_string(), Pin::Unlock(v("1.1")))]);
        with_provider(&pins, UpdateMode::Conservative, |provider| {
            let candidates = provider.candidates("myrack").unwrap();
            assert_eq!(versions(&candidates), ["1.2", "2.0", "1.1", "1.0.0", "0.9.1"]);
        });
        with_provider(&pins, UpdateMode::Aggressive, |provider| {
            let candidates = provider.candidates("myrack").unwrap();
            assert_eq!(versions(&candidates), ["2.0", "1.2", "1.1", "1.0.0", "0.9.1"]);
        });
    }
}
