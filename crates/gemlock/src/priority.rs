//! Deciding which sources may supply each package.
//!
//! Rules, first match wins:
//!
//! 1. a requirement pinned with `source` uses that source;
//! 2. a requirement declared in a block uses the block's remote;
//! 3. a package locked in a single-remote section keeps that remote while the
//!    manifest still declares it and it still offers the package;
//! 4. a package reachable from a scoped source's own requirements, through
//!    that source's catalog, is claimed by every such source;
//! 5. otherwise any global source offering it.
//!
//! Among several claiming or global sources the one declared last is
//! preferred, and the package is reported as ambiguous once resolved.

use crate::config::ResolutionConfig;
use crate::error::{ResolveError, Warning};
use crate::manifest::{Manifest, SourceBinding};
use crate::source::{SourceId, SourceRegistry};
use log::debug;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Which rule selected the sources for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Pinned,
    Scoped,
    Locked,
    Claimed,
    Global,
}

/// The sources allowed to supply a package, most preferred first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChoice {
    pub rule: Rule,
    pub sources: Vec<SourceId>,
    /// False when no allowed source offers the package; `sources` then lists
    /// where it was looked for.
    pub carried: bool,
}

impl SourceChoice {
    /// Returns true if more than one source could supply the package.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.carried && matches!(self.rule, Rule::Claimed | Rule::Global) && self.sources.len() > 1
    }

    /// Where the package was looked for, for error messages.
    #[must_use]
    pub fn location(&self) -> String {
        match self.sources.as_slice() {
            [source] => format!("rubygems repository {source}"),
            _ => "any of the sources".to_string(),
        }
    }
}

/// A resolved package that more than one source could have supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousSource {
    pub name: String,
    /// True when the candidates are scoped sources rather than global ones.
    pub scoped: bool,
    /// Candidate sources ordered by URI.
    pub candidates: Vec<SourceId>,
    pub chosen: SourceId,
}

impl AmbiguousSource {
    /// Message text; `strict` selects the error wording.
    #[must_use]
    pub fn render(&self, strict: bool) -> String {
        let relevant = if self.scoped { "relevant " } else { "" };
        let mut out = if strict {
            format!(
                "The gem '{}' was found in multiple {relevant}sources.\n",
                self.name
            )
        } else {
            format!(
                "Warning: the gem '{}' was found in multiple {relevant}sources.\n",
                self.name
            )
        };
        for candidate in &self.candidates {
            out.push_str(&format!("  * rubygems repository {candidate}\n"));
        }
        if strict {
            out.push_str(
                "You must add this gem to the source block for the source you wish it to be \
                 installed from.",
            );
        } else {
            out.push_str(&format!("Installed from: {}\n", self.chosen));
            out.push_str(
                "You should add this gem to the source block for the source you wish it to be \
                 installed from.",
            );
        }
        out
    }
}

/// Applies the source rules for one run.
#[derive(Debug)]
pub struct SourcePriorityResolver<'r, 'f> {
    manifest: &'r Manifest,
    registry: &'r SourceRegistry<'f>,
    locked: BTreeMap<String, SourceId>,
    /// Claiming sources per package, in declaration order.
    claims: BTreeMap<String, Vec<SourceId>>,
}

impl<'r, 'f> SourcePriorityResolver<'r, 'f> {
    /// Build the resolver. `locked` maps package names to the single remote
    /// of their lock section.
    ///
    /// # Errors
    ///
    /// Returns an error if a scoped source's index cannot be loaded.
    pub fn new(
        manifest: &'r Manifest,
        registry: &'r SourceRegistry<'f>,
        locked: BTreeMap<String, SourceId>,
    ) -> Result<Self, ResolveError> {
        let mut claims: BTreeMap<String, Vec<SourceId>> = BTreeMap::new();
        for source in manifest.scoped_sources() {
            for name in claimed_by(manifest, registry, source)? {
                claims.entry(name).or_default().push(source.clone());
            }
        }
        for (name, sources) in &claims {
            debug!("{name} is claimed by {} scoped source(s)", sources.len());
        }
        Ok(Self {
            manifest,
            registry,
            locked,
            claims,
        })
    }

    fn carries(&self, source: &SourceId, name: &str) -> Result<bool, ResolveError> {
        Ok(!self.registry.versions(source, name)?.is_empty())
    }

    /// The sources allowed to supply `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if a needed index cannot be loaded.
    pub fn choose(&self, name: &str) -> Result<SourceChoice, ResolveError> {
        if let Some(requirement) = self.manifest.requirement(name) {
            let bound = match &requirement.binding {
                SourceBinding::Pinned(source) => Some((Rule::Pinned, source)),
                SourceBinding::Scoped(source) => Some((Rule::Scoped, source)),
                SourceBinding::Global => None,
            };
            if let Some((rule, source)) = bound {
                return Ok(SourceChoice {
                    rule,
                    carried: self.carries(source, name)?,
                    sources: vec![source.clone()],
                });
            }
        }

        if let Some(source) = self.locked.get(name) {
            if self.manifest.declares(source) && self.carries(source, name)? {
                return Ok(SourceChoice {
                    rule: Rule::Locked,
                    sources: vec![source.clone()],
                    carried: true,
                });
            }
        }

        if let Some(claimants) = self.claims.get(name) {
            return Ok(SourceChoice {
                rule: Rule::Claimed,
                sources: claimants.iter().rev().cloned().collect(),
                carried: true,
            });
        }

        let globals: Vec<SourceId> = self.manifest.global_sources().iter().rev().cloned().collect();
        let mut carrying = Vec::new();
        for source in &globals {
            if self.carries(source, name)? {
                carrying.push(source.clone());
            }
        }
        Ok(if carrying.is_empty() {
            SourceChoice {
                rule: Rule::Global,
                sources: globals,
                carried: false,
            }
        } else {
            SourceChoice {
                rule: Rule::Global,
                sources: carrying,
                carried: true,
            }
        })
    }

    /// Report packages of a solution that several sources could supply.
    ///
    /// # Errors
    ///
    /// In strict mode the first ambiguous package, by name, is an error.
    pub fn ambiguities<'a>(
        &self,
        resolved: impl IntoIterator<Item = (&'a str, &'a SourceId)>,
        config: &ResolutionConfig,
    ) -> Result<Vec<Warning>, ResolveError> {
        let mut resolved: Vec<(&str, &SourceId)> = resolved.into_iter().collect();
        resolved.sort_by_key(|(name, _)| *name);

        let mut warnings = Vec::new();
        for (name, chosen) in resolved {
            let choice = self.choose(name)?;
            if !choice.is_ambiguous() {
                continue;
            }
            let mut candidates = choice.sources;
            candidates.sort();
            let ambiguity = AmbiguousSource {
                name: name.to_string(),
                scoped: choice.rule == Rule::Claimed,
                candidates,
                chosen: chosen.clone(),
            };
            if config.is_strict() {
                return Err(ResolveError::AmbiguousSource(ambiguity));
            }
            warnings.push(Warning::AmbiguousSource(ambiguity));
        }
        Ok(warnings)
    }
}

/// Names reachable from the requirements bound to `source`, walking that
/// source's own catalog and stopping where it offers nothing. Top-level
/// names are never claimed.
fn claimed_by(
    manifest: &Manifest,
    registry: &SourceRegistry<'_>,
    source: &SourceId,
) -> Result<BTreeSet<String>, ResolveError> {
    let mut claimed = BTreeSet::new();
    let mut visited = BTreeSet::new();
    let mut queue: VecDeque<String> = manifest
        .requirements()
        .iter()
        .filter(|r| r.source() == Some(source))
        .map(|r| r.name.clone())
        .collect();

    while let Some(name) = queue.pop_front() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let versions = registry.versions(source, &name)?;
        if versions.is_empty() {
            continue;
        }
        if manifest.requirement(&name).is_none() {
            claimed.insert(name.clone());
        }
        for spec in versions {
            for dep in &spec.dependencies {
                if !visited.contains(&dep.name) {
                    queue.push_back(dep.name.clone());
                }
            }
        }
    }
    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceMode;
    use crate::source::StaticFetcher;

    fn id(uri: &str) -> SourceId {
        SourceId::parse(uri).unwrap()
    }

    fn fetcher() -> StaticFetcher {
        StaticFetcher::new()
            .with_index("https://gem.repo1", "myrack 1.0.0\nnokogiri 1.0\n")
            .with_index("https://gem.repo2", "myrack 1.0.0\n")
            .with_index(
                "https://gem.repo3",
                "handsoap 0.2.5.5 nokogiri:>= 0\n\
                 depends_on_myrack 1.0.1 myrack:>= 0\n\
                 myrack 1.0.0\n",
            )
            .with_index("https://gem.repo4", "depends_on_myrack 1.0.1 myrack:>= 0\nmyrack 1.0.0\n")
    }

    #[test]
    fn pinned_and_block_requirements_win() {
        let manifest = Manifest::parse(
            r#"
sources = ["https://gem.repo1"]

[[gem]]
name = "myrack"
source = "https://gem.repo2"

[[block]]
remote = "https://gem.repo3"

[[block.gem]]
name = "handsoap"
"#,
        )
        .unwrap();
        let fetcher = fetcher();
        let registry = SourceRegistry::new(&fetcher, manifest.all_sources());
        let resolver = SourcePriorityResolver::new(&manifest, &registry, BTreeMap::new()).unwrap();

        let myrack = resolver.choose("myrack").unwrap();
        assert_eq!(myrack.rule, Rule::Pinned);
        assert_eq!(myrack.sources, [id("https://gem.repo2")]);

        let handsoap = resolver.choose("handsoap").unwrap();
        assert_eq!(handsoap.rule, Rule::Scoped);

        // repo3 does not offer nokogiri, so the global source supplies it.
        let nokogiri = resolver.choose("nokogiri").unwrap();
        assert_eq!(nokogiri.rule, Rule::Global);
        assert_eq!(nokogiri.sources, [id("https://gem.repo1")]);
        assert!(!nokogiri.is_ambiguous());
    }

    #[test]
    fn scoped_sources_claim_transitive_packages() {
        let manifest = Manifest::parse(
            r#"
sources = ["https://gem.repo1"]

[[block]]
remote = "https://gem.repo3"

[[block.gem]]
name = "depends_on_myrack"
"#,
        )
        .unwrap();
        let fetcher = fetcher();
        let registry = SourceRegistry::new(&fetcher, manifest.all_sources());
        let resolver = SourcePriorityResolver::new(&manifest, &registry, BTreeMap::new()).unwrap();

        let myrack = resolver.choose("myrack").unwrap();
        assert_eq!(myrack.rule, Rule::Claimed);
        assert_eq!(myrack.sources, [id("https://gem.repo3")]);
    }

    #[test]
    fn last_declared_claimant_is_preferred() {
        let manifest = Manifest::parse(
            r#"
sources = ["https://gem.repo1"]

[[block]]
remote = "https://gem.repo4"

[[block.gem]]
name = "depends_on_myrack"

[[block]]
remote = "https://gem.repo3"

[[block.gem]]
name = "handsoap"

[[gem]]
name = "myrack_user"
source = "https://gem.repo3"
"#,
        );
        // Pins register their source before blocks do.
        let manifest = manifest.unwrap();
        assert_eq!(
            manifest.scoped_sources(),
            &[id("https://gem.repo3"), id("https://gem.repo4")]
        );

        let fetcher = StaticFetcher::new()
            .with_index("https://gem.repo1", "")
            .with_index("https://gem.repo3", "myrack_user 1.0 myrack:>= 0\nmyrack 1.0.0\nhandsoap 1.0\n")
            .with_index("https://gem.repo4", "depends_on_myrack 1.0.1 myrack:>= 0\nmyrack 1.0.0\n");
        let registry = SourceRegistry::new(&fetcher, manifest.all_sources());
        let resolver = SourcePriorityResolver::new(&manifest, &registry, BTreeMap::new()).unwrap();

        let myrack = resolver.choose("myrack").unwrap();
        assert_eq!(myrack.rule, Rule::Claimed);
        assert_eq!(myrack.sources, [id("https://gem.repo4"), id("https://gem.repo3")]);
        assert!(myrack.is_ambiguous());

        let config = ResolutionConfig::default();
        let chosen = id("https://gem.repo4");
        let warnings = resolver.ambiguities([("myrack", &chosen)], &config).unwrap();
        assert_eq!(warnings.len(), 1);
        let text = warnings[0].to_string();
        assert!(text.contains("found in multiple relevant sources"));
        assert!(text.contains("  * rubygems repository https://gem.repo3/\n  * rubygems repository https://gem.repo4/"));

        let strict = config.with_source_mode(SourceMode::Strict);
        let err = resolver.ambiguities([("myrack", &chosen)], &strict).unwrap_err();
        assert_eq!(err.status_code(), 4);
    }

    #[test]
    fn locked_source_is_kept() {
        let manifest = Manifest::parse(
            r#"
sources = ["https://gem.repo1", "https://gem.repo2"]

[[gem]]
name = "myrack"
"#,
        )
        .unwrap();
        let fetcher = fetcher();
        let registry = SourceRegistry::new(&fetcher, manifest.all_sources());

        let resolver = SourcePriorityResolver::new(&manifest, &registry, BTreeMap::new()).unwrap();
        let choice = resolver.choose("myrack").unwrap();
        assert_eq!(choice.sources, [id("https://gem.repo2"), id("https://gem.repo1")]);
        assert!(choice.is_ambiguous());

        let locked = BTreeMap::from([("myrack".to_string(), id("https://gem.repo1"))]);
        let resolver = SourcePriorityResolver::new(&manifest, &registry, locked).unwrap();
        let choice = resolver.choose("myrack").unwrap();
        assert_eq!(choice.rule, Rule::Locked);
        assert_eq!(choice.sources, [id("https://gem.repo1")]);

        // A remote the manifest no longer declares is ignored.
        let locked = BTreeMap::from([("myrack".to_string(), id("https://gem.repo9"))]);
        let resolver = SourcePriorityResolver::new(&manifest, &registry, locked).unwrap();
        assert_eq!(resolver.choose("myrack").unwrap().rule, Rule::Global);
    }

    #[test]
    fn missing_package_location() {
        let manifest = Manifest::parse("sources = [\"https://gem.repo1\"]\n").unwrap();
        let fetcher = fetcher();
        let registry = SourceRegistry::new(&fetcher, manifest.all_sources());
        let resolver = SourcePriorityResolver::new(&manifest, &registry, BTreeMap::new()).unwrap();

        let choice = resolver.choose("missing").unwrap();
        assert!(!choice.carried);
        assert_eq!(choice.location(), "rubygems repository https://gem.repo1/");
    }
}
