//! Deciding whether a previous lock can be reused, and how it constrains a
//! new resolution.
//!
//! The comparison is structural: it works on the parsed manifest and lock,
//! so formatting differences never force a re-resolution.

use crate::config::ResolutionConfig;
use crate::error::{ResolveError, Warning};
use crate::lockfile::LockedSet;
use crate::manifest::Manifest;
use crate::provider::{Pin, Pins};
use crate::source::SourceId;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Install from the lock, resolving only what changed.
    Install,
    /// Re-resolve some or all packages.
    Update(UpdateScope),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateScope {
    All,
    Only(BTreeSet<String>),
}

/// One difference between the manifest and the previous lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockChange {
    /// There is no previous lock.
    Missing,
    /// A top-level requirement is new.
    Added(String),
    /// A top-level requirement was removed.
    Removed(String),
    /// A top-level requirement or its source binding changed.
    Changed { name: String, from: String, to: String },
    SourceAdded(SourceId),
    SourceRemoved(SourceId),
    PlatformAdded(String),
    /// A locked spec or requirement is missing or unsatisfied in the lock.
    Unsatisfied(String),
    /// A source-bound requirement is not locked under its source.
    WrongSource { name: String, source: SourceId },
    /// A lock section lists several remotes.
    AggregateSection(Vec<SourceId>),
    /// An update was requested.
    UpdateRequested,
    /// CHECKSUMS presence does not match the `record-checksums` setting.
    ChecksumsOutdated,
    /// The lock was written by an older tool version.
    OlderTool,
}

impl LockChange {
    /// Cosmetic differences never force a re-resolution in frozen mode.
    #[must_use]
    pub fn is_cosmetic(&self) -> bool {
        matches!(self, Self::ChecksumsOutdated | Self::OlderTool)
    }

    /// The package the change is about, if any.
    #[must_use]
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::Added(name)
            | Self::Removed(name)
            | Self::Changed { name, .. }
            | Self::Unsatisfied(name)
            | Self::WrongSource { name, .. } => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for LockChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("there is no lockfile yet"),
            Self::Added(name) => write!(f, "you added {name} to the manifest"),
            Self::Removed(name) => write!(f, "you removed {name} from the manifest"),
            Self::Changed { name, from, to } => {
                write!(f, "you changed {name} in the manifest from `{from}` to `{to}`")
            }
            Self::SourceAdded(source) => write!(f, "the source {source} was added"),
            Self::SourceRemoved(source) => write!(f, "the source {source} was removed"),
            Self::PlatformAdded(platform) => write!(f, "the platform {platform} was added"),
            Self::Unsatisfied(name) => write!(f, "{name} is not satisfied by the lockfile"),
            Self::WrongSource { name, source } => {
                write!(f, "{name} is not locked under its source {source}")
            }
            Self::AggregateSection(remotes) => {
                let remotes: Vec<&str> = remotes.iter().map(SourceId::as_str).collect();
                write!(f, "a lockfile section lists several remotes: {}", remotes.join(", "))
            }
            Self::UpdateRequested => f.write_str("an update was requested"),
            Self::ChecksumsOutdated => f.write_str("the CHECKSUMS section is out of date"),
            Self::OlderTool => f.write_str("the lockfile was written by an older version"),
        }
    }
}

/// The reconciler's verdict.
#[derive(Debug, Clone)]
pub enum Plan {
    /// Use the previous lock without running the solver.
    Reuse {
        lock: LockedSet,
        /// Only cosmetic parts differ: BUNDLED WITH and CHECKSUMS are
        /// rewritten, the locked specs are kept.
        rewrite: bool,
        warnings: Vec<Warning>,
    },
    /// Run the solver with these lock-derived inputs.
    Resolve {
        pins: Pins,
        /// Single-remote section of each locked package.
        locked_sources: BTreeMap<String, SourceId>,
        changes: Vec<LockChange>,
    },
}

/// Compares a manifest with its previous lock.
#[derive(Debug)]
pub struct LockReconciler<'a> {
    manifest: &'a Manifest,
    previous: Option<&'a LockedSet>,
    config: &'a ResolutionConfig,
}

impl<'a> LockReconciler<'a> {
    pub fn new(
        manifest: &'a Manifest,
        previous: Option<&'a LockedSet>,
        config: &'a ResolutionConfig,
    ) -> Self {
        Self {
            manifest,
            previous,
            config,
        }
    }

    /// Every structural difference between the manifest and `lock`.
    #[must_use]
    pub fn diff(&self, lock: &LockedSet) -> Vec<LockChange> {
        let mut changes = Vec::new();
        self.diff_requirements(lock, &mut changes);

        let declared = self.manifest.all_sources();
        let locked: BTreeSet<SourceId> = lock.remotes().cloned().collect();
        changes.extend(declared.difference(&locked).cloned().map(LockChange::SourceAdded));
        changes.extend(locked.difference(&declared).cloned().map(LockChange::SourceRemoved));

        for platform in self.manifest.platforms() {
            if !lock.platforms.contains(platform) {
                changes.push(LockChange::PlatformAdded(platform.clone()));
            }
        }

        diff_closure(lock, &mut changes);

        for section in lock.sections.iter().filter(|s| s.is_aggregate()) {
            changes.push(LockChange::AggregateSection(section.remotes.clone()));
        }

        if self.config.records_checksums() != lock.checksums.is_some() {
            changes.push(LockChange::ChecksumsOutdated);
        }
        if lock
            .bundled_with
            .as_ref()
            .map_or(true, |v| v < self.config.tool_version())
        {
            changes.push(LockChange::OlderTool);
        }
        changes
    }

    fn diff_requirements(&self, lock: &LockedSet, changes: &mut Vec<LockChange>) {
        for requirement in self.manifest.requirements() {
            let Some(locked) = lock.dependency(&requirement.name) else {
                changes.push(LockChange::Added(requirement.name.clone()));
                continue;
            };
            if locked.requirement != requirement.requirement
                || locked.source_bound != requirement.is_source_bound()
            {
                changes.push(LockChange::Changed {
                    name: requirement.name.clone(),
                    from: describe(&locked.requirement.to_string(), locked.source_bound),
                    to: describe(
                        &requirement.requirement.to_string(),
                        requirement.is_source_bound(),
                    ),
                });
                if let Some((_, spec)) = lock.spec(&requirement.name) {
                    if !requirement.requirement.matches(&spec.version) {
                        changes.push(LockChange::Unsatisfied(requirement.name.clone()));
                    }
                }
            }
            match (requirement.source(), lock.spec(&requirement.name)) {
                (Some(source), Some((section, _))) if !section.remotes.contains(source) => {
                    changes.push(LockChange::WrongSource {
                        name: requirement.name.clone(),
                        source: source.clone(),
                    });
                }
                _ => {}
            }
        }
        for dependency in &lock.dependencies {
            if self.manifest.requirement(&dependency.name).is_none() {
                changes.push(LockChange::Removed(dependency.name.clone()));
            }
        }
    }

    /// Decide how to satisfy `request`.
    ///
    /// # Errors
    ///
    /// Fails with [`ResolveError::FrozenLock`] when frozen mode forbids the
    /// needed change, [`ResolveError::AggregateSourceSecurity`] when a strict
    /// frozen run meets an aggregate section, and
    /// [`ResolveError::PackageNotLocked`] for unknown update targets.
    pub fn plan(&self, request: &Request) -> Result<Plan, ResolveError> {
        let Some(lock) = self.previous else {
            if self.config.frozen() {
                return Err(ResolveError::FrozenLock {
                    changes: vec![LockChange::Missing],
                });
            }
            return Ok(Plan::Resolve {
                pins: Pins::new(),
                locked_sources: BTreeMap::new(),
                changes: vec![LockChange::Missing],
            });
        };

        if let Request::Update(UpdateScope::Only(names)) = request {
            if let Some(name) = names.iter().find(|n| lock.spec(n).is_none()) {
                return Err(ResolveError::PackageNotLocked { name: name.clone() });
            }
        }

        let changes = self.diff(lock);
        debug!("lock differs from the manifest in {} way(s)", changes.len());

        match request {
            Request::Install => self.plan_install(lock, changes),
            Request::Update(scope) => {
                if self.config.frozen() {
                    return Err(ResolveError::FrozenLock {
                        changes: vec![LockChange::UpdateRequested],
                    });
                }
                let changed: BTreeSet<&str> = changes.iter().filter_map(LockChange::package).collect();
                Ok(Plan::Resolve {
                    pins: update_pins(lock, scope, &changed),
                    locked_sources: locked_sources(lock),
                    changes: vec![LockChange::UpdateRequested],
                })
            }
        }
    }

    fn plan_install(&self, lock: &LockedSet, changes: Vec<LockChange>) -> Result<Plan, ResolveError> {
        let aggregate = lock.has_aggregate_sections();
        let blocking: Vec<LockChange> = changes
            .iter()
            .filter(|c| !c.is_cosmetic() && !matches!(c, LockChange::AggregateSection(_)))
            .cloned()
            .collect();

        if self.config.frozen() {
            if !blocking.is_empty() {
                return Err(ResolveError::FrozenLock { changes: blocking });
            }
            let mut warnings = Vec::new();
            if aggregate {
                if self.config.is_strict() {
                    let remotes = lock.remotes().map(ToString::to_string).collect();
                    return Err(ResolveError::AggregateSourceSecurity { remotes });
                }
                warnings.push(Warning::AggregateSource);
            }
            return Ok(Plan::Reuse {
                lock: lock.clone(),
                rewrite: false,
                warnings,
            });
        }

        if changes.iter().all(LockChange::is_cosmetic) {
            debug!("lockfile is up to date");
            return Ok(Plan::Reuse {
                lock: lock.clone(),
                rewrite: !changes.is_empty(),
                warnings: Vec::new(),
            });
        }

        let changed: BTreeSet<&str> = changes.iter().filter_map(LockChange::package).collect();
        let pins = lock
            .specs()
            .filter(|(_, spec)| !changed.contains(spec.name.as_str()))
            .map(|(_, spec)| (spec.name.clone(), Pin::Prefer(spec.version.clone())))
            .collect();
        Ok(Plan::Resolve {
            pins,
            locked_sources: locked_sources(lock),
            changes,
        })
    }
}

fn describe(requirement: &str, source_bound: bool) -> String {
    if source_bound {
        format!("{requirement} (source bound)")
    } else {
        requirement.to_string()
    }
}

/// Every top-level requirement and every spec dependency must be satisfied
/// by a locked spec.
fn diff_closure(lock: &LockedSet, changes: &mut Vec<LockChange>) {
    let mut unsatisfied = BTreeSet::new();
    for dependency in &lock.dependencies {
        match lock.spec(&dependency.name) {
            Some((_, spec)) if dependency.requirement.matches(&spec.version) => {}
            _ => {
                unsatisfied.insert(dependency.name.clone());
            }
        }
    }
    for (_, spec) in lock.specs() {
        for dep in &spec.dependencies {
            match lock.spec(&dep.name) {
                Some((_, locked)) if dep.requirement.matches(&locked.version) => {}
                _ => {
                    unsatisfied.insert(dep.name.clone());
                }
            }
        }
    }
    changes.extend(unsatisfied.into_iter().map(LockChange::Unsatisfied));
}

/// Single-remote section of every locked package.
fn locked_sources(lock: &LockedSet) -> BTreeMap<String, SourceId> {
    lock.specs()
        .filter_map(|(section, spec)| {
            section
                .single_remote()
                .map(|remote| (spec.name.clone(), remote.clone()))
        })
        .collect()
}

/// Named packages are unlocked. The rest keep their locked version and
/// source, except those whose requirement changed, which only prefer it.
fn update_pins(lock: &LockedSet, scope: &UpdateScope, changed: &BTreeSet<&str>) -> Pins {
    let UpdateScope::Only(names) = scope else {
        return Pins::new();
    };
    lock.specs()
        .map(|(section, spec)| {
            let pin = if names.contains(&spec.name) {
                Pin::Unlock(spec.version.clone())
            } else if changed.contains(spec.name.as_str()) {
                Pin::Prefer(spec.version.clone())
            } else {
                Pin::Force {
                    version: spec.version.clone(),
                    source: section.single_remote().cloned(),
                    dependencies: spec.dependencies.clone(),
                }
            };
            (spec.name.clone(), pin)
        })
        .collect()
}
