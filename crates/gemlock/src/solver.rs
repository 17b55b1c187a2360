//! Backtracking version search.
//!
//! The solver keeps an explicit stack of choice points. Each frame records the
//! package it decided, the candidates still to try and the constraints its
//! current choice layered onto other packages, so undoing a choice is popping
//! those constraints. The next package decided is always the constrained,
//! undecided one with the fewest viable candidates (ties by name), which keeps
//! the search deterministic.

use crate::error::ResolveError;
use crate::explain::{self, Chain, Edge, Failure};
use crate::manifest::PackageRequirement;
use crate::source::{Dependency, SourceId};
use crate::version::{GemVersion, Requirement};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

/// One version of a package as the solver may choose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub version: GemVersion,
    /// The preferred source offering this version.
    pub source: SourceId,
    pub dependencies: Vec<Dependency>,
    /// Every permitted source offering this version, `source` first.
    pub offered_by: Vec<SourceId>,
}

/// Supplies ordered candidates for package names.
pub trait CandidateProvider {
    /// Candidates for `name`, most preferred first.
    ///
    /// # Errors
    ///
    /// Returns an error if a source index cannot be loaded.
    fn candidates(&self, name: &str) -> Result<Vec<Candidate>, ResolveError>;

    /// Where `name` was looked for, for error messages.
    ///
    /// # Errors
    ///
    /// Returns an error if a source index cannot be loaded.
    fn location(&self, name: &str) -> Result<String, ResolveError>;
}

/// Who layered a constraint onto a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    /// The manifest itself.
    Root,
    /// A chosen version of another package.
    Package { name: String, version: GemVersion },
}

#[derive(Debug, Clone)]
struct Constraint {
    requirement: Requirement,
    requester: Requester,
}

/// Search state of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageState {
    Unassigned,
    Tentative { version: GemVersion, source: SourceId },
    Committed { version: GemVersion, source: SourceId },
    Failed(String),
}

#[derive(Debug)]
struct Frame {
    name: String,
    options: Vec<usize>,
    cursor: usize,
    pushed: Vec<String>,
}

/// The chosen candidate for every package reachable from the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Solution {
    packages: BTreeMap<String, Candidate>,
}

impl Solution {
    /// The chosen candidate for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Candidate> {
        self.packages.get(name)
    }

    /// Chosen packages ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Candidate)> {
        self.packages.iter().map(|(name, c)| (name.as_str(), c))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Searches for one version of every reachable package such that all
/// requirements hold.
pub struct VersionSolver<'p, P: CandidateProvider + ?Sized> {
    provider: &'p P,
    candidates: BTreeMap<String, Vec<Candidate>>,
    constraints: BTreeMap<String, Vec<Constraint>>,
    assigned: BTreeMap<String, usize>,
    states: BTreeMap<String, PackageState>,
    frames: Vec<Frame>,
    failure: Option<Failure>,
    /// First rejection caused only by an earlier choice, used when no
    /// harder dead end was met.
    clash: Option<Failure>,
    steps: usize,
}

impl<'p, P: CandidateProvider + ?Sized> VersionSolver<'p, P> {
    pub fn new(provider: &'p P) -> Self {
        Self {
            provider,
            candidates: BTreeMap::new(),
            constraints: BTreeMap::new(),
            assigned: BTreeMap::new(),
            states: BTreeMap::new(),
            frames: Vec::new(),
            failure: None,
            clash: None,
            steps: 0,
        }
    }

    /// Current state of `name`.
    #[must_use]
    pub fn state(&self, name: &str) -> PackageState {
        self.states
            .get(name)
            .cloned()
            .unwrap_or(PackageState::Unassigned)
    }

    /// Run the search from the manifest's top-level requirements.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Unsolvable`] with a derivation of the first
    /// dead end found, or any error raised by the provider.
    pub fn solve(&mut self, roots: &[PackageRequirement]) -> Result<Solution, ResolveError> {
        for root in roots {
            self.push_constraint(&root.name, root.requirement.clone(), Requester::Root);
        }

        loop {
            let Some(name) = self.next_name()? else {
                debug!("solved after {} steps", self.steps);
                return Ok(self.commit());
            };

            let options = self.viable(&name, None);
            if options.is_empty() {
                self.record_exhausted(&name)?;
                if !self.backtrack()? {
                    return Err(self.unsolvable());
                }
                continue;
            }

            trace!("deciding {name} among {} candidates", options.len());
            self.frames.push(Frame {
                name,
                options,
                cursor: 0,
                pushed: Vec::new(),
            });
            if !self.advance()? && !self.backtrack()? {
                return Err(self.unsolvable());
            }
        }
    }

    fn load(&mut self, name: &str) -> Result<(), ResolveError> {
        if !self.candidates.contains_key(name) {
            let candidates = self.provider.candidates(name)?;
            self.candidates.insert(name.to_string(), candidates);
        }
        Ok(())
    }

    fn push_constraint(&mut self, name: &str, requirement: Requirement, requester: Requester) {
        self.constraints
            .entry(name.to_string())
            .or_default()
            .push(Constraint {
                requirement,
                requester,
            });
    }

    /// Candidate indices of `name` meeting its constraints and `extra`.
    fn viable(&self, name: &str, extra: Option<&Requirement>) -> Vec<usize> {
        let constraints = self.constraints.get(name).map_or(&[][..], Vec::as_slice);
        let requirements: Vec<&Requirement> = constraints
            .iter()
            .map(|c| &c.requirement)
            .chain(extra)
            .collect();
        self.matching(name, &requirements)
    }

    fn matching(&self, name: &str, requirements: &[&Requirement]) -> Vec<usize> {
        let Some(candidates) = self.candidates.get(name) else {
            return Vec::new();
        };
        let prerelease = requirements.iter().any(|r| r.allows_prerelease());
        candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| prerelease || !c.version.is_prerelease())
            .filter(|(_, c)| requirements.iter().all(|r| r.matches(&c.version)))
            .map(|(i, _)| i)
            .collect()
    }

    fn next_name(&mut self) -> Result<Option<String>, ResolveError> {
        let pending: Vec<String> = self
            .constraints
            .keys()
            .filter(|name| !self.assigned.contains_key(*name))
            .cloned()
            .collect();

        let mut best: Option<(usize, String)> = None;
        for name in pending {
            self.load(&name)?;
            let count = self.viable(&name, None).len();
            if best.as_ref().map_or(true, |(fewest, _)| count < *fewest) {
                best = Some((count, name));
            }
        }
        Ok(best.map(|(_, name)| name))
    }

    /// Try the remaining candidates of the top frame until one fits.
    fn advance(&mut self) -> Result<bool, ResolveError> {
        let Some(frame) = self.frames.last() else {
            return Ok(false);
        };
        let name = frame.name.clone();
        let options = frame.options.clone();
        let mut cursor = frame.cursor;

        while let Some(&index) = options.get(cursor) {
            cursor += 1;
            self.steps += 1;
            let candidate = self.candidates[&name][index].clone();
            for dep in &candidate.dependencies {
                self.load(&dep.name)?;
            }

            if let Some((dep, exhausted)) = self.first_rejection(&name, &candidate) {
                trace!("{name} {} rejected by {dep}", candidate.version);
                if exhausted {
                    self.record_dead_end(&name, &candidate.version, &dep)?;
                } else if self.clash.is_none() {
                    self.clash = Some(self.dead_end(&name, &candidate.version, &dep)?);
                }
                continue;
            }

            self.assigned.insert(name.clone(), index);
            self.states.insert(
                name.clone(),
                PackageState::Tentative {
                    version: candidate.version.clone(),
                    source: candidate.source.clone(),
                },
            );
            let requester = Requester::Package {
                name: name.clone(),
                version: candidate.version.clone(),
            };
            let mut pushed = Vec::new();
            for dep in candidate.dependencies {
                self.push_constraint(&dep.name, dep.requirement, requester.clone());
                pushed.push(dep.name);
            }
            if let Some(frame) = self.frames.last_mut() {
                frame.cursor = cursor;
                frame.pushed = pushed;
            }
            return Ok(true);
        }

        if let Some(frame) = self.frames.last_mut() {
            frame.cursor = cursor;
        }
        Ok(false)
    }

    /// The first dependency of `candidate` that cannot be honoured, and
    /// whether that is because no version of it could ever satisfy the
    /// combined constraints (rather than a clash with the current choice).
    fn first_rejection(&self, name: &str, candidate: &Candidate) -> Option<(Dependency, bool)> {
        for dep in candidate.dependencies.iter().filter(|d| d.name != name) {
            let exhausted = self.viable(&dep.name, Some(&dep.requirement)).is_empty();
            let clashes = self.assigned.get(&dep.name).is_some_and(|&index| {
                !dep.requirement
                    .matches(&self.candidates[&dep.name][index].version)
            });
            if exhausted || clashes {
                return Some((dep.clone(), exhausted));
            }
        }
        None
    }

    fn backtrack(&mut self) -> Result<bool, ResolveError> {
        while let Some(frame) = self.frames.last_mut() {
            let name = frame.name.clone();
            let pushed = std::mem::take(&mut frame.pushed);
            self.unassign(&name, &pushed);
            if self.advance()? {
                return Ok(true);
            }
            self.frames.pop();
            self.states.insert(name, PackageState::Unassigned);
        }
        Ok(false)
    }

    fn unassign(&mut self, name: &str, pushed: &[String]) {
        self.assigned.remove(name);
        for dep in pushed.iter().rev() {
            if let Some(constraints) = self.constraints.get_mut(dep) {
                constraints.pop();
                if constraints.is_empty() {
                    self.constraints.remove(dep);
                }
            }
        }
    }

    fn commit(&mut self) -> Solution {
        let mut packages = BTreeMap::new();
        for (name, &index) in &self.assigned {
            let candidate = self.candidates[name][index].clone();
            self.states.insert(
                name.clone(),
                PackageState::Committed {
                    version: candidate.version.clone(),
                    source: candidate.source.clone(),
                },
            );
            packages.insert(name.clone(), candidate);
        }
        Solution { packages }
    }

    fn unsolvable(&self) -> ResolveError {
        let explanation = match self.failure.as_ref().or(self.clash.as_ref()) {
            Some(failure) => explain::render(failure),
            None => "version solving has failed.".to_string(),
        };
        ResolveError::Unsolvable { explanation }
    }

    /// Returns true if every viable version of `parent` requires `child`
    /// with exactly `requirement`.
    fn every(&self, parent: &str, child: &str, requirement: &Requirement) -> bool {
        let viable = self.viable(parent, None);
        let Some(candidates) = self.candidates.get(parent) else {
            return false;
        };
        !viable.is_empty()
            && viable.iter().all(|&i| {
                candidates[i]
                    .dependencies
                    .iter()
                    .any(|d| d.name == child && d.requirement == *requirement)
            })
    }

    /// Walk from a constraint up to the manifest through each package's
    /// earliest requester.
    fn chain(&self, requester: &Requester, child: &str, requirement: &Requirement) -> Chain {
        let mut edges = Vec::new();
        let mut seen = BTreeSet::new();
        let mut requester = requester.clone();
        let mut child = child.to_string();
        let mut requirement = requirement.clone();

        loop {
            let Requester::Package { name, version } = requester else {
                break;
            };
            edges.push(Edge {
                every: self.every(&name, &child, &requirement),
                parent: name.clone(),
                version,
                child,
                requirement,
            });
            let first = self.constraints.get(&name).and_then(|c| c.first());
            match first {
                Some(constraint) if seen.insert(name.clone()) => {
                    requester = constraint.requester.clone();
                    requirement = constraint.requirement.clone();
                    child = name;
                }
                _ => {
                    requirement = Requirement::any();
                    child = name;
                    break;
                }
            }
        }

        edges.reverse();
        Chain {
            root: Dependency::new(child, requirement),
            edges,
        }
    }

    fn record_failure(&mut self, failure: Failure) {
        if self.failure.is_none() {
            debug!("first dead end: {failure:?}");
            self.failure = Some(failure);
        }
    }

    /// `parent version` cannot be chosen because of `dep`.
    fn record_dead_end(
        &mut self,
        parent: &str,
        version: &GemVersion,
        dep: &Dependency,
    ) -> Result<(), ResolveError> {
        if self.failure.is_some() {
            return Ok(());
        }
        let failure = self.dead_end(parent, version, dep)?;
        self.record_failure(failure);
        Ok(())
    }

    /// Why `parent version` cannot be chosen because of `dep`.
    fn dead_end(
        &self,
        parent: &str,
        version: &GemVersion,
        dep: &Dependency,
    ) -> Result<Failure, ResolveError> {
        let requester = Requester::Package {
            name: parent.to_string(),
            version: version.clone(),
        };
        let incoming = self.chain(&requester, &dep.name, &dep.requirement);

        if self.matching(&dep.name, &[&dep.requirement]).is_empty() {
            return Ok(Failure::Missing {
                chain: incoming,
                term: dep.clone(),
                location: self.provider.location(&dep.name)?,
            });
        }
        let mut chains = self.blocking_chains(&dep.name, &dep.requirement);
        chains.push(incoming);
        Ok(Failure::Conflict { chains })
    }

    /// Chains of the existing constraints on `name` that exclude `requirement`.
    fn blocking_chains(&self, name: &str, requirement: &Requirement) -> Vec<Chain> {
        let constraints = self.constraints.get(name).map_or(&[][..], Vec::as_slice);
        let blocking: Vec<&Constraint> = constraints
            .iter()
            .filter(|c| self.matching(name, &[&c.requirement, requirement]).is_empty())
            .collect();
        let chosen = if blocking.is_empty() {
            constraints.iter().collect()
        } else {
            blocking
        };
        chosen
            .into_iter()
            .map(|c| self.chain(&c.requester, name, &c.requirement))
            .collect()
    }

    /// No candidate of `name` meets its constraints.
    fn record_exhausted(&mut self, name: &str) -> Result<(), ResolveError> {
        self.states
            .insert(name.to_string(), PackageState::Failed("no viable candidates".to_string()));
        if self.failure.is_some() {
            return Ok(());
        }
        let constraints = self.constraints.get(name).cloned().unwrap_or_default();
        let Some((first, rest)) = constraints.split_first() else {
            return Ok(());
        };

        let failure = if self.matching(name, &[&first.requirement]).is_empty() {
            Failure::Missing {
                chain: self.chain(&first.requester, name, &first.requirement),
                term: Dependency::new(name, first.requirement.clone()),
                location: self.provider.location(name)?,
            }
        } else {
            let mut chains = vec![self.chain(&first.requester, name, &first.requirement)];
            chains.extend(
                rest.iter()
                    .map(|c| self.chain(&c.requester, name, &c.requirement)),
            );
            Failure::Conflict { chains }
        };
        self.record_failure(failure);
        Ok(())
    }
}
