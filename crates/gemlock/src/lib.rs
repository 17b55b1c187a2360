//! Dependency resolution and lockfiles for gem packages drawn from several
//! remote sources.
//!
//! This crate provides:
//! - Parsing and validation of `gems.toml` manifests with global sources,
//!   source blocks and per-gem source pins
//! - Source priority rules that decide which remote may supply each package
//! - A backtracking version solver with human-readable failure derivations
//! - Reading and writing the `gems.lock` format, and deciding when a previous
//!   lock can be reused
//! - Checksum verification across sources, the lockfile and the local cache

mod cache;
mod checksum;
mod config;
mod error;
mod explain;
mod lockfile;
mod manifest;
mod priority;
mod provider;
mod reconcile;
mod run;
mod solver;
mod source;
mod storage;
mod version;

pub use cache::{ArtifactCache, CachedArtifact, DirectoryCache, NoCache, ARTIFACT_EXT};
pub use checksum::{
    Checksum, ChecksumError, ChecksumLedger, DigestGroup, Mismatch, MismatchReport, Origin,
};
pub use config::{ConfigError, ResolutionConfig, SourceMode, UpdateMode};
pub use error::{ResolveError, Warning};
pub use lockfile::{
    ChecksumEntry, LockedDependency, LockedSet, LockedSpec, LockfileError, SourceSection,
    LOCK_FILE,
};
pub use manifest::{Manifest, ManifestError, PackageRequirement, SourceBinding, MANIFEST_FILE};
pub use priority::{AmbiguousSource, Rule, SourceChoice, SourcePriorityResolver};
pub use provider::{Pin, Pins, SourceCandidates};
pub use reconcile::{LockChange, LockReconciler, Plan, Request, UpdateScope};
pub use run::{Outcome, Resolution};
pub use solver::{Candidate, CandidateProvider, PackageState, Requester, Solution, VersionSolver};
pub use source::{
    Dependency, Index, IndexError, IndexFetcher, IndexedSpec, SourceCatalog, SourceId,
    SourceRegistry, SourceUnreachable, StaticFetcher,
};
pub use storage::{FsStorage, LockStorage, MemoryStorage};
pub use version::{Comparator, GemVersion, Op, Requirement, VersionError};
