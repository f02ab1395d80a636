//! Repository consistency checking.
//!
//! Walks everything reachable from a [`RepositoryData`] and compares it with
//! what the blob store actually holds. Every problem found is collected into
//! one [`ConsistencyReport`] instead of stopping at the first.
//!
//! The same walk drives repository cleanup: the report's orphans are exactly
//! the blobs that can be deleted without losing anything still referenced.

use std::{
    collections::BTreeSet,
    fmt::{self, Display},
};

use snapvault_blobstore::BlobStore;
use snapvault_types::{IndexId, RepoGen, SnapshotId, SnapshotState};
use tracing::{debug, warn};

use crate::{
    RepositoryData, Result, SnapshotInfo,
    format::{Codec, SNAPSHOT_FORMAT},
    paths::{self, BlobRole},
    shard::ShardContainer,
};

/// Category of a consistency problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// The root pointer, newest root blob, and cluster state disagree.
    GenerationMismatch,
    /// A referenced blob does not exist.
    MissingBlob,
    /// A referenced blob exists but cannot be parsed.
    CorruptBlob,
    /// A blob is not referenced by the current root metadata.
    OrphanedBlob,
}

impl Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GenerationMismatch => "generation mismatch",
            Self::MissingBlob => "missing blob",
            Self::CorruptBlob => "corrupt blob",
            Self::OrphanedBlob => "orphaned blob",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub blob: String,
    pub detail: String,
}

impl Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.kind, self.blob, self.detail)
    }
}

/// Outcome of a consistency check.
#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    repository: String,
    generation: RepoGen,
    violations: Vec<Violation>,
    orphans: Vec<String>,
}

impl ConsistencyReport {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn generation(&self) -> RepoGen {
        self.generation
    }

    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn violations_of(&self, kind: ViolationKind) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(move |v| v.kind == kind)
    }

    /// Unreferenced blobs that are safe to delete.
    pub fn orphans(&self) -> &[String] {
        &self.orphans
    }
}

impl Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_consistent() {
            return write!(f, "repository [{}] at generation {} is consistent", self.repository, self.generation);
        }
        write!(
            f,
            "repository [{}] at generation {} has {} violation(s):",
            self.repository,
            self.generation,
            self.violations.len()
        )?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Walk
// ============================================================================

struct Walk<'a> {
    repository: &'a str,
    store: &'a dyn BlobStore,
    existing: BTreeSet<String>,
    referenced: BTreeSet<String>,
    /// Folders whose content could not be resolved; nothing under them is
    /// reported as orphaned.
    unresolved: Vec<String>,
    violations: Vec<Violation>,
}

impl<'a> Walk<'a> {
    fn violation(&mut self, kind: ViolationKind, blob: impl Into<String>, detail: impl Into<String>) {
        let violation = Violation {
            kind,
            blob: blob.into(),
            detail: detail.into(),
        };
        debug!(repository = self.repository, %violation, "consistency violation");
        self.violations.push(violation);
    }

    /// Marks `blob` referenced; returns whether it exists.
    fn require(&mut self, blob: String, what: &str) -> bool {
        let exists = self.existing.contains(&blob);
        if !exists {
            self.violation(ViolationKind::MissingBlob, blob.clone(), format!("{what} is missing"));
        }
        self.referenced.insert(blob);
        exists
    }

    fn shards(&self) -> ShardContainer<'a> {
        ShardContainer {
            repository: self.repository,
            store: self.store,
            codec: Codec::None,
        }
    }

    fn check_root(&mut self, data: &RepositoryData, published: Option<RepoGen>) {
        let generation = data.gen_id();
        if generation.is_materialized() {
            self.require(paths::root_index_blob(generation), "root metadata");
        }
        let newest = self
            .existing
            .iter()
            .filter_map(|name| paths::parse_root_generation(name))
            .max();
        if let Some(newest) = newest
            && newest != generation.as_i64()
        {
            self.violation(
                ViolationKind::GenerationMismatch,
                paths::root_index_blob(RepoGen::new(newest)),
                format!("newest root blob does not match generation {generation}"),
            );
        }

        if self.existing.contains(paths::INDEX_LATEST_BLOB) {
            self.referenced.insert(paths::INDEX_LATEST_BLOB.to_string());
            match self.store.get(paths::INDEX_LATEST_BLOB) {
                Ok(bytes) => {
                    let pointer = <[u8; 8]>::try_from(bytes.as_ref()).ok().map(i64::from_be_bytes);
                    if pointer != Some(generation.as_i64()) {
                        self.violation(
                            ViolationKind::GenerationMismatch,
                            paths::INDEX_LATEST_BLOB,
                            format!("points to {pointer:?} instead of generation {generation}"),
                        );
                    }
                }
                Err(e) => self.violation(ViolationKind::CorruptBlob, paths::INDEX_LATEST_BLOB, e.to_string()),
            }
        }

        if let Some(published) = published
            && published != generation
        {
            self.violation(
                ViolationKind::GenerationMismatch,
                "cluster state",
                format!("published generation {published} does not match generation {generation}"),
            );
        }
    }

    fn check_snapshot(&mut self, snapshot: &SnapshotId) {
        let blob = paths::snapshot_blob(snapshot.uuid());
        if self.require(blob.clone(), "snapshot info") {
            let parsed = self.store.get(&blob).map_err(Into::into).and_then(|bytes| {
                let body = SNAPSHOT_FORMAT.decode(self.repository, &blob, &bytes)?;
                SnapshotInfo::from_json(self.repository, &blob, &body)
            });
            match parsed {
                Ok(info) if info.snapshot_id == *snapshot => {}
                Ok(info) => self.violation(
                    ViolationKind::CorruptBlob,
                    blob,
                    format!("describes snapshot {} instead of {snapshot}", info.snapshot_id),
                ),
                Err(e) => self.violation(ViolationKind::CorruptBlob, blob, e.to_string()),
            }
        }
        self.require(paths::global_metadata_blob(snapshot.uuid()), "global metadata");
    }

    fn check_index(&mut self, data: &RepositoryData, index: &IndexId) {
        let generations = data.index_meta_generations();
        for snapshot in data.snapshots_for_index(index) {
            let blob_uuid = generations.index_meta_blob_uuid(snapshot, index);
            self.require(paths::index_metadata_blob(index, &blob_uuid), "index metadata");
        }

        let shard_count = match self.shards().shard_count(data, index) {
            Ok(count) => count,
            Err(e) => {
                self.violation(ViolationKind::CorruptBlob, paths::index_dir(index), e.to_string());
                self.unresolved.push(paths::index_dir(index));
                return;
            }
        };
        for shard in 0..shard_count {
            self.check_shard(data, index, shard);
        }
    }

    fn check_shard(&mut self, data: &RepositoryData, index: &IndexId, shard: u32) {
        let dir = paths::shard_dir(index, shard);
        let generation = data.shard_generations().get(index, shard);
        if let Some(generation) = generation
            && !self.require(paths::shard_index_blob(index, shard, generation), "shard generation")
        {
            self.unresolved.push(dir);
            return;
        }
        let resolved = self.shards().resolve_index(index, shard, generation);
        let (list, resolved) = match resolved {
            Ok(found) => found,
            Err(e) => {
                self.violation(ViolationKind::CorruptBlob, dir.clone(), e.to_string());
                self.unresolved.push(dir);
                return;
            }
        };
        if let Some(resolved) = resolved {
            self.referenced.insert(paths::shard_index_blob(index, shard, &resolved));
        }

        for entry in list.snapshots() {
            self.require(paths::shard_snapshot_blob(index, shard, &entry.uuid), "shard snapshot");
            for file in &entry.files {
                self.require(paths::data_blob(index, shard, &file.name), "data blob");
            }
        }
        for snapshot in data.snapshots_for_index(index) {
            if data.state(snapshot) == Some(SnapshotState::Success) && !list.contains(snapshot.uuid()) {
                self.violation(
                    ViolationKind::MissingBlob,
                    paths::shard_snapshot_blob(index, shard, snapshot.uuid()),
                    format!("successful snapshot {snapshot} is not listed by the shard"),
                );
            }
        }
    }

    fn finish(mut self, data: &RepositoryData) -> ConsistencyReport {
        let orphans: Vec<String> = self
            .existing
            .iter()
            .filter(|name| !self.referenced.contains(*name))
            .filter(|name| !self.unresolved.iter().any(|dir| name.starts_with(dir.as_str())))
            .cloned()
            .collect();
        for orphan in &orphans {
            self.violation(ViolationKind::OrphanedBlob, orphan.clone(), "not referenced by root metadata");
        }
        ConsistencyReport {
            repository: self.repository.to_string(),
            generation: data.gen_id(),
            violations: self.violations,
            orphans,
        }
    }
}

/// Checks every blob of `repository` against `data`.
///
/// `published` is the generation cluster state points at, when known.
/// In-flight temporary files and verification folders are ignored.
pub fn check_consistency(
    repository: &str,
    store: &dyn BlobStore,
    data: &RepositoryData,
    published: Option<RepoGen>,
) -> Result<ConsistencyReport> {
    let existing = store
        .list("")?
        .into_iter()
        .filter(|name| !matches!(BlobRole::classify(name), BlobRole::Temp | BlobRole::Verification))
        .collect();
    let mut walk = Walk {
        repository,
        store,
        existing,
        referenced: BTreeSet::new(),
        unresolved: Vec::new(),
        violations: Vec::new(),
    };

    walk.check_root(data, published);
    for snapshot in data.snapshot_ids() {
        walk.check_snapshot(snapshot);
    }
    for index in data.indices() {
        walk.check_index(data, index);
    }

    let report = walk.finish(data);
    if report.is_consistent() {
        debug!(repository, generation = %report.generation(), "repository is consistent");
    } else {
        warn!(
            repository,
            generation = %report.generation(),
            violations = report.violations().len(),
            "repository is inconsistent"
        );
    }
    Ok(report)
}
