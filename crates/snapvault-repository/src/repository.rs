//! The repository contract and its blob store implementation.
//!
//! A [`Repository`] stores snapshots for one registered repository on one
//! node. Every node holds its own instance over the same shared blob store;
//! they coordinate only through cluster state and create-if-absent writes.
//!
//! Mutations follow the same shape:
//!
//! 1. write everything the new root metadata will reference
//! 2. commit the new root metadata through the [`GenerationTracker`],
//!    retrying from a fresh read on concurrent modification
//! 3. delete what the old root metadata referenced and the new one does not

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::Arc,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snapvault_blobstore::{BlobStore, BlobStoreError};
use snapvault_cluster::{ClusterService, EntryState};
use snapvault_types::{IndexId, RepoGen, Settings, ShardGeneration, SnapshotId, Version};
use tracing::{debug, info, warn};

use crate::{
    Faultable, GenerationTracker, IndexMetadataSnapshot, NewSnapshot, RepositoryData, RepositoryError,
    Result, ShardGenerations, ShardSnapshotRequest, SnapshotInfo, check_consistency,
    format::{ChecksumBlobFormat, Codec, GLOBAL_METADATA_FORMAT, INDEX_METADATA_FORMAT, SNAPSHOT_FORMAT},
    paths,
    shard::ShardContainer,
};

/// Repository setting: directory of an `fs` repository.
pub const LOCATION_SETTING: &str = "location";
/// Repository setting: LZ4-compress metadata blobs.
pub const COMPRESS_SETTING: &str = "compress";
/// Repository setting: reject every mutation.
pub const READONLY_SETTING: &str = "readonly";

/// Default bound on finalize and delete attempts.
pub const DEFAULT_MAX_FINALIZE_RETRIES: u32 = 10;

// ============================================================================
// Requests and Results
// ============================================================================

/// Metadata captured when a snapshot starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub global: BTreeMap<String, String>,
    pub indices: BTreeMap<IndexId, IndexMetadataSnapshot>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalMetadataDoc {
    global: BTreeMap<String, String>,
}

/// Commit of a completed snapshot into the repository.
#[derive(Debug, Clone)]
pub struct FinalizeSnapshot {
    /// Every index of the snapshot, with the new generation of each
    /// successful shard.
    pub shard_generations: ShardGenerations,
    /// Generation the snapshot expects to commit on top of.
    pub repository_state_id: RepoGen,
    pub metadata: SnapshotMetadata,
    pub snapshot_info: SnapshotInfo,
    /// Format to write the root metadata in, lowered to the oldest snapshot
    /// format already present.
    pub version: Version,
}

/// What a cleanup removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupResult {
    pub blobs: u64,
    pub bytes: u64,
}

/// Tunables that are not repository settings.
#[derive(Debug, Clone, Copy)]
pub struct RepositoryOptions {
    pub max_finalize_retries: u32,
    /// Value of the `compress` setting when a repository does not set it.
    pub compress: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            max_finalize_retries: DEFAULT_MAX_FINALIZE_RETRIES,
            compress: false,
        }
    }
}

/// Returns true if new shard generations must be numeric: the snapshot is
/// written in an old format, or the repository already holds one.
pub fn legacy_shard_generations(data: &RepositoryData, version: Version) -> bool {
    version < Version::SHARD_GEN_IN_REPO_DATA
        || data
            .min_version()
            .is_some_and(|min| min < Version::SHARD_GEN_IN_REPO_DATA)
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Snapshot storage for one repository on one node.
pub trait Repository: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn repo_type(&self) -> &str;

    fn settings(&self) -> &Settings;

    fn is_readonly(&self) -> bool;

    /// Root metadata at the generation published in cluster state, or the
    /// latest one on disk while the repository is untracked. Reading never
    /// starts tracking; the first commit does.
    fn repository_data(&self) -> Result<Arc<RepositoryData>>;

    /// Commits a completed snapshot and returns the new root metadata.
    fn finalize_snapshot(&self, request: FinalizeSnapshot) -> Result<Arc<RepositoryData>>;

    /// Removes `snapshots`, expecting the published generation to be
    /// `expected`, and cleans up what they alone referenced.
    fn delete_snapshots(&self, snapshots: &[SnapshotId], expected: RepoGen) -> Result<Arc<RepositoryData>>;

    /// Stores one shard of a running snapshot. `aborted` is polled between
    /// files.
    fn snapshot_shard(&self, request: ShardSnapshotRequest, aborted: &dyn Fn() -> bool) -> Result<ShardGeneration>;

    fn snapshot_info(&self, snapshot: &SnapshotId) -> Result<SnapshotInfo>;

    /// Deletes every blob the current root metadata does not reference.
    fn cleanup(&self) -> Result<CleanupResult>;

    /// Writes the verification marker on the master. Returns `None` for
    /// readonly repositories.
    fn start_verification(&self) -> Result<Option<String>>;

    /// Checks from `node` that the master's verification marker is visible.
    fn verify(&self, seed: &str, node: &str) -> Result<()>;

    fn end_verification(&self, seed: &str) -> Result<()>;

    fn blob_store(&self) -> Arc<dyn BlobStore>;

    fn invalidate_cache(&self);

    /// Fault injection, for repositories that support it.
    fn as_faultable(&self) -> Option<&dyn Faultable> {
        None
    }

    /// Releases resources held by the repository. Called on node shutdown.
    fn close(&self) {}
}

// ============================================================================
// Blob Store Repository
// ============================================================================

/// [`Repository`] over any [`BlobStore`].
#[derive(Debug)]
pub struct BlobStoreRepository {
    name: String,
    repo_type: String,
    settings: Settings,
    store: Arc<dyn BlobStore>,
    cluster: Arc<ClusterService>,
    tracker: GenerationTracker,
    codec: Codec,
    readonly: bool,
    max_finalize_retries: u32,
}

impl BlobStoreRepository {
    pub fn new(
        name: impl Into<String>,
        repo_type: impl Into<String>,
        settings: Settings,
        store: Arc<dyn BlobStore>,
        cluster: Arc<ClusterService>,
        options: RepositoryOptions,
    ) -> Result<Self> {
        let name = name.into();
        let codec = Codec::from_compress(settings.get_bool(COMPRESS_SETTING, options.compress)?);
        let readonly = settings.get_bool(READONLY_SETTING, false)?;
        let tracker = GenerationTracker::new(name.clone(), Arc::clone(&store), Arc::clone(&cluster), codec);
        Ok(Self {
            name,
            repo_type: repo_type.into(),
            settings,
            store,
            cluster,
            tracker,
            codec,
            readonly,
            max_finalize_retries: options.max_finalize_retries.max(1),
        })
    }

    pub fn tracker(&self) -> &GenerationTracker {
        &self.tracker
    }

    fn shards(&self) -> ShardContainer<'_> {
        ShardContainer {
            repository: &self.name,
            store: self.store.as_ref(),
            codec: self.codec,
        }
    }

    fn illegal_state(&self, reason: impl Into<String>) -> RepositoryError {
        RepositoryError::IllegalRepositoryState {
            repository: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(self.illegal_state("repository is readonly"));
        }
        Ok(())
    }

    fn put_document<T: Serialize>(
        &self,
        format: ChecksumBlobFormat,
        blob: &str,
        what: &'static str,
        value: &T,
    ) -> Result<()> {
        let body = serde_json::to_vec(value).map_err(|source| RepositoryError::Serialization { what, source })?;
        self.store.put(blob, format.encode(&body, self.codec), false)?;
        Ok(())
    }

    fn delete_best_effort(&self, blobs: &[String], context: &str) {
        for blob in blobs {
            if let Err(e) = self.store.delete(blob) {
                warn!(repository = %self.name, blob = %blob, error = %e, "failed to delete blob after {context}");
            }
        }
    }

    /// Fails if a deletion aborted `snapshot` while it was running.
    fn ensure_not_aborted(&self, snapshot: &SnapshotId) -> Result<()> {
        let aborted = self
            .cluster
            .state()
            .snapshots()
            .get(snapshot)
            .is_some_and(|entry| entry.state == EntryState::Aborted);
        if aborted {
            return Err(RepositoryError::Aborted {
                repository: self.name.clone(),
                snapshot: snapshot.name().to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Writes index metadata, global metadata, and the snapshot info.
    /// Returns the index metadata lookup and the identifiers this snapshot
    /// introduces.
    fn write_snapshot_metadata(
        &self,
        request: &FinalizeSnapshot,
        data: &RepositoryData,
    ) -> Result<(BTreeMap<IndexId, String>, BTreeMap<String, String>)> {
        let snapshot = &request.snapshot_info.snapshot_id;
        let mut lookup = BTreeMap::new();
        let mut new_identifiers = BTreeMap::new();

        for (index, meta) in &request.metadata.indices {
            if !request.version.includes_index_generations() {
                let blob = paths::index_metadata_blob(index, snapshot.uuid());
                self.put_document(INDEX_METADATA_FORMAT, &blob, "index metadata", meta)?;
                continue;
            }
            let body = serde_json::to_vec(meta).map_err(|source| RepositoryError::Serialization {
                what: "index metadata",
                source,
            })?;
            let identifier = meta.identifier(&body);
            let known = data
                .index_meta_generations()
                .blob_uuid_for_identifier(&identifier)
                .is_some()
                || new_identifiers.contains_key(&identifier);
            if !known {
                let blob_uuid = snapvault_types::random_uuid();
                let blob = paths::index_metadata_blob(index, &blob_uuid);
                self.store
                    .put(&blob, INDEX_METADATA_FORMAT.encode(&body, self.codec), true)?;
                new_identifiers.insert(identifier.clone(), blob_uuid);
            }
            lookup.insert(index.clone(), identifier);
        }

        let global = GlobalMetadataDoc {
            global: request.metadata.global.clone(),
        };
        self.put_document(
            GLOBAL_METADATA_FORMAT,
            &paths::global_metadata_blob(snapshot.uuid()),
            "global metadata",
            &global,
        )?;

        let info = request.snapshot_info.to_json()?;
        self.store.put(
            &paths::snapshot_blob(snapshot.uuid()),
            SNAPSHOT_FORMAT.encode(&info, self.codec),
            false,
        )?;
        Ok((lookup, new_identifiers))
    }

    /// Deletes shard generations the committed snapshot replaced.
    fn delete_replaced_generations(&self, before: &RepositoryData, updates: &ShardGenerations) {
        let stale: Vec<String> = updates
            .iter()
            .filter_map(|(index, shard, generation)| {
                let previous = before.shard_generations().get(index, shard)?;
                (previous != generation && !previous.is_legacy())
                    .then(|| paths::shard_index_blob(index, shard, previous))
            })
            .collect();
        self.delete_best_effort(&stale, "finalize");
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Writes new shard generations without `removed` for every shard of an
    /// index that survives the deletion.
    fn rewrite_shards(
        &self,
        data: &RepositoryData,
        removed: &BTreeSet<String>,
        legacy: bool,
        written: &mut Vec<String>,
    ) -> Result<ShardGenerations> {
        let shards = self.shards();
        let affected: BTreeSet<&IndexId> = data
            .snapshot_ids()
            .filter(|id| removed.contains(id.uuid()))
            .flat_map(|id| data.indices_for_snapshot(id))
            .collect();

        let mut replaced = ShardGenerations::empty();
        for index in affected {
            let survives = data
                .snapshots_for_index(index)
                .iter()
                .any(|id| !removed.contains(id.uuid()));
            if !survives {
                continue;
            }
            let count = shards.shard_count(data, index)?;
            replaced = replaced.with_index(index.clone(), count);
            for shard in 0..count {
                let current = data.shard_generations().get(index, shard);
                let (list, resolved) = shards.resolve_index(index, shard, current)?;
                let updated = list.without_snapshots(removed);
                let generation = if updated == list {
                    current.cloned()
                } else if updated.is_empty() && !legacy {
                    None
                } else {
                    let generation = ShardContainer::next_generation(resolved.as_ref(), legacy);
                    shards.write_index(index, shard, &generation, &updated)?;
                    written.push(paths::shard_index_blob(index, shard, &generation));
                    Some(generation)
                };
                replaced = replaced.with(index.clone(), shard, generation);
            }
        }
        Ok(replaced)
    }

    /// Deletes every orphan of `data`. Returns what was removed.
    fn sweep(&self, data: &RepositoryData) -> Result<CleanupResult> {
        let report = check_consistency(&self.name, self.store.as_ref(), data, None)?;
        let mut result = CleanupResult::default();
        for blob in report.orphans() {
            let size = self.store.size(blob).unwrap_or(0);
            match self.store.delete(blob) {
                Ok(()) => {
                    result.blobs += 1;
                    result.bytes += size;
                }
                Err(e) => warn!(repository = %self.name, blob = %blob, error = %e, "failed to delete orphaned blob"),
            }
        }
        if result.blobs > 0 {
            debug!(repository = %self.name, blobs = result.blobs, bytes = result.bytes, "removed orphaned blobs");
        }
        Ok(result)
    }
}

impl Repository for BlobStoreRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn repo_type(&self) -> &str {
        &self.repo_type
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn repository_data(&self) -> Result<Arc<RepositoryData>> {
        self.tracker.latest()
    }

    fn finalize_snapshot(&self, request: FinalizeSnapshot) -> Result<Arc<RepositoryData>> {
        self.ensure_writable()?;
        let snapshot = request.snapshot_info.snapshot_id.clone();
        info!(
            repository = %self.name,
            snapshot = %snapshot,
            state = %request.snapshot_info.state,
            version = %request.version,
            "finalizing snapshot"
        );

        let start = self.repository_data()?;
        let (lookup, new_identifiers) = self.write_snapshot_metadata(&request, &start)?;

        for attempt in 1..=self.max_finalize_retries {
            self.ensure_not_aborted(&snapshot)?;
            let data = self.repository_data()?;
            let expected = if attempt == 1 {
                request.repository_state_id
            } else {
                data.gen_id()
            };
            if data.snapshot_by_name(snapshot.name()).is_some() {
                return Err(RepositoryError::SnapshotExists {
                    repository: self.name.clone(),
                    snapshot: snapshot.name().to_string(),
                });
            }

            let updated = data.add_snapshot(NewSnapshot {
                snapshot_id: snapshot.clone(),
                state: request.snapshot_info.state,
                version: request.version,
                shard_generations: request.shard_generations.clone(),
                index_meta_lookup: lookup.clone(),
                new_identifiers: new_identifiers.clone(),
            });
            let version = updated
                .min_version()
                .map_or(request.version, |min| min.min(request.version));

            match self.tracker.write_new(expected, updated, version) {
                Ok(committed) => {
                    self.delete_replaced_generations(&data, &request.shard_generations);
                    info!(
                        repository = %self.name,
                        snapshot = %snapshot,
                        generation = %committed.gen_id(),
                        "finalized snapshot"
                    );
                    return Ok(committed);
                }
                Err(e) if e.is_concurrent_modification() => {
                    warn!(repository = %self.name, snapshot = %snapshot, attempt, error = %e, "retrying finalize");
                    self.tracker.invalidate_cache();
                }
                Err(e) => return Err(e),
            }
        }
        Err(RepositoryError::RepositoryBusy {
            repository: self.name.clone(),
            attempts: self.max_finalize_retries,
        })
    }

    fn delete_snapshots(&self, snapshots: &[SnapshotId], expected: RepoGen) -> Result<Arc<RepositoryData>> {
        self.ensure_writable()?;
        if !expected.is_known() || !self.cluster.state().repository_generation(&self.name).is_known() {
            return Err(self.illegal_state("cannot delete from a repository whose generation is not tracked"));
        }
        let removed: BTreeSet<String> = snapshots.iter().map(|id| id.uuid().to_string()).collect();

        for attempt in 1..=self.max_finalize_retries {
            let data = self.repository_data()?;
            let expected = if attempt == 1 { expected } else { data.gen_id() };
            if let Some(missing) = snapshots.iter().find(|id| !data.contains(id)) {
                return Err(RepositoryError::SnapshotMissing {
                    repository: self.name.clone(),
                    snapshot: missing.name().to_string(),
                });
            }

            let remaining = data.remove_snapshots(snapshots, &ShardGenerations::empty());
            let legacy = legacy_shard_generations(&remaining, Version::CURRENT);
            let mut written = Vec::new();
            let replaced = match self.rewrite_shards(&data, &removed, legacy, &mut written) {
                Ok(replaced) => replaced,
                Err(e) => {
                    self.delete_best_effort(&written, "failed delete");
                    return Err(e);
                }
            };
            let updated = data.remove_snapshots(snapshots, &replaced);
            let version = updated
                .min_version()
                .map_or(Version::CURRENT, |min| min.min(Version::CURRENT));

            match self.tracker.write_new(expected, updated, version) {
                Ok(committed) => {
                    info!(
                        repository = %self.name,
                        snapshots = snapshots.len(),
                        generation = %committed.gen_id(),
                        "deleted snapshots"
                    );
                    if let Err(e) = self.sweep(&committed) {
                        warn!(repository = %self.name, error = %e, "failed to clean up after delete");
                    }
                    return Ok(committed);
                }
                Err(e) if e.is_concurrent_modification() => {
                    self.delete_best_effort(&written, "concurrent modification");
                    warn!(repository = %self.name, attempt, error = %e, "retrying delete");
                    self.tracker.invalidate_cache();
                }
                Err(e) => {
                    self.delete_best_effort(&written, "failed delete");
                    return Err(e);
                }
            }
        }
        Err(RepositoryError::RepositoryBusy {
            repository: self.name.clone(),
            attempts: self.max_finalize_retries,
        })
    }

    fn snapshot_shard(&self, request: ShardSnapshotRequest, aborted: &dyn Fn() -> bool) -> Result<ShardGeneration> {
        self.ensure_writable()?;
        self.shards().snapshot(&request, aborted)
    }

    fn snapshot_info(&self, snapshot: &SnapshotId) -> Result<SnapshotInfo> {
        let blob = paths::snapshot_blob(snapshot.uuid());
        let bytes = self.store.get(&blob).map_err(|e| match e {
            BlobStoreError::NotFound { .. } => RepositoryError::SnapshotMissing {
                repository: self.name.clone(),
                snapshot: snapshot.name().to_string(),
            },
            other => other.into(),
        })?;
        let body = SNAPSHOT_FORMAT.decode(&self.name, &blob, &bytes)?;
        SnapshotInfo::from_json(&self.name, &blob, &body)
    }

    fn cleanup(&self) -> Result<CleanupResult> {
        self.ensure_writable()?;
        let state = self.cluster.state();
        if !state.repository_generation(&self.name).is_known() {
            return Err(self.illegal_state("cannot clean up a repository whose generation is not tracked"));
        }
        if state.has_repository_operations(&self.name) {
            return Err(self.illegal_state("cannot clean up while snapshot operations are running"));
        }
        let data = self.repository_data()?;
        let result = self.sweep(&data)?;
        info!(repository = %self.name, blobs = result.blobs, bytes = result.bytes, "cleaned up repository");
        Ok(result)
    }

    fn start_verification(&self) -> Result<Option<String>> {
        if self.readonly {
            return Ok(None);
        }
        let seed = snapvault_types::random_uuid();
        let blob = format!("{}master.dat", paths::verification_dir(&seed));
        self.store.put(&blob, Bytes::from(seed.clone().into_bytes()), true)?;
        debug!(repository = %self.name, seed = %seed, "started repository verification");
        Ok(Some(seed))
    }

    fn verify(&self, seed: &str, node: &str) -> Result<()> {
        let dir = paths::verification_dir(seed);
        let master = self.store.get(&format!("{dir}master.dat")).map_err(|e| {
            self.illegal_state(format!("node [{node}] cannot read the verification marker: {e}"))
        })?;
        if master.as_ref() != seed.as_bytes() {
            return Err(self.illegal_state(format!(
                "node [{node}] sees a different verification marker; is the location shared?"
            )));
        }
        if !self.readonly {
            self.store
                .put(&format!("{dir}data-{node}.dat"), Bytes::from(node.to_string()), false)?;
        }
        Ok(())
    }

    fn end_verification(&self, seed: &str) -> Result<()> {
        for blob in self.store.list(&paths::verification_dir(seed))? {
            self.store.delete(&blob)?;
        }
        Ok(())
    }

    fn blob_store(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.store)
    }

    fn invalidate_cache(&self) {
        self.tracker.invalidate_cache();
    }
}

#[cfg(test)]
mod tests;
