//! Root generation tracking.
//!
//! The root metadata of a repository lives in `index-<N>` blobs. Writers
//! never overwrite one: a commit reserves the next generation in cluster
//! state, creates the new blob with create-if-absent semantics, and only
//! then publishes the generation. Readers follow the published pointer, so
//! a generation is never observed before it is durable.
//!
//! ```text
//!   reserve pending = max(pending, expected) + 1     (cluster state)
//!   put index-<pending> if absent                    (blob store)
//!   put index.latest                                 (blob store, advisory)
//!   publish generation = pending                     (cluster state)
//!   delete index-<M> for M < pending                 (blob store, best effort)
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use snapvault_blobstore::{BlobStore, BlobStoreError};
use snapvault_cluster::{ClusterService, ClusterState, RepositoryMetadata};
use snapvault_types::{RepoGen, Version};
use tracing::{debug, info, warn};

use crate::{
    RepositoryData, RepositoryError, Result, SnapshotInfo,
    format::{Codec, INDEX_N_FORMAT, SNAPSHOT_FORMAT},
    paths,
};

/// Attempts to read the published generation before giving up when it
/// keeps moving underneath the reader.
const READ_ATTEMPTS: usize = 5;

#[derive(Debug, Default)]
struct TrackerState {
    /// Highest generation this node has read or written.
    observed: Option<RepoGen>,
    cached: Option<Arc<RepositoryData>>,
}

/// Reads and commits root metadata for one repository on one node.
#[derive(Debug)]
pub struct GenerationTracker {
    repository: String,
    store: Arc<dyn BlobStore>,
    cluster: Arc<ClusterService>,
    codec: Codec,
    state: Mutex<TrackerState>,
}

impl GenerationTracker {
    pub fn new(
        repository: impl Into<String>,
        store: Arc<dyn BlobStore>,
        cluster: Arc<ClusterService>,
        codec: Codec,
    ) -> Self {
        Self {
            repository: repository.into(),
            store,
            cluster,
            codec,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect("generation tracker lock poisoned")
    }

    fn observe(&self, generation: RepoGen) {
        let mut state = self.lock();
        state.observed = Some(state.observed.map_or(generation, |seen| seen.max(generation)));
    }

    /// Highest generation this node has seen, if any.
    pub fn observed(&self) -> Option<RepoGen> {
        self.lock().observed
    }

    /// Drops the cached root metadata.
    pub fn invalidate_cache(&self) {
        self.lock().cached = None;
    }

    fn repository_metadata<'a>(&self, state: &'a ClusterState) -> Result<&'a RepositoryMetadata> {
        state
            .metadata()
            .repository(&self.repository)
            .ok_or_else(|| RepositoryError::IllegalRepositoryState {
                repository: self.repository.clone(),
                reason: "repository is not registered in cluster state".to_string(),
            })
    }

    fn concurrent_modification(&self, expected: RepoGen, actual: RepoGen) -> RepositoryError {
        RepositoryError::ConcurrentModification {
            repository: self.repository.clone(),
            expected,
            actual,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Latest generation present in the blob store, from `index.latest` and
    /// a listing of `index-N` blobs, whichever is higher.
    pub fn latest_on_disk(&self) -> Result<RepoGen> {
        let pointer = match self.store.get(paths::INDEX_LATEST_BLOB) {
            Ok(bytes) => match <[u8; 8]>::try_from(bytes.as_ref()) {
                Ok(raw) => Some(i64::from_be_bytes(raw)),
                Err(_) => {
                    warn!(repository = %self.repository, len = bytes.len(), "ignoring malformed index.latest");
                    None
                }
            },
            Err(BlobStoreError::NotFound { .. }) => None,
            Err(e) => {
                warn!(repository = %self.repository, error = %e, "failed to read index.latest, listing instead");
                None
            }
        };
        let listed = self
            .store
            .list(paths::INDEX_FILE_PREFIX)?
            .iter()
            .filter_map(|name| paths::parse_root_generation(name))
            .max();
        Ok(pointer
            .into_iter()
            .chain(listed)
            .max()
            .map_or(RepoGen::EMPTY, RepoGen::new))
    }

    /// Reads the root metadata at `generation`.
    ///
    /// Snapshots whose format version is not recorded in the root document
    /// get it from their snapshot info, or [`Version::OLD_SNAPSHOT_FORMAT`]
    /// when that cannot be read.
    pub fn read(&self, generation: RepoGen) -> Result<RepositoryData> {
        if !generation.is_materialized() {
            return Ok(RepositoryData::empty());
        }
        let blob = paths::root_index_blob(generation);
        let bytes = self.store.get(&blob).map_err(|e| match e {
            BlobStoreError::NotFound { .. } => RepositoryError::CorruptState {
                repository: self.repository.clone(),
                blob: blob.clone(),
                reason: "root metadata blob is missing".to_string(),
            },
            other => other.into(),
        })?;
        let body = INDEX_N_FORMAT.decode(&self.repository, &blob, &bytes)?;
        let data = RepositoryData::snapshots_from_json(&self.repository, &body, generation, true)?;

        let resolved = data
            .snapshots_missing_version()
            .map(|id| {
                let version = self
                    .read_snapshot_version(id.uuid())
                    .unwrap_or(Version::OLD_SNAPSHOT_FORMAT);
                (id.uuid().to_string(), version)
            })
            .collect();
        Ok(data.with_resolved_versions(resolved))
    }

    fn read_snapshot_version(&self, uuid: &str) -> Option<Version> {
        let blob = paths::snapshot_blob(uuid);
        let bytes = self.store.get(&blob).ok()?;
        let body = SNAPSHOT_FORMAT.decode(&self.repository, &blob, &bytes).ok()?;
        SnapshotInfo::from_json(&self.repository, &blob, &body)
            .ok()
            .map(|info| info.version)
    }

    /// Generation readers should load: the published one, or the latest on
    /// disk while cluster state tracks none. Reading never starts tracking.
    pub fn current(&self) -> Result<RepoGen> {
        let published = self.repository_metadata(&self.cluster.state())?.generation;
        if published.is_known() {
            Ok(published)
        } else {
            self.latest_on_disk()
        }
    }

    /// Makes sure cluster state tracks a generation for the repository,
    /// starting from the latest one on disk, and returns it. Only writers
    /// call this.
    fn ensure_tracked(&self) -> Result<RepoGen> {
        let current = self.repository_metadata(&self.cluster.state())?.generation;
        if current.is_known() {
            return Ok(current);
        }
        let on_disk = self.latest_on_disk()?;
        let state = self
            .cluster
            .submit_update::<_, RepositoryError>("initialize repository generation", |state| {
                let meta = self.repository_metadata(state)?;
                if meta.generation.is_known() {
                    return Ok(state.clone());
                }
                Ok(state.clone().with_repository_update(&self.repository, |meta| {
                    meta.generation = on_disk;
                    meta.pending_generation = on_disk;
                }))
            })?;
        let generation = self.repository_metadata(&state)?.generation;
        info!(repository = %self.repository, generation = %generation, "tracking repository generation");
        Ok(generation)
    }

    /// Root metadata at the [`current`](Self::current) generation.
    pub fn latest(&self) -> Result<Arc<RepositoryData>> {
        let mut last_error = None;
        for _ in 0..READ_ATTEMPTS {
            let generation = self.current()?;
            if let Some(cached) = self.lock().cached.as_ref().filter(|d| d.gen_id() == generation) {
                return Ok(Arc::clone(cached));
            }
            match self.read(generation) {
                Ok(data) => {
                    let data = Arc::new(data);
                    self.observe(generation);
                    let mut state = self.lock();
                    if state.observed == Some(generation) {
                        state.cached = Some(Arc::clone(&data));
                    }
                    return Ok(data);
                }
                Err(e) => {
                    let now = self.current()?;
                    if now == generation {
                        return Err(e);
                    }
                    debug!(
                        repository = %self.repository,
                        read = %generation,
                        published = %now,
                        "generation moved while reading, retrying"
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| RepositoryError::IllegalRepositoryState {
            repository: self.repository.clone(),
            reason: "repository generation did not settle".to_string(),
        }))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Commits `data` as the successor of generation `expected`, serialized
    /// in the format of `version`.
    ///
    /// The first write to an untracked repository publishes the latest
    /// generation on disk before reserving the next one.
    ///
    /// Fails with [`RepositoryError::ConcurrentModification`] if `expected`
    /// is not the published generation, is older than one this node already
    /// observed, or another writer got to the new generation first.
    pub fn write_new(&self, expected: RepoGen, data: RepositoryData, version: Version) -> Result<Arc<RepositoryData>> {
        let published = self.ensure_tracked()?;
        let observed = self.observed().unwrap_or(RepoGen::UNKNOWN);
        if published != expected || expected < observed {
            return Err(self.concurrent_modification(expected, published.max(observed)));
        }

        let state = self.cluster.submit_update::<_, RepositoryError>("reserve repository generation", |state| {
            let meta = self.repository_metadata(state)?;
            if meta.generation != expected {
                return Err(self.concurrent_modification(expected, meta.generation));
            }
            let next = meta.pending_generation.max(expected).next();
            Ok(state
                .clone()
                .with_repository_update(&self.repository, |meta| meta.pending_generation = next))
        })?;
        let generation = self.repository_metadata(&state)?.pending_generation;
        let data = data.with_gen_id(generation);

        let blob = paths::root_index_blob(generation);
        let body = data.snapshots_to_json(version)?;
        match self.store.put(&blob, INDEX_N_FORMAT.encode(&body, self.codec), true) {
            Ok(()) => {}
            Err(BlobStoreError::AlreadyExists { .. }) => {
                return Err(self.concurrent_modification(expected, generation));
            }
            Err(e) => return Err(e.into()),
        }

        let pointer = Bytes::copy_from_slice(&generation.as_i64().to_be_bytes());
        if let Err(e) = self.store.put(paths::INDEX_LATEST_BLOB, pointer, false) {
            warn!(repository = %self.repository, generation = %generation, error = %e, "failed to update index.latest");
        }

        self.cluster.submit_update::<_, RepositoryError>("publish repository generation", |state| {
            let meta = self.repository_metadata(state)?;
            if meta.generation != expected || meta.pending_generation != generation {
                return Err(self.concurrent_modification(expected, meta.generation));
            }
            Ok(state
                .clone()
                .with_repository_update(&self.repository, |meta| meta.generation = generation))
        })?;

        let data = Arc::new(data);
        self.observe(generation);
        self.lock().cached = Some(Arc::clone(&data));
        info!(
            repository = %self.repository,
            generation = %generation,
            snapshots = data.snapshot_count(),
            version = %version,
            "committed repository generation"
        );

        self.delete_stale_generations(generation);
        Ok(data)
    }

    fn delete_stale_generations(&self, current: RepoGen) {
        let names = match self.store.list(paths::INDEX_FILE_PREFIX) {
            Ok(names) => names,
            Err(e) => {
                warn!(repository = %self.repository, error = %e, "failed to list root generations");
                return;
            }
        };
        for name in names {
            let stale = paths::parse_root_generation(&name).is_some_and(|n| n < current.as_i64());
            if stale && let Err(e) = self.store.delete(&name) {
                warn!(repository = %self.repository, blob = %name, error = %e, "failed to delete stale root generation");
            }
        }
    }
}
