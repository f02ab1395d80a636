//! Shard-level snapshot blobs.
//!
//! Each shard folder holds one `index-<gen>` blob listing every snapshot of
//! the shard and the data blobs it references, a `snap-<uuid>.dat` per
//! snapshot, and the `__<uuid>` data blobs themselves. Data blobs are shared
//! between snapshots whenever a file's length and checksum are unchanged.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snapvault_blobstore::{BlobStore, BlobStoreError};
use snapvault_types::{IndexId, ShardGeneration, SnapshotId};
use tracing::{debug, trace, warn};

use crate::{
    IndexMetadataSnapshot, RepositoryData, RepositoryError, Result,
    format::{Codec, INDEX_METADATA_FORMAT, SHARD_INDEX_FORMAT, SHARD_SNAPSHOT_FORMAT},
    paths,
};

// ============================================================================
// Documents
// ============================================================================

/// One file of a shard snapshot and the data blob holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileInfo {
    /// Data blob name inside the shard folder.
    pub name: String,
    /// Name of the file in the shard.
    pub physical_name: String,
    pub length: u64,
    /// blake3 of the content, hex encoded.
    pub checksum: String,
}

impl FileInfo {
    fn same_content(&self, physical_name: &str, length: u64, checksum: &str) -> bool {
        self.physical_name == physical_name && self.length == length && self.checksum == checksum
    }
}

/// Content of a shard's `snap-<uuid>.dat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardSnapshot {
    pub snapshot: String,
    pub uuid: String,
    pub start_time: i64,
    pub time: i64,
    pub files: Vec<FileInfo>,
}

/// The files of one snapshot, as listed in the shard's `index-<gen>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotFiles {
    pub snapshot: String,
    pub uuid: String,
    pub files: Vec<FileInfo>,
}

/// Content of a shard's `index-<gen>`: every snapshot of the shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardSnapshots {
    snapshots: Vec<SnapshotFiles>,
}

impl ShardSnapshots {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[SnapshotFiles] {
        &self.snapshots
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.snapshots.iter().any(|s| s.uuid == uuid)
    }

    /// An already stored file with identical content, if any.
    pub fn find(&self, physical_name: &str, length: u64, checksum: &str) -> Option<&FileInfo> {
        self.snapshots
            .iter()
            .flat_map(|s| &s.files)
            .find(|f| f.same_content(physical_name, length, checksum))
    }

    pub fn with_snapshot(&self, files: SnapshotFiles) -> Self {
        let mut snapshots: Vec<_> = self
            .snapshots
            .iter()
            .filter(|s| s.uuid != files.uuid)
            .cloned()
            .collect();
        snapshots.push(files);
        Self { snapshots }
    }

    pub fn without_snapshots(&self, uuids: &BTreeSet<String>) -> Self {
        Self {
            snapshots: self
                .snapshots
                .iter()
                .filter(|s| !uuids.contains(&s.uuid))
                .cloned()
                .collect(),
        }
    }

    /// Every data blob referenced by any listed snapshot.
    pub fn data_blobs(&self) -> BTreeSet<&str> {
        self.snapshots
            .iter()
            .flat_map(|s| &s.files)
            .map(|f| f.name.as_str())
            .collect()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// One file to store as part of a shard snapshot.
#[derive(Debug, Clone)]
pub struct ShardFile {
    pub physical_name: String,
    pub data: Bytes,
}

/// Snapshot of a single shard.
#[derive(Debug, Clone)]
pub struct ShardSnapshotRequest {
    pub snapshot: SnapshotId,
    pub index: IndexId,
    pub shard: u32,
    pub files: Vec<ShardFile>,
    /// Generation the new one is based on. `None` resolves the shard's
    /// newest numeric generation, or starts an empty shard.
    pub base_generation: Option<ShardGeneration>,
    /// Write a numeric generation instead of an opaque one.
    pub legacy_format: bool,
}

// ============================================================================
// Shard Container
// ============================================================================

/// Blob access for one repository's shard folders.
pub(crate) struct ShardContainer<'a> {
    pub repository: &'a str,
    pub store: &'a dyn BlobStore,
    pub codec: Codec,
}

impl ShardContainer<'_> {
    fn corrupt(&self, blob: &str, reason: impl ToString) -> RepositoryError {
        RepositoryError::CorruptState {
            repository: self.repository.to_string(),
            blob: blob.to_string(),
            reason: reason.to_string(),
        }
    }

    fn encode<T: Serialize>(&self, what: &'static str, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|source| RepositoryError::Serialization { what, source })
    }

    /// Reads the shard list stored at `generation`.
    pub fn read_index(&self, index: &IndexId, shard: u32, generation: &ShardGeneration) -> Result<ShardSnapshots> {
        let blob = paths::shard_index_blob(index, shard, generation);
        let data = self.store.get(&blob).map_err(|e| match e {
            BlobStoreError::NotFound { .. } => self.corrupt(&blob, "referenced shard generation is missing"),
            other => other.into(),
        })?;
        let body = SHARD_INDEX_FORMAT.decode(self.repository, &blob, &data)?;
        serde_json::from_slice(&body).map_err(|e| self.corrupt(&blob, e))
    }

    /// Highest numeric `index-N` in the shard folder.
    pub fn latest_legacy_generation(&self, index: &IndexId, shard: u32) -> Result<Option<u64>> {
        let dir = paths::shard_dir(index, shard);
        let names = self.store.list(&dir)?;
        Ok(names
            .iter()
            .filter_map(|name| name.strip_prefix(&dir))
            .filter_map(paths::parse_legacy_shard_generation)
            .max())
    }

    /// Loads the shard list for `generation`, resolving an unknown one by
    /// listing. Returns the list and the generation it was read from.
    pub fn resolve_index(
        &self,
        index: &IndexId,
        shard: u32,
        generation: Option<&ShardGeneration>,
    ) -> Result<(ShardSnapshots, Option<ShardGeneration>)> {
        let generation = match generation {
            Some(generation) => Some(generation.clone()),
            None => self
                .latest_legacy_generation(index, shard)?
                .map(ShardGeneration::Legacy),
        };
        match generation {
            Some(generation) => Ok((self.read_index(index, shard, &generation)?, Some(generation))),
            None => Ok((ShardSnapshots::empty(), None)),
        }
    }

    /// Writes a new shard list. Generations are never overwritten.
    pub fn write_index(
        &self,
        index: &IndexId,
        shard: u32,
        generation: &ShardGeneration,
        snapshots: &ShardSnapshots,
    ) -> Result<()> {
        let blob = paths::shard_index_blob(index, shard, generation);
        let body = self.encode("shard snapshots", snapshots)?;
        self.store.put(&blob, SHARD_INDEX_FORMAT.encode(&body, self.codec), true)?;
        Ok(())
    }

    /// Generation to write after `base` in the requested format.
    pub fn next_generation(base: Option<&ShardGeneration>, legacy_format: bool) -> ShardGeneration {
        if legacy_format {
            ShardGeneration::next_legacy(base)
        } else {
            ShardGeneration::random()
        }
    }

    /// Deletes numeric generations older than `keep`. Best effort.
    pub fn delete_legacy_before(&self, index: &IndexId, shard: u32, keep: u64) {
        let dir = paths::shard_dir(index, shard);
        let names = match self.store.list(&dir) {
            Ok(names) => names,
            Err(e) => {
                warn!(repository = self.repository, %index, shard, error = %e, "failed to list shard generations");
                return;
            }
        };
        for name in names {
            let stale = name
                .strip_prefix(&dir)
                .and_then(paths::parse_legacy_shard_generation)
                .is_some_and(|generation| generation < keep);
            if stale && let Err(e) = self.store.delete(&name) {
                warn!(repository = self.repository, blob = %name, error = %e, "failed to delete stale shard generation");
            }
        }
    }

    /// Stores one shard snapshot and returns the new shard generation.
    ///
    /// Nothing becomes visible to readers of the root metadata until the
    /// snapshot is finalized. On failure, blobs written by this call are
    /// removed on a best-effort basis.
    pub fn snapshot(&self, request: &ShardSnapshotRequest, aborted: &dyn Fn() -> bool) -> Result<ShardGeneration> {
        let mut written = Vec::new();
        let result = self.snapshot_inner(request, aborted, &mut written);
        if let Err(e) = &result {
            debug!(
                repository = self.repository,
                snapshot = %request.snapshot,
                index = %request.index,
                shard = request.shard,
                error = %e,
                "shard snapshot failed, removing written blobs"
            );
            for blob in written {
                if let Err(e) = self.store.delete(&blob) {
                    trace!(blob = %blob, error = %e, "failed to remove blob of failed shard snapshot");
                }
            }
        }
        result
    }

    fn snapshot_inner(
        &self,
        request: &ShardSnapshotRequest,
        aborted: &dyn Fn() -> bool,
        written: &mut Vec<String>,
    ) -> Result<ShardGeneration> {
        let ShardSnapshotRequest {
            snapshot,
            index,
            shard,
            ..
        } = request;
        let shard = *shard;
        let start_time = chrono::Utc::now().timestamp_millis();
        let abort = || RepositoryError::Aborted {
            repository: self.repository.to_string(),
            snapshot: snapshot.name().to_string(),
        };

        let (existing, base) = self.resolve_index(index, shard, request.base_generation.as_ref())?;

        let mut files = Vec::with_capacity(request.files.len());
        for file in &request.files {
            if aborted() {
                return Err(abort());
            }
            let length = file.data.len() as u64;
            let checksum = blake3::hash(&file.data).to_hex().to_string();
            if let Some(info) = existing.find(&file.physical_name, length, &checksum) {
                trace!(file = %file.physical_name, blob = %info.name, "reusing data blob");
                files.push(info.clone());
                continue;
            }
            let name = paths::new_data_blob_name();
            let blob = paths::data_blob(index, shard, &name);
            self.store.put(&blob, file.data.clone(), true)?;
            written.push(blob);
            files.push(FileInfo {
                name,
                physical_name: file.physical_name.clone(),
                length,
                checksum,
            });
        }
        if aborted() {
            return Err(abort());
        }

        let shard_snapshot = ShardSnapshot {
            snapshot: snapshot.name().to_string(),
            uuid: snapshot.uuid().to_string(),
            start_time,
            time: chrono::Utc::now().timestamp_millis() - start_time,
            files: files.clone(),
        };
        let blob = paths::shard_snapshot_blob(index, shard, snapshot.uuid());
        let body = self.encode("shard snapshot", &shard_snapshot)?;
        self.store.put(&blob, SHARD_SNAPSHOT_FORMAT.encode(&body, self.codec), false)?;
        written.push(blob);

        let updated = existing.with_snapshot(SnapshotFiles {
            snapshot: snapshot.name().to_string(),
            uuid: snapshot.uuid().to_string(),
            files,
        });
        let generation = Self::next_generation(base.as_ref(), request.legacy_format);
        self.write_index(index, shard, &generation, &updated)?;
        written.push(paths::shard_index_blob(index, shard, &generation));

        if let ShardGeneration::Legacy(n) = generation {
            self.delete_legacy_before(index, shard, n);
        }
        debug!(
            repository = self.repository,
            snapshot = %snapshot,
            index = %index,
            shard,
            generation = %generation,
            "wrote shard snapshot"
        );
        Ok(generation)
    }

    /// Reads index metadata stored under `blob_uuid`.
    pub fn read_index_metadata(&self, index: &IndexId, blob_uuid: &str) -> Result<IndexMetadataSnapshot> {
        let blob = paths::index_metadata_blob(index, blob_uuid);
        let data = self.store.get(&blob).map_err(|e| match e {
            BlobStoreError::NotFound { .. } => self.corrupt(&blob, "index metadata is missing"),
            other => other.into(),
        })?;
        let body = INDEX_METADATA_FORMAT.decode(self.repository, &blob, &data)?;
        serde_json::from_slice(&body).map_err(|e| self.corrupt(&blob, e))
    }

    /// Number of shards of `index`, from the root metadata when it tracks
    /// generations, else from the index metadata of any snapshot.
    pub fn shard_count(&self, data: &RepositoryData, index: &IndexId) -> Result<u32> {
        let tracked = data.shard_generations().generations(index).len();
        if tracked > 0 {
            return Ok(tracked as u32);
        }
        let Some(snapshot) = data.snapshots_for_index(index).first() else {
            return Ok(0);
        };
        let blob_uuid = data.index_meta_generations().index_meta_blob_uuid(snapshot, index);
        Ok(self.read_index_metadata(index, &blob_uuid)?.number_of_shards)
    }
}
