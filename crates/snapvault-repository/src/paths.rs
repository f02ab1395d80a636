//! Blob naming inside a repository.
//!
//! ```text
//! index-<N>                                  root metadata, generation N
//! index.latest                               8-byte big-endian pointer to N
//! snap-<uuid>.dat                            snapshot info
//! meta-<uuid>.dat                            global metadata at snapshot time
//! indices/<index-id>/meta-<blob>.dat         index metadata
//! indices/<index-id>/<shard>/index-<gen>     shard snapshot list
//! indices/<index-id>/<shard>/snap-<uuid>.dat shard snapshot file list
//! indices/<index-id>/<shard>/__<uuid>        shard data
//! tests-<seed>/...                           repository verification
//! ```

use snapvault_blobstore::is_temp_blob;
use snapvault_types::{IndexId, RepoGen, ShardGeneration};

pub const INDEX_FILE_PREFIX: &str = "index-";
pub const INDEX_LATEST_BLOB: &str = "index.latest";
pub const SNAPSHOT_PREFIX: &str = "snap-";
pub const METADATA_PREFIX: &str = "meta-";
pub const BLOB_SUFFIX: &str = ".dat";
pub const DATA_BLOB_PREFIX: &str = "__";
pub const INDICES_DIR: &str = "indices/";
pub const TESTS_PREFIX: &str = "tests-";

pub fn root_index_blob(generation: RepoGen) -> String {
    format!("{INDEX_FILE_PREFIX}{generation}")
}

pub fn snapshot_blob(uuid: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{uuid}{BLOB_SUFFIX}")
}

pub fn global_metadata_blob(uuid: &str) -> String {
    format!("{METADATA_PREFIX}{uuid}{BLOB_SUFFIX}")
}

/// Folder holding everything for one index, with trailing separator.
pub fn index_dir(index: &IndexId) -> String {
    format!("{INDICES_DIR}{}/", index.id())
}

pub fn index_metadata_blob(index: &IndexId, blob_uuid: &str) -> String {
    format!("{}{METADATA_PREFIX}{blob_uuid}{BLOB_SUFFIX}", index_dir(index))
}

/// Folder holding one shard, with trailing separator.
pub fn shard_dir(index: &IndexId, shard: u32) -> String {
    format!("{}{shard}/", index_dir(index))
}

pub fn shard_index_blob(index: &IndexId, shard: u32, generation: &ShardGeneration) -> String {
    format!("{}{}", shard_dir(index, shard), generation.blob_name())
}

pub fn shard_snapshot_blob(index: &IndexId, shard: u32, uuid: &str) -> String {
    format!("{}{SNAPSHOT_PREFIX}{uuid}{BLOB_SUFFIX}", shard_dir(index, shard))
}

pub fn data_blob(index: &IndexId, shard: u32, name: &str) -> String {
    format!("{}{name}", shard_dir(index, shard))
}

pub fn new_data_blob_name() -> String {
    format!("{DATA_BLOB_PREFIX}{}", snapvault_types::random_uuid())
}

pub fn verification_dir(seed: &str) -> String {
    format!("{TESTS_PREFIX}{seed}/")
}

/// Parses the generation out of a root `index-N` name.
pub fn parse_root_generation(name: &str) -> Option<i64> {
    name.strip_prefix(INDEX_FILE_PREFIX)?.parse::<i64>().ok()
}

/// Parses a numeric shard generation out of an `index-N` file name.
pub fn parse_legacy_shard_generation(file: &str) -> Option<u64> {
    file.strip_prefix(INDEX_FILE_PREFIX)?.parse::<u64>().ok()
}

/// What a blob is, judged by its name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobRole {
    RootIndexN,
    IndexLatest,
    RootSnap,
    RootMeta,
    IndexMeta,
    ShardIndexN,
    ShardSnap,
    Data,
    Verification,
    Temp,
    Other,
}

impl BlobRole {
    pub fn classify(name: &str) -> Self {
        fn is_dat(file: &str, prefix: &str) -> bool {
            file.starts_with(prefix) && file.ends_with(BLOB_SUFFIX)
        }

        if is_temp_blob(name) {
            return Self::Temp;
        }
        if name.starts_with(TESTS_PREFIX) {
            return Self::Verification;
        }
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            [file] if *file == INDEX_LATEST_BLOB => Self::IndexLatest,
            [file] if parse_root_generation(file).is_some() => Self::RootIndexN,
            [file] if is_dat(file, SNAPSHOT_PREFIX) => Self::RootSnap,
            [file] if is_dat(file, METADATA_PREFIX) => Self::RootMeta,
            ["indices", _, file] if is_dat(file, METADATA_PREFIX) => Self::IndexMeta,
            ["indices", _, shard, file] if shard.parse::<u32>().is_ok() => {
                if file.starts_with(INDEX_FILE_PREFIX) {
                    Self::ShardIndexN
                } else if is_dat(file, SNAPSHOT_PREFIX) {
                    Self::ShardSnap
                } else if file.starts_with(DATA_BLOB_PREFIX) {
                    Self::Data
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}
