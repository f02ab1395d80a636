//! Per-node shard contents.
//!
//! Stands in for the index engine: each shard is a list of JSON documents,
//! grouped into immutable segments of [`DOCS_PER_SEGMENT`] documents. Adding
//! documents only rewrites the last, partially filled segment, so repeated
//! snapshots of a growing shard reuse every full segment.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use bytes::Bytes;
use snapvault_repository::ShardFile;

/// Documents per segment file.
pub const DOCS_PER_SEGMENT: usize = 16;

/// Shard contents held by one node, keyed by index name and shard number.
#[derive(Debug, Default)]
pub struct ShardStore {
    shards: Mutex<BTreeMap<(String, u32), Vec<String>>>,
}

impl ShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, u32), Vec<String>>> {
        self.shards.lock().expect("shard store lock poisoned")
    }

    /// Creates an empty shard. Existing content is kept.
    pub fn create_shard(&self, index: &str, shard: u32) {
        self.lock().entry((index.to_string(), shard)).or_default();
    }

    pub fn add_documents(&self, index: &str, shard: u32, documents: impl IntoIterator<Item = String>) {
        self.lock()
            .entry((index.to_string(), shard))
            .or_default()
            .extend(documents);
    }

    pub fn doc_count(&self, index: &str, shard: u32) -> usize {
        self.lock().get(&(index.to_string(), shard)).map_or(0, Vec::len)
    }

    /// Drops every shard of `index`.
    pub fn remove_index(&self, index: &str) {
        self.lock().retain(|(name, _), _| name != index);
    }

    /// Segment files of a shard, in order. An unknown shard has none.
    pub fn files(&self, index: &str, shard: u32) -> Vec<ShardFile> {
        let shards = self.lock();
        let Some(docs) = shards.get(&(index.to_string(), shard)) else {
            return Vec::new();
        };
        docs.chunks(DOCS_PER_SEGMENT)
            .enumerate()
            .map(|(segment, chunk)| ShardFile {
                physical_name: format!("_{segment}.seg"),
                data: Bytes::from(serde_json::Value::from(chunk.to_vec()).to_string()),
            })
            .collect()
    }
}
