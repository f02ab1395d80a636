//! Index metadata blobs and their deduplication.
//!
//! Snapshots taken without any change to an index's metadata share a single
//! `indices/<id>/meta-<blob>.dat` blob. Each snapshot maps every index it
//! contains to an *identifier* (index UUID plus a content hash), and each
//! identifier maps to the UUID of the blob holding that content.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snapvault_types::{IndexId, SnapshotId};

/// Index metadata as stored in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexMetadataSnapshot {
    pub name: String,
    pub uuid: String,
    pub number_of_shards: u32,
}

impl IndexMetadataSnapshot {
    /// Identifier shared by all snapshots that saw identical metadata.
    pub fn identifier(&self, serialized: &[u8]) -> String {
        let hash = blake3::hash(serialized).to_hex();
        format!("{}-{}", self.uuid, &hash.as_str()[..16])
    }
}

/// Snapshot-to-identifier and identifier-to-blob mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexMetaDataGenerations {
    lookup: BTreeMap<String, BTreeMap<IndexId, String>>,
    identifiers: BTreeMap<String, String>,
}

impl IndexMetaDataGenerations {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub(crate) fn from_parts(
        lookup: BTreeMap<String, BTreeMap<IndexId, String>>,
        identifiers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            lookup,
            identifiers,
        }
    }

    /// Identifiers per index, for one snapshot.
    pub fn lookup(&self, snapshot_uuid: &str) -> Option<&BTreeMap<IndexId, String>> {
        self.lookup.get(snapshot_uuid)
    }

    pub fn identifiers(&self) -> &BTreeMap<String, String> {
        &self.identifiers
    }

    pub fn blob_uuid_for_identifier(&self, identifier: &str) -> Option<&str> {
        self.identifiers.get(identifier).map(String::as_str)
    }

    /// UUID of the metadata blob for `index` as of `snapshot`.
    ///
    /// Snapshots without a lookup entry predate deduplication and store their
    /// index metadata under the snapshot's own UUID.
    pub fn index_meta_blob_uuid(&self, snapshot: &SnapshotId, index: &IndexId) -> String {
        self.lookup
            .get(snapshot.uuid())
            .and_then(|by_index| by_index.get(index))
            .and_then(|identifier| self.identifiers.get(identifier))
            .cloned()
            .unwrap_or_else(|| snapshot.uuid().to_string())
    }

    /// Registers a new snapshot's identifiers. Identifiers already known keep
    /// their existing blob.
    pub fn with_added_snapshot(
        &self,
        snapshot: &SnapshotId,
        by_index: BTreeMap<IndexId, String>,
        new_identifiers: &BTreeMap<String, String>,
    ) -> Self {
        let mut next = self.clone();
        for identifier in by_index.values() {
            if let Some(blob) = new_identifiers.get(identifier) {
                next.identifiers
                    .entry(identifier.clone())
                    .or_insert_with(|| blob.clone());
            }
        }
        if !by_index.is_empty() {
            next.lookup.insert(snapshot.uuid().to_string(), by_index);
        }
        next
    }

    /// Removes snapshots and every identifier no longer referenced.
    pub fn without_snapshots(&self, removed: &BTreeSet<String>) -> Self {
        let lookup: BTreeMap<_, _> = self
            .lookup
            .iter()
            .filter(|(uuid, _)| !removed.contains(*uuid))
            .map(|(uuid, by_index)| (uuid.clone(), by_index.clone()))
            .collect();
        let live: BTreeSet<&String> = lookup.values().flat_map(BTreeMap::values).collect();
        let identifiers = self
            .identifiers
            .iter()
            .filter(|(identifier, _)| live.contains(identifier))
            .map(|(identifier, blob)| (identifier.clone(), blob.clone()))
            .collect();
        Self {
            lookup,
            identifiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_metadata_shares_identifier() {
        let meta = IndexMetadataSnapshot {
            name: "logs".into(),
            uuid: "iu".into(),
            number_of_shards: 2,
        };
        let bytes = serde_json::to_vec(&meta).unwrap();
        assert_eq!(meta.identifier(&bytes), meta.identifier(&bytes));
        assert_ne!(meta.identifier(&bytes), meta.identifier(b"other"));
    }

    #[test]
    fn removing_last_user_drops_identifier() {
        let index = IndexId::new("logs", "i1");
        let s1 = SnapshotId::new("s1", "u1");
        let s2 = SnapshotId::new("s2", "u2");
        let ids = BTreeMap::from([("iu-abc".to_string(), "blob1".to_string())]);

        let gens = IndexMetaDataGenerations::empty()
            .with_added_snapshot(&s1, BTreeMap::from([(index.clone(), "iu-abc".into())]), &ids)
            .with_added_snapshot(&s2, BTreeMap::from([(index.clone(), "iu-abc".into())]), &ids);
        assert_eq!(gens.index_meta_blob_uuid(&s2, &index), "blob1");

        let after_one = gens.without_snapshots(&BTreeSet::from(["u1".to_string()]));
        assert_eq!(after_one.identifiers().len(), 1);

        let after_both = after_one.without_snapshots(&BTreeSet::from(["u2".to_string()]));
        assert!(after_both.is_empty());
    }

    #[test]
    fn snapshots_without_lookup_use_their_uuid() {
        let gens = IndexMetaDataGenerations::empty();
        let snapshot = SnapshotId::new("old", "legacy-uuid");
        assert_eq!(
            gens.index_meta_blob_uuid(&snapshot, &IndexId::new("logs", "i1")),
            "legacy-uuid"
        );
    }
}
