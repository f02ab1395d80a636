//! Snapshot descriptions stored in `snap-<uuid>.dat`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snapvault_types::{SnapshotId, SnapshotState, Version};

use crate::{RepositoryError, Result};

/// Why one shard of a snapshot failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotShardFailure {
    pub index: String,
    pub index_uuid: String,
    pub shard_id: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// The outcome of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub snapshot_id: SnapshotId,
    pub indices: Vec<String>,
    pub state: SnapshotState,
    pub reason: Option<String>,
    /// Format version the snapshot was written with.
    pub version: Version,
    pub start_time: i64,
    pub end_time: i64,
    pub total_shards: u32,
    pub successful_shards: u32,
    pub shard_failures: Vec<SnapshotShardFailure>,
    pub include_global_state: bool,
    pub user_metadata: BTreeMap<String, String>,
}

impl SnapshotInfo {
    pub fn failed_shards(&self) -> u32 {
        self.total_shards - self.successful_shards
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let doc = SnapshotInfoDoc {
            snapshot: SnapshotBody {
                snapshot: self.snapshot_id.name().to_string(),
                uuid: self.snapshot_id.uuid().to_string(),
                version_id: self.version.id(),
                version: self.version,
                indices: self.indices.clone(),
                state: self.state,
                reason: self.reason.clone(),
                include_global_state: self.include_global_state,
                metadata: self.user_metadata.clone(),
                start_time: self.start_time,
                end_time: self.end_time,
                total_shards: self.total_shards,
                successful_shards: self.successful_shards,
                failures: self.shard_failures.clone(),
            },
        };
        serde_json::to_vec(&doc).map_err(|source| RepositoryError::Serialization {
            what: "snapshot info",
            source,
        })
    }

    /// Parses a snapshot info document. Unknown fields are rejected.
    pub fn from_json(repository: &str, blob: &str, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| RepositoryError::CorruptState {
            repository: repository.to_string(),
            blob: blob.to_string(),
            reason,
        };
        let doc: SnapshotInfoDoc =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        let body = doc.snapshot;
        if body.version.id() != body.version_id {
            return Err(corrupt(format!(
                "version {} does not match version id {}",
                body.version, body.version_id
            )));
        }
        if body.successful_shards > body.total_shards {
            return Err(corrupt("more successful shards than total shards".to_string()));
        }
        Ok(Self {
            snapshot_id: SnapshotId::new(body.snapshot, body.uuid),
            indices: body.indices,
            state: body.state,
            reason: body.reason,
            version: body.version,
            start_time: body.start_time,
            end_time: body.end_time,
            total_shards: body.total_shards,
            successful_shards: body.successful_shards,
            shard_failures: body.failures,
            include_global_state: body.include_global_state,
            user_metadata: body.metadata,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotInfoDoc {
    snapshot: SnapshotBody,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotBody {
    snapshot: String,
    uuid: String,
    version_id: u32,
    version: Version,
    indices: Vec<String>,
    state: SnapshotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    include_global_state: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    start_time: i64,
    end_time: i64,
    total_shards: u32,
    successful_shards: u32,
    failures: Vec<SnapshotShardFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SnapshotInfo {
        SnapshotInfo {
            snapshot_id: SnapshotId::new("snap", "u1"),
            indices: vec!["logs".into()],
            state: SnapshotState::Partial,
            reason: None,
            version: Version::CURRENT,
            start_time: 10,
            end_time: 20,
            total_shards: 2,
            successful_shards: 1,
            shard_failures: vec![SnapshotShardFailure {
                index: "logs".into(),
                index_uuid: "i1".into(),
                shard_id: 1,
                reason: "node left".into(),
                node_id: None,
            }],
            include_global_state: true,
            user_metadata: BTreeMap::from([("owner".into(), "ops".into())]),
        }
    }

    #[test]
    fn json_preserves_every_field() {
        let info = info();
        let json = info.to_json().unwrap();
        let parsed = SnapshotInfo::from_json("repo", "snap-u1.dat", &json).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.failed_shards(), 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut value: serde_json::Value = serde_json::from_slice(&info().to_json().unwrap()).unwrap();
        value["snapshot"]["surprise"] = serde_json::json!(true);
        let bytes = serde_json::to_vec(&value).unwrap();

        let err = SnapshotInfo::from_json("repo", "snap-u1.dat", &bytes).unwrap_err();
        assert!(matches!(err, RepositoryError::CorruptState { .. }));
    }

    #[test]
    fn mismatched_version_id_is_rejected() {
        let mut value: serde_json::Value = serde_json::from_slice(&info().to_json().unwrap()).unwrap();
        value["snapshot"]["version"] = serde_json::json!("7.5.0");
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(SnapshotInfo::from_json("repo", "snap-u1.dat", &bytes).is_err());
    }
}
