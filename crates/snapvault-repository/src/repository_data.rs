//! Root repository metadata.
//!
//! [`RepositoryData`] is the content of the root `index-N` blob: every
//! snapshot in the repository, the indices they contain, and the current
//! generation of every shard. Instances are immutable; every commit builds a
//! new one.
//!
//! The serialized shape depends on the format [`Version`] it is written for:
//!
//! | Field                          | Written from |
//! |--------------------------------|--------------|
//! | `generation`, `snapshots`, `indices` | always |
//! | per-snapshot `version`, `min_version`, `shard_generations` | 7.6.0 |
//! | `index_metadata_lookup`, `index_metadata_identifiers` | 7.9.0 |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snapvault_types::{IndexId, RepoGen, ShardGeneration, SnapshotId, SnapshotState, Version};

use crate::{IndexMetaDataGenerations, RepositoryError, Result, ShardGenerations};

// ============================================================================
// Repository Data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryData {
    gen_id: RepoGen,
    snapshots: BTreeMap<String, SnapshotId>,
    states: BTreeMap<String, SnapshotState>,
    versions: BTreeMap<String, Version>,
    indices: BTreeMap<String, IndexId>,
    index_snapshots: BTreeMap<IndexId, Vec<SnapshotId>>,
    shard_generations: ShardGenerations,
    index_meta_generations: IndexMetaDataGenerations,
}

/// A snapshot being added to [`RepositoryData`].
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub snapshot_id: SnapshotId,
    pub state: SnapshotState,
    pub version: Version,
    /// Every index in the snapshot, with generations of its successful shards.
    pub shard_generations: ShardGenerations,
    /// Index metadata identifier per index. Empty for pre-7.9 formats.
    pub index_meta_lookup: BTreeMap<IndexId, String>,
    /// Blob UUIDs for identifiers introduced by this snapshot.
    pub new_identifiers: BTreeMap<String, String>,
}

impl RepositoryData {
    /// Metadata of a repository that has never been written to.
    pub fn empty() -> Self {
        Self {
            gen_id: RepoGen::EMPTY,
            snapshots: BTreeMap::new(),
            states: BTreeMap::new(),
            versions: BTreeMap::new(),
            indices: BTreeMap::new(),
            index_snapshots: BTreeMap::new(),
            shard_generations: ShardGenerations::empty(),
            index_meta_generations: IndexMetaDataGenerations::empty(),
        }
    }

    pub fn gen_id(&self) -> RepoGen {
        self.gen_id
    }

    pub fn with_gen_id(mut self, gen_id: RepoGen) -> Self {
        self.gen_id = gen_id;
        self
    }

    pub fn snapshot_ids(&self) -> impl Iterator<Item = &SnapshotId> {
        self.snapshots.values()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn contains(&self, snapshot: &SnapshotId) -> bool {
        self.snapshots.contains_key(snapshot.uuid())
    }

    pub fn snapshot_by_name(&self, name: &str) -> Option<&SnapshotId> {
        self.snapshots.values().find(|id| id.name() == name)
    }

    pub fn state(&self, snapshot: &SnapshotId) -> Option<SnapshotState> {
        self.states.get(snapshot.uuid()).copied()
    }

    pub fn version(&self, snapshot: &SnapshotId) -> Option<Version> {
        self.versions.get(snapshot.uuid()).copied()
    }

    /// Snapshots whose format version is not recorded.
    pub fn snapshots_missing_version(&self) -> impl Iterator<Item = &SnapshotId> {
        self.snapshots
            .values()
            .filter(|id| !self.versions.contains_key(id.uuid()))
    }

    /// Lowest format version of any snapshot; unrecorded versions count as
    /// [`Version::OLD_SNAPSHOT_FORMAT`].
    pub fn min_version(&self) -> Option<Version> {
        self.snapshots
            .keys()
            .map(|uuid| {
                self.versions
                    .get(uuid)
                    .copied()
                    .unwrap_or(Version::OLD_SNAPSHOT_FORMAT)
            })
            .min()
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexId> {
        self.indices.values()
    }

    pub fn index_id(&self, name: &str) -> Option<&IndexId> {
        self.indices.get(name)
    }

    /// Existing id for `name`, or a fresh one.
    pub fn resolve_index_id(&self, name: &str) -> IndexId {
        self.indices
            .get(name)
            .cloned()
            .unwrap_or_else(|| IndexId::random(name))
    }

    pub fn snapshots_for_index(&self, index: &IndexId) -> &[SnapshotId] {
        self.index_snapshots.get(index).map_or(&[], Vec::as_slice)
    }

    pub fn indices_for_snapshot(&self, snapshot: &SnapshotId) -> Vec<&IndexId> {
        self.index_snapshots
            .iter()
            .filter(|(_, snapshots)| snapshots.contains(snapshot))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn shard_generations(&self) -> &ShardGenerations {
        &self.shard_generations
    }

    pub fn index_meta_generations(&self) -> &IndexMetaDataGenerations {
        &self.index_meta_generations
    }

    /// Returns a copy with `snapshot` added. The generation is unchanged;
    /// the writer assigns the next one.
    pub fn add_snapshot(&self, snapshot: NewSnapshot) -> Self {
        debug_assert!(!self.contains(&snapshot.snapshot_id));
        let mut next = self.clone();
        let uuid = snapshot.snapshot_id.uuid().to_string();

        for index in snapshot.shard_generations.indices() {
            next.indices.insert(index.name().to_string(), index.clone());
            next.index_snapshots
                .entry(index.clone())
                .or_default()
                .push(snapshot.snapshot_id.clone());
        }
        next.shard_generations = self.shard_generations.merged_with(&snapshot.shard_generations);
        next.index_meta_generations = self.index_meta_generations.with_added_snapshot(
            &snapshot.snapshot_id,
            snapshot.index_meta_lookup,
            &snapshot.new_identifiers,
        );
        next.states.insert(uuid.clone(), snapshot.state);
        next.versions.insert(uuid.clone(), snapshot.version);
        next.snapshots.insert(uuid, snapshot.snapshot_id);
        next
    }

    /// Returns a copy without `removed`. Generations of every index in
    /// `replaced` are replaced wholesale; indices left without snapshots are
    /// dropped.
    pub fn remove_snapshots(&self, removed: &[SnapshotId], replaced: &ShardGenerations) -> Self {
        let mut next = self.clone();
        let removed_uuids: BTreeSet<String> =
            removed.iter().map(|id| id.uuid().to_string()).collect();

        for uuid in &removed_uuids {
            next.snapshots.remove(uuid);
            next.states.remove(uuid);
            next.versions.remove(uuid);
        }
        for snapshots in next.index_snapshots.values_mut() {
            snapshots.retain(|id| !removed_uuids.contains(id.uuid()));
        }
        next.index_snapshots.retain(|_, snapshots| !snapshots.is_empty());
        let live = &next.index_snapshots;
        next.indices.retain(|_, id| live.contains_key(id));

        let mut shard_generations = self.shard_generations.clone();
        for index in replaced.indices() {
            shard_generations = shard_generations
                .retain(|i| i != index)
                .with_index(index.clone(), 0);
            for (shard, generation) in replaced.generations(index).iter().enumerate() {
                shard_generations =
                    shard_generations.with(index.clone(), shard as u32, generation.clone());
            }
        }
        next.shard_generations = shard_generations.retain(|index| live.contains_key(index));
        next.index_meta_generations = self.index_meta_generations.without_snapshots(&removed_uuids);
        next
    }

    /// Fills in format versions of snapshots that do not record one.
    pub fn with_resolved_versions(mut self, resolved: BTreeMap<String, Version>) -> Self {
        for (uuid, version) in resolved {
            if self.snapshots.contains_key(&uuid) {
                self.versions.entry(uuid).or_insert(version);
            }
        }
        self
    }

    /// Projection as a pre-UUID repository would see it: opaque shard
    /// generations and index metadata generations are dropped.
    pub fn without_uuids(&self) -> Self {
        let mut next = self.clone();
        next.shard_generations = self.shard_generations.without_uuids();
        next.index_meta_generations = IndexMetaDataGenerations::empty();
        next
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Renders the root document in the format of `version`.
    ///
    /// Pure: the same data and version always produce the same bytes.
    pub fn snapshots_to_json(&self, version: Version) -> Result<Vec<u8>> {
        let with_shard_gens = version.includes_shard_uuids();
        let with_index_gens = version.includes_index_generations();

        let snapshots = self
            .snapshots
            .values()
            .map(|id| SnapshotEntryDoc {
                name: id.name().to_string(),
                uuid: id.uuid().to_string(),
                state: self
                    .states
                    .get(id.uuid())
                    .map_or(SnapshotState::Success.value(), |state| state.value()),
                version: if with_shard_gens {
                    self.versions.get(id.uuid()).copied()
                } else {
                    None
                },
                index_metadata_lookup: if with_index_gens {
                    self.index_meta_generations.lookup(id.uuid()).map(|by_index| {
                        by_index
                            .iter()
                            .map(|(index, identifier)| (index.id().to_string(), identifier.clone()))
                            .collect()
                    })
                } else {
                    None
                },
            })
            .collect();

        let indices = self
            .index_snapshots
            .iter()
            .map(|(index, snapshots)| {
                let doc = IndexEntryDoc {
                    id: index.id().to_string(),
                    snapshots: snapshots.iter().map(|id| id.uuid().to_string()).collect(),
                    shard_generations: with_shard_gens.then(|| {
                        self.shard_generations
                            .generations(index)
                            .iter()
                            .map(|g| g.as_ref().map(ToString::to_string))
                            .collect()
                    }),
                };
                (index.name().to_string(), doc)
            })
            .collect();

        let doc = RepositoryDataDoc {
            generation: self.gen_id,
            min_version: with_shard_gens.then_some(version),
            snapshots,
            indices,
            index_metadata_identifiers: with_index_gens
                .then(|| self.index_meta_generations.identifiers().clone()),
        };
        serde_json::to_vec(&doc).map_err(|source| RepositoryError::Serialization {
            what: "repository data",
            source,
        })
    }

    /// Parses a root document read from generation `gen_id`.
    ///
    /// With `fix_broken_shard_gens`, numeric shard generation tokens are read
    /// as legacy generations; otherwise every token is opaque.
    pub fn snapshots_from_json(
        repository: &str,
        bytes: &[u8],
        gen_id: RepoGen,
        fix_broken_shard_gens: bool,
    ) -> Result<Self> {
        let blob = crate::paths::root_index_blob(gen_id);
        let corrupt = |reason: String| RepositoryError::CorruptState {
            repository: repository.to_string(),
            blob: blob.clone(),
            reason,
        };

        let doc: RepositoryDataDoc =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;
        if doc.generation != gen_id {
            return Err(corrupt(format!(
                "declares generation {} but was read as generation {gen_id}",
                doc.generation
            )));
        }

        let mut data = Self::empty().with_gen_id(gen_id);
        let mut lookups = BTreeMap::new();
        for entry in doc.snapshots {
            let state = SnapshotState::from_value(entry.state)
                .ok_or_else(|| corrupt(format!("unknown snapshot state {}", entry.state)))?;
            if data.snapshots.contains_key(&entry.uuid) || data.snapshot_by_name(&entry.name).is_some() {
                return Err(corrupt(format!("duplicate snapshot [{}/{}]", entry.name, entry.uuid)));
            }
            if let Some(version) = entry.version {
                data.versions.insert(entry.uuid.clone(), version);
            }
            if let Some(lookup) = entry.index_metadata_lookup {
                lookups.insert(entry.uuid.clone(), lookup);
            }
            data.states.insert(entry.uuid.clone(), state);
            data.snapshots
                .insert(entry.uuid.clone(), SnapshotId::new(entry.name, entry.uuid));
        }

        let mut ids_by_repo_id = BTreeMap::new();
        let mut shard_generations = ShardGenerations::empty();
        for (name, entry) in doc.indices {
            let index = IndexId::new(name.clone(), entry.id.clone());
            let mut snapshots = Vec::with_capacity(entry.snapshots.len());
            for uuid in &entry.snapshots {
                let id = data
                    .snapshots
                    .get(uuid)
                    .ok_or_else(|| corrupt(format!("index [{name}] references unknown snapshot {uuid}")))?;
                snapshots.push(id.clone());
            }
            if let Some(gens) = entry.shard_generations {
                shard_generations = shard_generations.with_index(index.clone(), gens.len() as u32);
                for (shard, token) in gens.into_iter().enumerate() {
                    let generation = token
                        .map(|t| ShardGeneration::parse(&t, fix_broken_shard_gens));
                    shard_generations = shard_generations.with(index.clone(), shard as u32, generation);
                }
            } else {
                shard_generations = shard_generations.with_index(index.clone(), 0);
            }
            ids_by_repo_id.insert(entry.id, index.clone());
            data.indices.insert(name, index.clone());
            data.index_snapshots.insert(index, snapshots);
        }
        data.shard_generations = shard_generations;

        let identifiers = doc.index_metadata_identifiers.unwrap_or_default();
        let mut resolved_lookups = BTreeMap::new();
        for (uuid, lookup) in lookups {
            let mut by_index = BTreeMap::new();
            for (repo_id, identifier) in lookup {
                let index = ids_by_repo_id
                    .get(&repo_id)
                    .ok_or_else(|| corrupt(format!("index metadata lookup references unknown index {repo_id}")))?;
                if !identifiers.contains_key(&identifier) {
                    return Err(corrupt(format!("unknown index metadata identifier {identifier}")));
                }
                by_index.insert(index.clone(), identifier);
            }
            resolved_lookups.insert(uuid, by_index);
        }
        data.index_meta_generations = IndexMetaDataGenerations::from_parts(resolved_lookups, identifiers);

        Ok(data)
    }
}

// ============================================================================
// Document Shape
// ============================================================================

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RepositoryDataDoc {
    generation: RepoGen,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_version: Option<Version>,
    snapshots: Vec<SnapshotEntryDoc>,
    indices: BTreeMap<String, IndexEntryDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index_metadata_identifiers: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SnapshotEntryDoc {
    name: String,
    uuid: String,
    state: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    index_metadata_lookup: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexEntryDoc {
    id: String,
    snapshots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shard_generations: Option<Vec<Option<String>>>,
}
