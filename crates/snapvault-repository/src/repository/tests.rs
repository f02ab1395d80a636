use snapvault_blobstore::{FsBlobStore, MemoryBlobStore};
use snapvault_cluster::{ClusterState, DiscoveryNode, Metadata, RepositoryMetadata};
use snapvault_types::SnapshotState;
use test_case::test_case;

use super::*;
use crate::{ShardFile, ViolationKind, paths::BlobRole};

fn cluster(settings: &Settings) -> Arc<ClusterService> {
    let metadata = Metadata::default().with_repository(RepositoryMetadata::new("repo", "fs", settings.clone()));
    Arc::new(ClusterService::new(
        ClusterState::new()
            .with_master("node-0")
            .with_node(DiscoveryNode::master("node-0"))
            .with_metadata(metadata),
    ))
}

fn repository_with(settings: Settings) -> (Arc<MemoryBlobStore>, BlobStoreRepository) {
    repository_with_options(settings, RepositoryOptions::default())
}

fn repository_with_options(
    settings: Settings,
    options: RepositoryOptions,
) -> (Arc<MemoryBlobStore>, BlobStoreRepository) {
    let store = Arc::new(MemoryBlobStore::new());
    let repository = open(Arc::clone(&store) as Arc<dyn BlobStore>, cluster(&settings), settings, options);
    (store, repository)
}

fn open(
    store: Arc<dyn BlobStore>,
    cluster: Arc<ClusterService>,
    settings: Settings,
    options: RepositoryOptions,
) -> BlobStoreRepository {
    BlobStoreRepository::new("repo", "fs", settings, store, cluster, options).unwrap()
}

fn repository() -> (Arc<MemoryBlobStore>, BlobStoreRepository) {
    repository_with(Settings::empty())
}

fn logs() -> IndexId {
    IndexId::new("logs", "i1")
}

fn index_metadata() -> IndexMetadataSnapshot {
    IndexMetadataSnapshot {
        name: "logs".into(),
        uuid: "logs-uuid".into(),
        number_of_shards: 1,
    }
}

fn info(snapshot: &SnapshotId, state: SnapshotState, version: Version) -> SnapshotInfo {
    SnapshotInfo {
        snapshot_id: snapshot.clone(),
        indices: vec!["logs".into()],
        state,
        reason: None,
        version,
        start_time: 1,
        end_time: 2,
        total_shards: 1,
        successful_shards: u32::from(state == SnapshotState::Success),
        shard_failures: Vec::new(),
        include_global_state: true,
        user_metadata: BTreeMap::new(),
    }
}

/// Snapshots shard 0 of `logs` with `files` and finalizes it.
fn take_snapshot(
    repository: &BlobStoreRepository,
    name: &str,
    files: &[(&str, &str)],
    version: Version,
) -> Result<(SnapshotId, Arc<RepositoryData>)> {
    let snapshot = SnapshotId::random(name);
    let data = repository.repository_data()?;
    let base = data.shard_generations().get(&logs(), 0).cloned();
    let generation = repository.snapshot_shard(
        ShardSnapshotRequest {
            snapshot: snapshot.clone(),
            index: logs(),
            shard: 0,
            files: files
                .iter()
                .map(|(name, content)| ShardFile {
                    physical_name: (*name).to_string(),
                    data: Bytes::copy_from_slice(content.as_bytes()),
                })
                .collect(),
            base_generation: base,
            legacy_format: legacy_shard_generations(&data, version),
        },
        &|| false,
    )?;
    let committed = repository.finalize_snapshot(FinalizeSnapshot {
        shard_generations: ShardGenerations::empty().with(logs(), 0, Some(generation)),
        repository_state_id: data.gen_id(),
        metadata: SnapshotMetadata {
            global: BTreeMap::from([("cluster".into(), "test".into())]),
            indices: BTreeMap::from([(logs(), index_metadata())]),
        },
        snapshot_info: info(&snapshot, SnapshotState::Success, version),
        version,
    })?;
    Ok((snapshot, committed))
}

fn assert_consistent(store: &MemoryBlobStore, repository: &BlobStoreRepository) {
    let data = repository.repository_data().unwrap();
    let report = check_consistency("repo", store, &data, None).unwrap();
    assert!(report.is_consistent(), "{report}");
}

#[test]
fn finalize_commits_snapshot_and_info() {
    let (store, repository) = repository();

    let (snapshot, data) = take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();

    assert_eq!(data.gen_id(), RepoGen::new(0));
    assert!(data.contains(&snapshot));
    assert_eq!(data.state(&snapshot), Some(SnapshotState::Success));
    let info = repository.snapshot_info(&snapshot).unwrap();
    assert_eq!(info.snapshot_id, snapshot);
    assert_consistent(&store, &repository);
}

#[test]
fn finalize_rejects_duplicate_names() {
    let (_store, repository) = repository();
    take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();

    let err = take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap_err();

    assert!(matches!(err, RepositoryError::SnapshotExists { .. }), "{err}");
}

/// A failed snapshot expecting the generation before the first commit.
fn finalize_from_empty(name: &str) -> FinalizeSnapshot {
    FinalizeSnapshot {
        shard_generations: ShardGenerations::empty().with_index(logs(), 1),
        repository_state_id: RepoGen::EMPTY,
        metadata: SnapshotMetadata {
            global: BTreeMap::new(),
            indices: BTreeMap::from([(logs(), index_metadata())]),
        },
        snapshot_info: info(&SnapshotId::random(name), SnapshotState::Failed, Version::CURRENT),
        version: Version::CURRENT,
    }
}

#[test]
fn finalize_retries_from_stale_generation() {
    let (store, repository) = repository();
    take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();

    let committed = repository.finalize_snapshot(finalize_from_empty("s2")).unwrap();

    assert_eq!(committed.gen_id(), RepoGen::new(1));
    assert_eq!(committed.snapshot_count(), 2);
    assert_consistent(&store, &repository);
}

#[test]
fn finalize_gives_up_after_retry_bound() {
    let options = RepositoryOptions {
        max_finalize_retries: 1,
        ..RepositoryOptions::default()
    };
    let (_store, repository) = repository_with_options(Settings::empty(), options);
    take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();

    let err = repository.finalize_snapshot(finalize_from_empty("s2")).unwrap_err();

    assert!(
        matches!(err, RepositoryError::RepositoryBusy { attempts: 1, .. }),
        "{err}"
    );
    let data = repository.repository_data().unwrap();
    assert_eq!(data.gen_id(), RepoGen::new(0));
    assert_eq!(data.snapshot_count(), 1);
}

#[test]
fn filesystem_repository_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = || Arc::new(FsBlobStore::open(dir.path()).unwrap()) as Arc<dyn BlobStore>;
    let first = open(store(), cluster(&Settings::empty()), Settings::empty(), RepositoryOptions::default());
    let (s1, _) = take_snapshot(&first, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();

    let cluster = cluster(&Settings::empty());
    let second = open(store(), Arc::clone(&cluster), Settings::empty(), RepositoryOptions::default());
    let data = second.repository_data().unwrap();
    assert!(data.contains(&s1));
    assert!(!cluster.state().repository_generation("repo").is_known());

    let (_, committed) = take_snapshot(&second, "s2", &[("a", "alpha"), ("b", "beta")], Version::CURRENT).unwrap();
    assert_eq!(committed.gen_id(), RepoGen::new(1));
    assert_eq!(cluster.state().repository_generation("repo"), RepoGen::new(1));
    assert_eq!(second.snapshot_info(&s1).unwrap().state, SnapshotState::Success);
}

#[test]
fn identical_index_metadata_is_written_once() {
    let (store, repository) = repository();
    take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();
    take_snapshot(&repository, "s2", &[("a", "alpha")], Version::CURRENT).unwrap();

    let meta_blobs: Vec<String> = store
        .list(&paths::index_dir(&logs()))
        .unwrap()
        .into_iter()
        .filter(|name| BlobRole::classify(name) == BlobRole::IndexMeta)
        .collect();
    assert_eq!(meta_blobs.len(), 1, "{meta_blobs:?}");
}

#[test]
fn readonly_repository_rejects_mutations() {
    let (_store, repository) = repository_with(Settings::builder().put(READONLY_SETTING, true).build());

    let err = take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap_err();

    assert!(matches!(err, RepositoryError::IllegalRepositoryState { .. }), "{err}");
    assert_eq!(repository.start_verification().unwrap(), None);
}

#[test]
fn delete_removes_unshared_blobs() {
    let (store, repository) = repository();
    let (s1, _) = take_snapshot(&repository, "s1", &[("a", "alpha"), ("b", "beta")], Version::CURRENT).unwrap();
    let (s2, data) = take_snapshot(&repository, "s2", &[("a", "alpha")], Version::CURRENT).unwrap();

    let data = repository.delete_snapshots(&[s1.clone()], data.gen_id()).unwrap();

    assert!(!data.contains(&s1));
    assert!(data.contains(&s2));
    assert!(!store.exists(&paths::snapshot_blob(s1.uuid())).unwrap());
    assert_consistent(&store, &repository);

    repository.delete_snapshots(&[s2], data.gen_id()).unwrap();
    let remaining = store.list(paths::INDICES_DIR).unwrap();
    assert!(remaining.is_empty(), "{remaining:?}");
    assert_consistent(&store, &repository);
}

#[test]
fn delete_keeps_legacy_generations_numeric() {
    let (store, repository) = repository();
    let (s1, _) = take_snapshot(&repository, "s1", &[("a", "alpha")], Version::V_7_5_0).unwrap();
    let (_s2, data) = take_snapshot(&repository, "s2", &[("b", "beta")], Version::V_7_5_0).unwrap();

    repository.delete_snapshots(&[s1], data.gen_id()).unwrap();

    let generations: Vec<String> = store
        .list(&paths::shard_dir(&logs(), 0))
        .unwrap()
        .into_iter()
        .filter(|name| BlobRole::classify(name) == BlobRole::ShardIndexN)
        .collect();
    assert_eq!(generations, vec![paths::shard_index_blob(&logs(), 0, &ShardGeneration::Legacy(2))]);
    assert_consistent(&store, &repository);
}

#[test]
fn delete_of_missing_snapshot_fails() {
    let (_store, repository) = repository();
    let (_, data) = take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();

    let err = repository
        .delete_snapshots(&[SnapshotId::random("ghost")], data.gen_id())
        .unwrap_err();

    assert!(matches!(err, RepositoryError::SnapshotMissing { .. }), "{err}");
}

#[test]
fn delete_requires_tracked_generation() {
    let (_store, repository) = repository();

    let err = repository
        .delete_snapshots(&[SnapshotId::random("s1")], RepoGen::UNKNOWN)
        .unwrap_err();

    assert!(matches!(err, RepositoryError::IllegalRepositoryState { .. }), "{err}");
}

#[test]
fn cleanup_removes_orphans() {
    let (store, repository) = repository();
    take_snapshot(&repository, "s1", &[("a", "alpha")], Version::CURRENT).unwrap();
    store
        .put("snap-leftover.dat", Bytes::from_static(b"junk"), false)
        .unwrap();
    let data = repository.repository_data().unwrap();
    let report = check_consistency("repo", store.as_ref(), &data, None).unwrap();
    assert_eq!(report.violations_of(ViolationKind::OrphanedBlob).count(), 1);

    let result = repository.cleanup().unwrap();

    assert_eq!(result, CleanupResult { blobs: 1, bytes: 4 });
    assert_consistent(&store, &repository);
}

#[test]
fn verification_round_trip() {
    let (store, repository) = repository();

    let seed = repository.start_verification().unwrap().unwrap();
    repository.verify(&seed, "node-1").unwrap();
    assert!(repository.verify("other-seed", "node-1").is_err());
    repository.end_verification(&seed).unwrap();

    assert!(store.list(paths::TESTS_PREFIX).unwrap().is_empty());
}

#[test_case(Version::CURRENT, None, false)]
#[test_case(Version::V_7_5_0, None, true)]
#[test_case(Version::CURRENT, Some(Version::V_7_5_0), true)]
#[test_case(Version::CURRENT, Some(Version::V_7_6_0), false)]
fn legacy_generations_follow_oldest_format(version: Version, existing: Option<Version>, expected: bool) {
    let data = existing.map_or_else(RepositoryData::empty, |existing| {
        RepositoryData::empty().add_snapshot(NewSnapshot {
            snapshot_id: SnapshotId::random("old"),
            state: SnapshotState::Success,
            version: existing,
            shard_generations: ShardGenerations::empty(),
            index_meta_lookup: BTreeMap::new(),
            new_identifiers: BTreeMap::new(),
        })
    });

    assert_eq!(legacy_shard_generations(&data, version), expected);
}
