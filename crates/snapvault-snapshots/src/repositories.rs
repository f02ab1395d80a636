//! Repository types and per-node repository instances.
//!
//! Repository registration lives in cluster state; every node builds its own
//! [`Repository`] instance from the registered metadata on first use, through
//! the [`RepositoryFactory`] registered for the repository's type.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use snapvault_blobstore::{BlobStore, FsBlobStore};
use snapvault_cluster::{ClusterService, RepositoryMetadata};
use snapvault_repository::{BlobStoreRepository, LOCATION_SETTING, Repository, RepositoryOptions};
use snapvault_types::Settings;
use tracing::{debug, info};

use crate::{Result, SnapshotError};

/// Repository type backed by a shared directory.
pub const FS_TYPE: &str = "fs";

/// Everything a factory needs to build one node's repository instance.
pub struct RepositoryContext<'a> {
    pub node: &'a str,
    pub metadata: &'a RepositoryMetadata,
    pub cluster: Arc<ClusterService>,
    pub options: RepositoryOptions,
}

/// Builds repository instances of one type.
pub trait RepositoryFactory: Send + Sync + Debug {
    fn create(&self, context: RepositoryContext<'_>) -> snapvault_repository::Result<Arc<dyn Repository>>;
}

/// Factory for [`FS_TYPE`] repositories.
#[derive(Debug, Default)]
pub struct FsRepositoryFactory;

impl RepositoryFactory for FsRepositoryFactory {
    fn create(&self, context: RepositoryContext<'_>) -> snapvault_repository::Result<Arc<dyn Repository>> {
        let metadata = context.metadata;
        let location = metadata.settings.get_required(LOCATION_SETTING)?;
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(location)?);
        let repository = BlobStoreRepository::new(
            metadata.name.clone(),
            metadata.repo_type.clone(),
            metadata.settings.clone(),
            store,
            context.cluster,
            context.options,
        )?;
        Ok(Arc::new(repository))
    }
}

/// Registry of repository types, passed explicitly to every node.
#[derive(Debug, Clone)]
pub struct RepositoryTypes {
    factories: BTreeMap<String, Arc<dyn RepositoryFactory>>,
}

impl RepositoryTypes {
    /// Registry with no types.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn with(mut self, repo_type: impl Into<String>, factory: Arc<dyn RepositoryFactory>) -> Self {
        self.factories.insert(repo_type.into(), factory);
        self
    }

    pub fn get(&self, repo_type: &str) -> Option<&Arc<dyn RepositoryFactory>> {
        self.factories.get(repo_type)
    }

    pub fn contains(&self, repo_type: &str) -> bool {
        self.factories.contains_key(repo_type)
    }
}

impl Default for RepositoryTypes {
    /// Registry with the built-in [`FS_TYPE`].
    fn default() -> Self {
        Self::empty().with(FS_TYPE, Arc::new(FsRepositoryFactory))
    }
}

#[derive(Debug)]
struct Instance {
    repo_type: String,
    settings: Settings,
    repository: Arc<dyn Repository>,
}

/// Repository instances of one node.
#[derive(Debug)]
pub struct RepositoriesService {
    node: String,
    cluster: Arc<ClusterService>,
    types: RepositoryTypes,
    options: RepositoryOptions,
    instances: Mutex<BTreeMap<String, Instance>>,
}

impl RepositoriesService {
    pub fn new(
        node: impl Into<String>,
        cluster: Arc<ClusterService>,
        types: RepositoryTypes,
        options: RepositoryOptions,
    ) -> Self {
        Self {
            node: node.into(),
            cluster,
            types,
            options,
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Instance>> {
        self.instances.lock().expect("repositories lock poisoned")
    }

    /// This node's instance of repository `name`, built from cluster state
    /// on first use and rebuilt when its registration changes.
    pub fn repository(&self, name: &str) -> Result<Arc<dyn Repository>> {
        let state = self.cluster.state();
        let metadata = state
            .metadata()
            .repository(name)
            .ok_or_else(|| SnapshotError::RepositoryMissing {
                repository: name.to_string(),
            })?;

        let mut instances = self.lock();
        if let Some(instance) = instances.get(name) {
            if instance.repo_type == metadata.repo_type && instance.settings == metadata.settings {
                return Ok(Arc::clone(&instance.repository));
            }
            debug!(node = %self.node, repository = name, "repository registration changed, rebuilding");
            instance.repository.close();
        }

        let factory = self
            .types
            .get(&metadata.repo_type)
            .ok_or_else(|| SnapshotError::UnknownRepositoryType {
                repo_type: metadata.repo_type.clone(),
            })?;
        let repository = factory.create(RepositoryContext {
            node: &self.node,
            metadata,
            cluster: Arc::clone(&self.cluster),
            options: self.options,
        })?;
        info!(node = %self.node, repository = name, repo_type = %metadata.repo_type, "created repository");
        instances.insert(
            name.to_string(),
            Instance {
                repo_type: metadata.repo_type.clone(),
                settings: metadata.settings.clone(),
                repository: Arc::clone(&repository),
            },
        );
        Ok(repository)
    }

    /// Already built instances; never builds one.
    pub fn existing(&self) -> Vec<Arc<dyn Repository>> {
        self.lock()
            .values()
            .map(|instance| Arc::clone(&instance.repository))
            .collect()
    }

    /// Closes and forgets this node's instance of `name`.
    pub fn remove(&self, name: &str) {
        if let Some(instance) = self.lock().remove(name) {
            instance.repository.close();
        }
    }

    /// Closes every instance.
    pub fn close(&self) {
        let instances = std::mem::take(&mut *self.lock());
        for instance in instances.into_values() {
            instance.repository.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use snapvault_cluster::{ClusterState, DiscoveryNode, Metadata};

    use super::*;

    fn service(settings: Settings, repo_type: &str) -> (Arc<ClusterService>, RepositoriesService) {
        let metadata = Metadata::default().with_repository(RepositoryMetadata::new("repo", repo_type, settings));
        let cluster = Arc::new(ClusterService::new(
            ClusterState::new()
                .with_master("node-0")
                .with_node(DiscoveryNode::master("node-0"))
                .with_metadata(metadata),
        ));
        let service = RepositoriesService::new(
            "node-0",
            Arc::clone(&cluster),
            RepositoryTypes::default(),
            RepositoryOptions::default(),
        );
        (cluster, service)
    }

    #[test]
    fn instances_are_reused_until_registration_changes() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("repo");
        let (cluster, service) = service(
            Settings::builder().put(LOCATION_SETTING, location.display()).build(),
            FS_TYPE,
        );

        let first = service.repository("repo").unwrap();
        let again = service.repository("repo").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let compressed = Settings::builder()
            .put(LOCATION_SETTING, location.display())
            .put("compress", true)
            .build();
        cluster
            .submit_update::<_, SnapshotError>("update repository", |state| {
                let metadata = state
                    .metadata()
                    .clone()
                    .with_repository(RepositoryMetadata::new("repo", FS_TYPE, compressed));
                Ok(state.clone().with_metadata(metadata))
            })
            .unwrap();

        let rebuilt = service.repository("repo").unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(service.existing().len(), 1);
    }

    #[test]
    fn unregistered_repository_is_missing() {
        let (_cluster, service) = service(Settings::empty(), FS_TYPE);
        let err = service.repository("other").unwrap_err();
        assert!(matches!(err, SnapshotError::RepositoryMissing { .. }), "{err}");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let (_cluster, service) = service(Settings::empty(), "s3");
        let err = service.repository("repo").unwrap_err();
        assert!(matches!(err, SnapshotError::UnknownRepositoryType { .. }), "{err}");
    }

    #[test]
    fn fs_repository_requires_location() {
        let (_cluster, service) = service(Settings::empty(), FS_TYPE);
        let err = service.repository("repo").unwrap_err();
        assert!(matches!(err, SnapshotError::Repository(_)), "{err}");
    }
}
