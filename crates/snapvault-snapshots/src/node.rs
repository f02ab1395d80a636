//! A cluster node: its roles, snapshot pool, shards, and repositories.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use snapvault_cluster::{ClusterService, DiscoveryNode};
use snapvault_config::SnapvaultConfig;
use snapvault_repository::{Repository, RepositoryOptions};
use tracing::info;

use crate::{RepositoriesService, RepositoryTypes, Result, ShardStore, SnapshotError};

/// What a node does in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRoles {
    pub master_eligible: bool,
    pub data: bool,
}

impl NodeRoles {
    pub const MASTER: Self = Self {
        master_eligible: true,
        data: false,
    };
    pub const DATA: Self = Self {
        master_eligible: false,
        data: true,
    };
}

/// One node. Shard snapshots run on its bounded snapshot pool, so a blocked
/// shard snapshot only holds one of the node's snapshot threads.
#[derive(Debug)]
pub struct Node {
    id: String,
    roles: NodeRoles,
    pool: rayon::ThreadPool,
    pool_size: usize,
    repositories: RepositoriesService,
    shards: ShardStore,
    closed: AtomicBool,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        roles: NodeRoles,
        cluster: Arc<ClusterService>,
        types: RepositoryTypes,
        config: &SnapvaultConfig,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let pool_size = config.node.snapshot_pool_size.max(1);
        let pool = {
            let id = id.clone();
            rayon::ThreadPoolBuilder::new()
                .num_threads(pool_size)
                .thread_name(move |i| format!("{id}[snapshot][{i}]"))
                .build()?
        };
        let options = RepositoryOptions {
            max_finalize_retries: config.repository.max_finalize_retries,
            compress: config.repository.compress,
        };
        info!(node = %id, ?roles, pool_size, "starting node");
        Ok(Arc::new(Self {
            repositories: RepositoriesService::new(id.clone(), cluster, types, options),
            id,
            roles,
            pool,
            pool_size,
            shards: ShardStore::new(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn roles(&self) -> NodeRoles {
        self.roles
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn discovery_node(&self) -> DiscoveryNode {
        DiscoveryNode {
            id: self.id.clone(),
            master_eligible: self.roles.master_eligible,
            data: self.roles.data,
        }
    }

    pub fn repositories(&self) -> &RepositoriesService {
        &self.repositories
    }

    /// This node's instance of repository `name`.
    pub fn repository(&self, name: &str) -> Result<Arc<dyn Repository>> {
        if self.is_closed() {
            return Err(SnapshotError::NodeClosed { node: self.id.clone() });
        }
        self.repositories.repository(name)
    }

    pub fn shards(&self) -> &ShardStore {
        &self.shards
    }

    /// Runs `task` on the node's snapshot pool.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.spawn(task);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the node's repositories, failing any operation blocked in
    /// them. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(node = %self.id, "stopping node");
            self.repositories.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use snapvault_cluster::ClusterState;

    use super::*;

    #[test]
    fn pool_threads_are_named_after_the_node() {
        let cluster = Arc::new(ClusterService::new(ClusterState::new()));
        let node = Node::new(
            "data-0",
            NodeRoles::DATA,
            cluster,
            RepositoryTypes::default(),
            &SnapvaultConfig::default(),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        node.spawn(move || {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        });

        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("data-0[snapshot]["), "{name}");
        assert_eq!(node.pool_size(), 2);
    }

    #[test]
    fn closed_node_refuses_repository_access() {
        let cluster = Arc::new(ClusterService::new(ClusterState::new()));
        let node = Node::new(
            "data-0",
            NodeRoles::DATA,
            cluster,
            RepositoryTypes::default(),
            &SnapvaultConfig::default(),
        )
        .unwrap();

        node.close();
        node.close();

        assert!(node.is_closed());
        assert!(matches!(node.repository("repo"), Err(SnapshotError::NodeClosed { .. })));
    }
}
