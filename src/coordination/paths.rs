//! Coordination namespace layout.
//!
//! All znodes for one cluster live under a single root so several clusters can
//! share a coordination ensemble. Path construction is centralized here; no
//! other module builds path strings by hand.

use crate::cluster::{ReplicaId, ShardId};

/// Path builder for one cluster's coordination namespace.
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    root: String,
}

impl ClusterPaths {
    pub fn new(cluster_name: &str) -> Self {
        Self {
            root: format!("/helmsman-{}", cluster_name),
        }
    }

    /// The cluster root path.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Parent of all replica subtrees.
    pub fn topology(&self) -> String {
        format!("{}/Topology", self.root)
    }

    /// One replica's subtree; data is the decimal replica id.
    pub fn replica(&self, replica: ReplicaId) -> String {
        format!("{}/Topology/Replica{}", self.root, replica)
    }

    /// A node's ephemeral znode inside one replica.
    pub fn node(&self, replica: ReplicaId, shard: ShardId) -> String {
        format!("{}/Topology/Replica{}/Node{}", self.root, replica, shard)
    }

    /// Parent of the ephemeral-sequential primary-worker registrations of one
    /// shard; the first child is the shard's primary worker.
    pub fn primary_node_parent(&self, shard: ShardId) -> String {
        format!("{}/PrimaryNodes/Node{}", self.root, shard)
    }

    /// Parent of all master server registrations.
    pub fn server_parent(&self) -> String {
        format!("{}/Servers", self.root)
    }

    /// Prefix for an ephemeral-sequential server registration.
    pub fn server(&self) -> String {
        format!("{}/Servers/Server", self.root)
    }

    /// Parent of all per-shard write queues.
    pub fn write_queue_root(&self) -> String {
        format!("{}/WriteReqQueue", self.root)
    }

    /// One shard's write queue parent.
    pub fn write_queue_parent(&self, shard: ShardId) -> String {
        format!("{}/WriteReqQueue/{}", self.root, shard)
    }

    /// Prefix for an ephemeral-sequential request in one shard's queue.
    pub fn write_queue_node(&self, shard: ShardId) -> String {
        format!("{}/WriteReqQueue/{}/req", self.root, shard)
    }

    /// Parent of the per-shard write locks.
    pub fn write_prepare_parent(&self) -> String {
        format!("{}/WriteReqPrepare", self.root)
    }

    /// One shard's ephemeral write lock.
    pub fn write_prepare_node(&self, shard: ShardId) -> String {
        format!("{}/WriteReqPrepare/{}", self.root, shard)
    }

    /// The cluster-wide ephemeral migration marker.
    pub fn migrate_prepare(&self) -> String {
        format!("{}/migrate_sharding", self.root)
    }

    /// True when `path` lies inside the topology subtree.
    pub fn in_topology(&self, path: &str) -> bool {
        path.starts_with(&format!("{}/Topology", self.root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let paths = ClusterPaths::new("demo");
        assert_eq!(paths.root(), "/helmsman-demo");
        assert_eq!(paths.node(2, 3), "/helmsman-demo/Topology/Replica2/Node3");
        assert_eq!(
            paths.write_queue_node(1),
            "/helmsman-demo/WriteReqQueue/1/req"
        );
        assert_eq!(
            paths.write_prepare_node(1),
            "/helmsman-demo/WriteReqPrepare/1"
        );
        assert_eq!(paths.migrate_prepare(), "/helmsman-demo/migrate_sharding");
        assert!(paths.in_topology(&paths.node(1, 1)));
        assert!(!paths.in_topology(&paths.write_prepare_node(1)));
    }
}
