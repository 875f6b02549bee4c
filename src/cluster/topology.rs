//! Cluster topology snapshot.
//!
//! The topology is an immutable description of the cluster this node believes
//! it is part of: which shards exist, what this node is, and which shards each
//! service/collection pair fans out to. Updates replace the whole snapshot;
//! the controller compares shard sets across snapshots to decide whether a
//! worker re-detection pass is needed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::node::{CurrentNode, ShardId};
use crate::{Error, Result};

/// One collection served by a service, with the shards it fans out to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionRoute {
    pub name: String,
    pub shards: Vec<ShardId>,
}

/// Immutable topology snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub cluster_name: String,
    pub current: CurrentNode,
    /// Every shard id the cluster is partitioned into.
    pub all_shards: BTreeSet<ShardId>,
    /// Collections per service, in registration order.
    services: BTreeMap<String, Vec<CollectionRoute>>,
}

impl Topology {
    pub fn new(cluster_name: impl Into<String>, current: CurrentNode) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            current,
            all_shards: BTreeSet::new(),
            services: BTreeMap::new(),
        }
    }

    pub fn with_shards(mut self, shards: impl IntoIterator<Item = ShardId>) -> Self {
        self.all_shards = shards.into_iter().collect();
        self
    }

    /// Register a collection under a service.
    pub fn add_collection(
        mut self,
        service: &str,
        collection: &str,
        shards: Vec<ShardId>,
    ) -> Self {
        self.services
            .entry(service.to_string())
            .or_default()
            .push(CollectionRoute {
                name: collection.to_string(),
                shards,
            });
        self
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn collections_for(&self, service: &str) -> &[CollectionRoute] {
        self.services.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Shard list for one service/collection pair.
    ///
    /// A collection without a configured shard list fails the operation that
    /// asked, not the controller.
    pub fn shard_ids_for(&self, service: &str, collection: &str) -> Result<Vec<ShardId>> {
        self.collections_for(service)
            .iter()
            .find(|route| route.name == collection)
            .map(|route| route.shards.clone())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no shard list configured for collection {} in service {}",
                    collection, service
                ))
            })
    }

    /// True when a new-sharding id list from the migration marker names this
    /// node.
    pub fn is_mine_new_sharding(&self, new_sharding_ids: &[ShardId]) -> bool {
        new_sharding_ids.contains(&self.current.shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{MasterRole, WorkerRole};

    fn current() -> CurrentNode {
        CurrentNode {
            shard: 1,
            replica: 1,
            host: "10.0.1.1".to_string(),
            ba_port: 18080,
            data_port: 18121,
            master: MasterRole {
                enabled: true,
                name: "m1".to_string(),
                port: 18131,
            },
            worker: WorkerRole {
                enabled: true,
                port: 18151,
            },
        }
    }

    #[test]
    fn shard_lookup() {
        let topo = Topology::new("demo", current())
            .with_shards([1, 2, 3])
            .add_collection("search", "products", vec![1, 2])
            .add_collection("search", "reviews", vec![3]);

        assert_eq!(topo.shard_ids_for("search", "products").unwrap(), vec![1, 2]);
        assert!(topo.shard_ids_for("search", "missing").is_err());
        assert!(topo.shard_ids_for("recommend", "products").is_err());
    }

    #[test]
    fn new_sharding_membership() {
        let topo = Topology::new("demo", current()).with_shards([1, 2]);
        assert!(topo.is_mine_new_sharding(&[1, 4]));
        assert!(!topo.is_mine_new_sharding(&[4, 5]));
    }
}
