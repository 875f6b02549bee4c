//! Worker registry: the live view of which node serves each shard.
//!
//! Two maps are maintained side by side. `workers` binds every shard to the
//! single node writes and primary reads go to; `read_only` keeps every live
//! replica of every shard for read fan-out. Both are plain data mutated only
//! under the controller's state lock; change detection compares snapshots
//! structurally so routing tables are rebuilt only when routing actually
//! changed.

use std::collections::BTreeMap;

use super::node::{ReplicaId, SearchNode, ShardId};

/// Per-shard worker bindings.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    /// The node currently used for each shard.
    workers: BTreeMap<ShardId, SearchNode>,
    /// Every live replica of every shard, for read-only fan-out.
    read_only: BTreeMap<ShardId, BTreeMap<ReplicaId, SearchNode>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(&self, shard: ShardId) -> Option<&SearchNode> {
        self.workers.get(&shard)
    }

    pub fn worker_mut(&mut self, shard: ShardId) -> Option<&mut SearchNode> {
        self.workers.get_mut(&shard)
    }

    pub fn insert_worker(&mut self, node: SearchNode) {
        self.workers.insert(node.shard, node);
    }

    pub fn workers(&self) -> impl Iterator<Item = &SearchNode> {
        self.workers.values()
    }

    pub fn workers_mut(&mut self) -> impl Iterator<Item = &mut SearchNode> {
        self.workers.values_mut()
    }

    /// Swap the primary map out, leaving it empty; used at the start of a
    /// detection pass so the pass rebuilds from scratch and the old snapshot
    /// remains available for comparison.
    pub fn take_workers(&mut self) -> BTreeMap<ShardId, SearchNode> {
        std::mem::take(&mut self.workers)
    }

    pub fn read_only_worker(&self, shard: ShardId, replica: ReplicaId) -> Option<&SearchNode> {
        self.read_only.get(&shard).and_then(|m| m.get(&replica))
    }

    pub fn read_only_replicas(&self, shard: ShardId) -> Option<&BTreeMap<ReplicaId, SearchNode>> {
        self.read_only.get(&shard)
    }

    pub fn insert_read_only(&mut self, node: SearchNode) {
        self.read_only
            .entry(node.shard)
            .or_default()
            .insert(node.replica, node);
    }

    pub fn read_only_worker_mut(
        &mut self,
        shard: ShardId,
        replica: ReplicaId,
    ) -> Option<&mut SearchNode> {
        self.read_only.get_mut(&shard).and_then(|m| m.get_mut(&replica))
    }

    pub fn take_read_only(&mut self) -> BTreeMap<ShardId, BTreeMap<ReplicaId, SearchNode>> {
        std::mem::take(&mut self.read_only)
    }

    pub fn read_only_iter(
        &self,
    ) -> impl Iterator<Item = (&ShardId, &BTreeMap<ReplicaId, SearchNode>)> {
        self.read_only.iter()
    }

    /// Structural comparison of a primary snapshot against the live map.
    pub fn workers_match(&self, old: &BTreeMap<ShardId, SearchNode>) -> bool {
        old.len() == self.workers.len()
            && old
                .iter()
                .zip(self.workers.iter())
                .all(|((ok, on), (nk, nn))| ok == nk && on.same_worker(nn))
    }

    /// Structural comparison of a read-only snapshot against the live map.
    pub fn read_only_match(
        &self,
        old: &BTreeMap<ShardId, BTreeMap<ReplicaId, SearchNode>>,
    ) -> bool {
        old.len() == self.read_only.len()
            && old.iter().zip(self.read_only.iter()).all(
                |((old_shard, old_replicas), (new_shard, new_replicas))| {
                    old_shard == new_shard
                        && old_replicas.len() == new_replicas.len()
                        && old_replicas.iter().zip(new_replicas.iter()).all(
                            |((or, on), (nr, nn))| or == nr && on.same_worker(nn),
                        )
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::payload::{KEY_DATA_PORT, KEY_HOST, KEY_WORKER_PORT};
    use crate::coordination::KvPayload;

    fn node(shard: ShardId, replica: ReplicaId, host: &str) -> SearchNode {
        let mut p = KvPayload::new();
        p.set(KEY_HOST, host);
        p.set(KEY_WORKER_PORT, 18151u16);
        p.set(KEY_DATA_PORT, 18121u16);
        SearchNode::from_payload(shard, replica, &p)
    }

    #[test]
    fn primary_snapshot_comparison() {
        let mut registry = WorkerRegistry::new();
        registry.insert_worker(node(1, 1, "a"));
        registry.insert_worker(node(2, 1, "b"));

        let old = registry.take_workers();
        registry.insert_worker(node(1, 1, "a"));
        registry.insert_worker(node(2, 1, "b"));
        assert!(registry.workers_match(&old));

        // rebinding shard 2 to another replica is a structural change
        registry.insert_worker(node(2, 2, "b2"));
        assert!(!registry.workers_match(&old));
    }

    #[test]
    fn read_only_snapshot_comparison() {
        let mut registry = WorkerRegistry::new();
        registry.insert_read_only(node(1, 1, "a"));
        registry.insert_read_only(node(1, 2, "a2"));

        let old = registry.take_read_only();
        registry.insert_read_only(node(1, 1, "a"));
        assert!(!registry.read_only_match(&old), "a lost replica is a change");

        registry.insert_read_only(node(1, 2, "a2"));
        assert!(registry.read_only_match(&old));
    }
}
