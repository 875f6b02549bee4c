//! Aggregator routing-table maintenance.
//!
//! An aggregator is the RPC router that fans a request out to the workers of a
//! collection's shards and merges responses; it lives outside this crate. The
//! binder's job is to keep each registered aggregator's routing table a pure
//! function of the worker registry and the topology's per-collection shard
//! lists: any change to either triggers a rebuild, and tables are handed over
//! as owned copies so the aggregator never reads shared mutable state.

use std::sync::Arc;

use tracing::{debug, error, info};

use super::node::ShardId;
use super::registry::WorkerRegistry;
use super::topology::Topology;

/// A worker address used for busy-state reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
}

/// One row of a routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub shard: ShardId,
    pub host: String,
    pub port: u16,
    /// True when the worker is co-located with the requesting master.
    pub local: bool,
}

/// The full routing table delivered to an aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    /// True for multi-replica read fan-out tables.
    pub read_only: bool,
    pub workers: Vec<WorkerEntry>,
}

/// The seam to the external aggregator collaborator.
pub trait Aggregator: Send + Sync {
    fn service(&self) -> &str;
    fn collection(&self) -> &str;
    /// Replace the aggregator's routing table.
    fn set_routing(&self, table: RoutingTable);
    /// Replace the aggregator's busy-worker list.
    fn set_busy_workers(&self, busy: Vec<WorkerEndpoint>);
}

/// Keeps registered aggregators' routing tables in sync with the registry.
#[derive(Default)]
pub struct AggregatorBinder {
    primary: Vec<Arc<dyn Aggregator>>,
    read_only: Vec<Arc<dyn Aggregator>>,
}

impl AggregatorBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, aggregator: Arc<dyn Aggregator>, read_only: bool) {
        info!(
            "registering {} aggregator for {}/{}",
            if read_only { "read-only" } else { "primary" },
            aggregator.service(),
            aggregator.collection()
        );
        if read_only {
            self.read_only.push(aggregator);
        } else {
            self.primary.push(aggregator);
        }
    }

    /// Rebuild every primary routing table from the single-node-per-shard map.
    pub fn rebind_primary(&self, topology: &Topology, registry: &WorkerRegistry) {
        for aggregator in &self.primary {
            self.rebind_one(aggregator, topology, registry, false);
        }
    }

    /// Rebuild every read-only routing table from the multi-replica map.
    pub fn rebind_read_only(&self, topology: &Topology, registry: &WorkerRegistry) {
        for aggregator in &self.read_only {
            self.rebind_one(aggregator, topology, registry, true);
        }
    }

    pub fn rebind_all(&self, topology: &Topology, registry: &WorkerRegistry) {
        self.rebind_primary(topology, registry);
        self.rebind_read_only(topology, registry);
    }

    /// Refresh only the busy lists, for passes where routing did not change
    /// but workers' busy collections may have.
    pub fn refresh_busy(&self, registry: &WorkerRegistry) {
        for aggregator in &self.read_only {
            aggregator.set_busy_workers(busy_workers(registry, aggregator.collection()));
        }
    }

    fn rebind_one(
        &self,
        aggregator: &Arc<dyn Aggregator>,
        topology: &Topology,
        registry: &WorkerRegistry,
        read_only: bool,
    ) {
        debug!(
            "rebinding aggregator {}/{}",
            aggregator.service(),
            aggregator.collection()
        );
        let shard_ids =
            match topology.shard_ids_for(aggregator.service(), aggregator.collection()) {
                Ok(ids) => ids,
                Err(err) => {
                    info!(
                        "no shard nodes for aggregator {}: {}",
                        aggregator.collection(),
                        err
                    );
                    return;
                }
            };

        let mut table = RoutingTable {
            read_only,
            workers: Vec::new(),
        };

        if read_only {
            aggregator.set_busy_workers(busy_workers(registry, aggregator.collection()));
            for shard in &shard_ids {
                match registry.read_only_replicas(*shard) {
                    Some(replicas) if !replicas.is_empty() => {
                        for node in replicas.values() {
                            if !node.is_good {
                                debug!(
                                    "worker {} replica {} is not good, skipped from read fan-out",
                                    node.shard, node.replica
                                );
                                continue;
                            }
                            if let Some(port) = node.worker_port {
                                table.workers.push(WorkerEntry {
                                    shard: *shard,
                                    host: node.host.clone(),
                                    port,
                                    local: false,
                                });
                            }
                        }
                    }
                    _ => {
                        error!(
                            "worker {} was not found for aggregator of {} in service {}",
                            shard,
                            aggregator.collection(),
                            aggregator.service()
                        );
                    }
                }
            }
        } else {
            for shard in &shard_ids {
                match registry.worker(*shard) {
                    Some(node) => {
                        if !node.is_good {
                            debug!("worker {} is not good, skipped from routing", node.shard);
                            continue;
                        }
                        if let Some(port) = node.worker_port {
                            table.workers.push(WorkerEntry {
                                shard: *shard,
                                host: node.host.clone(),
                                port,
                                local: node.shard == topology.current.shard,
                            });
                        }
                    }
                    None => {
                        error!(
                            "worker {} was not found for aggregator of {} in service {}",
                            shard,
                            aggregator.collection(),
                            aggregator.service()
                        );
                    }
                }
            }
        }

        aggregator.set_routing(table);
    }
}

/// Read-only workers whose advertised busy collection matches `collection`.
fn busy_workers(registry: &WorkerRegistry, collection: &str) -> Vec<WorkerEndpoint> {
    if collection.is_empty() {
        return Vec::new();
    }
    let mut busy = Vec::new();
    for (_, replicas) in registry.read_only_iter() {
        for node in replicas.values() {
            if node.busy_state == collection {
                if let Some(port) = node.worker_port {
                    busy.push(WorkerEndpoint {
                        host: node.host.clone(),
                        port,
                    });
                }
            }
        }
    }
    busy
}
