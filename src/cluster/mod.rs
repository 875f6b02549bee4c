//! Cluster coordination for distributed helmsman
//!
//! This module is the master side of the cluster: worker discovery across
//! replicas, failover and recovery of shard slots, serialized write admission,
//! the resharding handshake, and aggregator routing-table maintenance.

mod binder;
mod broker;
mod controller;
mod migration;
mod node;
mod registry;
mod topology;

pub use binder::{Aggregator, AggregatorBinder, RoutingTable, WorkerEndpoint, WorkerEntry};
pub use broker::{WriteBroker, MAX_WRITE_PAYLOAD};
pub use controller::{MasterController, MasterState};
pub use migration::MigrationCoordinator;
pub use node::{
    CurrentNode, MasterRole, NodeState, ReplicaId, SearchNode, ServiceState, ShardId, WorkerRole,
};
pub use registry::WorkerRegistry;
pub use topology::{CollectionRoute, Topology};
