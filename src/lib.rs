//! # Helmsman
//!
//! Master controller for a sharded search/indexing cluster.
//!
//! Helmsman coordinates a fleet of worker nodes through a hierarchical,
//! ephemeral-znode, watch-driven coordination store. A master process embeds a
//! [`cluster::MasterController`] that discovers workers across replicas, tracks
//! their liveness, fails a dead worker slot over to an equivalent slot in
//! another replica (and back when the preferred replica returns), and publishes
//! the cluster's read-readiness to clients.
//!
//! ## Key Pieces
//!
//! - **Coordination client**: typed access to the store with session events and
//!   one-shot watches ([`coordination`])
//! - **Master controller**: the replica/worker detection state machine
//!   ([`cluster::MasterController`])
//! - **Write broker**: serialized cluster-wide write admission through
//!   per-shard queues and an ephemeral prepare lock ([`cluster::WriteBroker`])
//! - **Migration coordinator**: the controlled resharding handshake
//!   ([`cluster::MigrationCoordinator`])
//! - **Aggregator binder**: per-collection routing tables fanning requests out
//!   to the live workers of each shard ([`cluster::AggregatorBinder`])
//!
//! ## Architecture
//!
//! Components form an explicit dependency chain constructed once at startup:
//! coordination client → topology → controller → broker → binder. Workers are
//! held by value in the registry and referenced by shard id, never by shared
//! ownership.

pub mod cluster;
pub mod config;
pub mod coordination;
pub mod indexing;
pub mod telemetry;

mod error;

pub use error::{CoordError, Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::cluster::{
        Aggregator, AggregatorBinder, MasterController, MasterState, MigrationCoordinator,
        RoutingTable, SearchNode, WriteBroker,
    };
    pub use crate::config::{ClusterConfig, DistributedConfig};
    pub use crate::coordination::{ClusterPaths, CoordClient, MemoryCoordStore, Watch};
    pub use crate::{CoordError, Error, Result};
}
