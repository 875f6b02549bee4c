//! Node identity and advertised state.
//!
//! Every shard exists in every replica; a node is the concrete host serving
//! one shard in one replica. Nodes advertise themselves through an ephemeral
//! znode whose payload carries host, ports, and readiness, and the controller
//! keeps the parsed form in its worker registry.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::coordination::payload::{
    KEY_DATA_PORT, KEY_HOST, KEY_MASTER_PORT, KEY_NODE_BUSY_STATE, KEY_WORKER_PORT,
};
use crate::coordination::KvPayload;

/// A data partition id. Node ids and shard ids coincide: node `s` of a replica
/// serves shard `s`.
pub type ShardId = u32;

/// A full horizontal copy of the cluster.
pub type ReplicaId = u32;

/// Service-readiness states advertised via the server znode payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// All shards this master fans out to are ready.
    ReadyForRead,
    /// Some remote shard is not ready.
    BusyForShard,
    /// This node itself is not ready (starting up or awaiting migration).
    BusyForSelf,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::ReadyForRead => "ReadyForRead",
            ServiceState::BusyForShard => "BusyForShard",
            ServiceState::BusyForSelf => "BusyForSelf",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ReadyForRead" => Some(ServiceState::ReadyForRead),
            "BusyForShard" => Some(ServiceState::BusyForShard),
            "BusyForSelf" => Some(ServiceState::BusyForSelf),
            _ => None,
        }
    }

    /// Readable states still serve queries; busy-for-self does not.
    pub fn serves_reads(self) -> bool {
        matches!(self, ServiceState::ReadyForRead | ServiceState::BusyForShard)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker lifecycle states advertised as the numeric `node_state` payload key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodeState {
    Init = 0,
    Starting = 1,
    Started = 2,
    Recovering = 3,
}

impl NodeState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(NodeState::Init),
            1 => Some(NodeState::Starting),
            2 => Some(NodeState::Started),
            3 => Some(NodeState::Recovering),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// One concrete host serving one shard in one replica, as last advertised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchNode {
    /// Shard this node serves (equals its node id).
    pub shard: ShardId,
    /// Replica the node currently bound to this slot lives in.
    pub replica: ReplicaId,
    pub host: String,
    pub master_port: Option<u16>,
    pub worker_port: Option<u16>,
    pub data_port: Option<u16>,
    /// Collection name the worker reports itself busy for, empty when idle.
    pub busy_state: String,
    /// False when the node is down or its advertisement failed to parse.
    pub is_good: bool,
}

impl SearchNode {
    /// Build a node from its znode advertisement.
    ///
    /// Port fields are parsed strictly; a worker or data port that fails to
    /// parse marks the node `!is_good` so routing skips it, but the node is
    /// kept so the slot recovers when a valid advertisement arrives.
    pub fn from_payload(shard: ShardId, replica: ReplicaId, payload: &KvPayload) -> Self {
        let mut node = SearchNode {
            shard,
            replica,
            host: payload.get_str(KEY_HOST).to_string(),
            master_port: None,
            worker_port: None,
            data_port: None,
            busy_state: payload.get_str(KEY_NODE_BUSY_STATE).to_string(),
            is_good: true,
        };

        match payload.get_port(KEY_WORKER_PORT) {
            Ok(port) => node.worker_port = Some(port),
            Err(err) => {
                error!(
                    "invalid worker port from node {} @{}: {}",
                    shard, node.host, err
                );
                node.is_good = false;
            }
        }
        match payload.get_port(KEY_DATA_PORT) {
            Ok(port) => node.data_port = Some(port),
            Err(err) => {
                error!("invalid data port from node {} @{}: {}", shard, node.host, err);
                node.is_good = false;
            }
        }
        if payload.has_key(KEY_MASTER_PORT) {
            node.master_port = payload.get_port(KEY_MASTER_PORT).ok();
        }
        node
    }

    /// Structural equality used for routing-table change detection.
    ///
    /// Busy state and data port changes are deliberately excluded: they do not
    /// alter where requests are routed.
    pub fn same_worker(&self, other: &SearchNode) -> bool {
        self.shard == other.shard
            && self.replica == other.replica
            && self.host == other.host
            && self.worker_port == other.worker_port
            && self.is_good == other.is_good
    }
}

/// Master capability of the current node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterRole {
    pub enabled: bool,
    pub name: String,
    pub port: u16,
}

/// Worker capability of the current node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerRole {
    pub enabled: bool,
    pub port: u16,
}

/// Full description of the process-local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentNode {
    pub shard: ShardId,
    pub replica: ReplicaId,
    pub host: String,
    /// Client-facing (business-agent) port advertised on the server znode.
    pub ba_port: u16,
    pub data_port: u16,
    pub master: MasterRole,
    pub worker: WorkerRole,
}

impl CurrentNode {
    /// True when the node masters but does not serve any shard itself.
    pub fn is_only_master(&self) -> bool {
        self.master.enabled && !self.worker.enabled
    }
}
