//! Shared harness for cluster integration tests.
//!
//! Builds clusters against the in-process coordination store: fake workers are
//! plain client sessions that register the same znodes real workers would, so
//! killing a worker is just dropping its session.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use helmsman::cluster::{
    Aggregator, CurrentNode, MasterController, MasterRole, NodeState, ReplicaId, RoutingTable,
    ShardId, Topology, WorkerEndpoint, WorkerRole,
};
use helmsman::config::DistributedConfig;
use helmsman::coordination::payload::{
    KEY_DATA_PORT, KEY_HOST, KEY_NODE_BUSY_STATE, KEY_NODE_STATE, KEY_SELF_REG_PRIMARY_PATH,
    KEY_SERVICE_STATE, KEY_WORKER_PORT,
};
use helmsman::coordination::{ClusterPaths, CoordClient, KvPayload, MemoryCoordStore, Watch};

pub const SERVICE: &str = "search";
pub const COLLECTION: &str = "products";

/// One in-process cluster: a store, its namespace, and an admin session used
/// to scaffold the persistent parts of the tree.
pub struct TestCluster {
    pub store: Arc<MemoryCoordStore>,
    pub paths: ClusterPaths,
    pub admin: CoordClient,
    cluster_name: String,
}

impl TestCluster {
    pub fn new(cluster_name: &str) -> Self {
        helmsman::telemetry::init_tracing("warn");
        let store = Arc::new(MemoryCoordStore::new());
        let admin = CoordClient::connect(store.clone());
        let paths = ClusterPaths::new(cluster_name);
        admin.ensure_path(paths.root()).unwrap();
        admin.ensure_path(&paths.topology()).unwrap();
        Self {
            store,
            paths,
            admin,
            cluster_name: cluster_name.to_string(),
        }
    }

    /// Create the replica subtree (data is the decimal id, as workers publish).
    pub fn add_replica(&self, replica: ReplicaId) {
        let path = self.paths.replica(replica);
        if !self.admin.exists(&path, Watch::None) {
            self.admin
                .create(&path, replica.to_string().as_bytes())
                .unwrap();
        }
    }

    /// Create a shard's write-queue parent, as its own master would at startup.
    pub fn add_write_queue(&self, shard: ShardId) {
        self.admin
            .ensure_path(&self.paths.write_queue_root())
            .unwrap();
        self.admin
            .ensure_path(&self.paths.write_queue_parent(shard))
            .unwrap();
    }

    /// Register a live worker: a primary-candidate znode plus the node znode,
    /// both ephemeral under the worker's own session.
    pub fn register_worker(&self, replica: ReplicaId, shard: ShardId, host: &str) -> WorkerHandle {
        let client = CoordClient::connect(self.store.clone());

        let mut payload = KvPayload::new();
        payload.set(KEY_HOST, host);
        payload.set(KEY_WORKER_PORT, 18151u16);
        payload.set(KEY_DATA_PORT, 18121u16);
        payload.set(KEY_NODE_STATE, NodeState::Started.as_u32());
        payload.set(KEY_SERVICE_STATE, "ReadyForRead");

        let primary_parent = self.paths.primary_node_parent(shard);
        // the parent lives under the root; build intermediate levels once
        self.admin
            .ensure_path(&format!("{}/PrimaryNodes", self.paths.root()))
            .unwrap();
        self.admin.ensure_path(&primary_parent).unwrap();
        let primary_path = client
            .create_ephemeral_sequential(
                &format!("{}/node", primary_parent),
                &payload.serialize(),
            )
            .unwrap();

        payload.set(KEY_SELF_REG_PRIMARY_PATH, &primary_path);
        let node_path = self.paths.node(replica, shard);
        client
            .create_ephemeral(&node_path, &payload.serialize())
            .unwrap();

        WorkerHandle {
            client,
            node_path,
            primary_path,
            payload,
        }
    }

    /// Build a master's topology: current node on `shard` in replica 1, one
    /// collection fanning out over every shard.
    pub fn master_topology(&self, shard: ShardId, host: &str, shards: &[ShardId]) -> Topology {
        let current = CurrentNode {
            shard,
            replica: 1,
            host: host.to_string(),
            ba_port: 18080,
            data_port: 18121,
            master: MasterRole {
                enabled: true,
                name: format!("master-{}", shard),
                port: 18131,
            },
            worker: WorkerRole {
                enabled: true,
                port: 18151,
            },
        };
        Topology::new(self.cluster_name.clone(), current)
            .with_shards(shards.iter().copied())
            .add_collection(SERVICE, COLLECTION, shards.to_vec())
    }

    /// Construct a master and spawn its event loop.
    pub fn spawn_master(
        &self,
        topology: Topology,
        distributed: DistributedConfig,
    ) -> Arc<MasterController> {
        let client = Arc::new(CoordClient::connect(self.store.clone()));
        let controller = MasterController::new(client, topology, distributed);
        controller.clone().spawn_event_loop().unwrap();
        controller
    }
}

/// A fake worker's registrations; dropping the session kills them.
pub struct WorkerHandle {
    pub client: CoordClient,
    pub node_path: String,
    pub primary_path: String,
    payload: KvPayload,
}

impl WorkerHandle {
    /// Take the worker down: its ephemerals disappear, watchers fire.
    pub fn kill(self) {
        self.client.disconnect();
    }

    pub fn set_node_state(&mut self, state: NodeState) {
        self.payload.set(KEY_NODE_STATE, state.as_u32());
        self.write_back();
    }

    pub fn set_service_state(&mut self, state: &str) {
        self.payload.set(KEY_SERVICE_STATE, state);
        self.write_back();
    }

    pub fn set_busy_collection(&mut self, collection: &str) {
        self.payload.set(KEY_NODE_BUSY_STATE, collection);
        self.write_back();
    }

    fn write_back(&self) {
        self.client
            .set_data(&self.node_path, &self.payload.serialize())
            .unwrap();
        self.client
            .set_data(&self.primary_path, &self.payload.serialize())
            .unwrap();
    }
}

/// An aggregator that records what the binder hands it.
pub struct RecordingAggregator {
    service: String,
    collection: String,
    pub routing: Mutex<RoutingTable>,
    pub busy: Mutex<Vec<WorkerEndpoint>>,
}

impl RecordingAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            service: SERVICE.to_string(),
            collection: COLLECTION.to_string(),
            routing: Mutex::new(RoutingTable::default()),
            busy: Mutex::new(Vec::new()),
        })
    }

    pub fn hosts(&self) -> Vec<String> {
        self.routing
            .lock()
            .workers
            .iter()
            .map(|worker| worker.host.clone())
            .collect()
    }
}

impl Aggregator for RecordingAggregator {
    fn service(&self) -> &str {
        &self.service
    }
    fn collection(&self) -> &str {
        &self.collection
    }
    fn set_routing(&self, table: RoutingTable) {
        *self.routing.lock() = table;
    }
    fn set_busy_workers(&self, busy: Vec<WorkerEndpoint>) {
        *self.busy.lock() = busy;
    }
}

/// Poll until `cond` holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
