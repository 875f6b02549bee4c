//! Master controller: the replica/worker detection state machine.
//!
//! The controller binds every shard to one live worker, chosen across
//! replicas, and keeps that binding current through coordination-store watches:
//! a deleted node znode triggers failover to another replica, its return
//! triggers recovery back to the preferred replica, and every detection pass
//! ends by rebuilding the aggregator routing tables that changed.
//!
//! All mutable state lives behind a single mutex; event callbacks and public
//! APIs lock at entry and pass `&mut ControllerState` down, so no internal
//! path ever re-locks. The coordination client is only ever invoked with
//! in-memory semantics here; `disconnect` is still called with the state lock
//! released, because a remote store's event dispatch must never be waited on
//! from under the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::binder::{Aggregator, AggregatorBinder};
use super::broker;
use super::node::{NodeState, ReplicaId, SearchNode, ServiceState, ShardId};
use super::registry::WorkerRegistry;
use super::topology::Topology;
use crate::config::DistributedConfig;
use crate::coordination::payload::{
    decode_id_list, service_collection_key, KEY_BA_PORT, KEY_HOST, KEY_MASTER_NAME,
    KEY_MASTER_PORT, KEY_NEW_SHARDING_NODEIDS, KEY_NODE_STATE, KEY_REPLICA_ID,
    KEY_SELF_REG_PRIMARY_PATH, KEY_SERVICE_NAMES, KEY_SERVICE_STATE, KEY_WORKER_PORT,
};
use crate::coordination::{
    ClusterPaths, CoordClient, CoordEvent, KvPayload, PathEvent, SessionEvent, Watch,
};
use crate::{Error, Result};

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// Created or stopped; nothing armed.
    Init,
    /// Coordination service unreachable; waiting for a session.
    WaitCoord,
    /// Session up, detection in progress.
    Starting,
    /// Some shard has no good worker yet; watches armed, waiting.
    StartingWaitWorkers,
    /// Every shard is bound to a good worker.
    Started,
}

impl std::fmt::Display for MasterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MasterState::Init => "INIT",
            MasterState::WaitCoord => "WAIT_COORD",
            MasterState::Starting => "STARTING",
            MasterState::StartingWaitWorkers => "STARTING_WAIT_WORKERS",
            MasterState::Started => "STARTED",
        };
        f.write_str(name)
    }
}

/// One request held in the broker's local cache.
#[derive(Debug, Clone)]
pub(crate) struct CachedWrite {
    pub path: String,
    pub data: String,
    pub req_type: String,
}

/// Everything guarded by the controller's state mutex.
pub(crate) struct ControllerState {
    pub master_state: MasterState,
    pub topology: Topology,
    pub registry: WorkerRegistry,
    pub replica_ids: Vec<ReplicaId>,
    pub server_real_path: String,
    pub binder: AggregatorBinder,
    pub stopping: bool,
    pub write_prepared: bool,
    pub new_write_disabled: bool,
    pub is_mine_primary: bool,
    pub ready_for_new_write: bool,
    pub waiting_requests: usize,
    pub cached_writes: VecDeque<CachedWrite>,
}

type RequestHandler = Arc<dyn Fn() -> bool + Send + Sync>;

/// The master control loop over one coordination session.
pub struct MasterController {
    client: Arc<CoordClient>,
    paths: ClusterPaths,
    distributed: DistributedConfig,
    state: Mutex<ControllerState>,
    request_handler: Mutex<Option<RequestHandler>>,
}

impl MasterController {
    pub fn new(
        client: Arc<CoordClient>,
        topology: Topology,
        distributed: DistributedConfig,
    ) -> Arc<Self> {
        let paths = ClusterPaths::new(&topology.cluster_name);
        Arc::new(Self {
            client,
            paths,
            distributed,
            state: Mutex::new(ControllerState {
                master_state: MasterState::Init,
                topology,
                registry: WorkerRegistry::new(),
                replica_ids: Vec::new(),
                server_real_path: String::new(),
                binder: AggregatorBinder::new(),
                stopping: false,
                write_prepared: false,
                new_write_disabled: false,
                is_mine_primary: false,
                ready_for_new_write: false,
                waiting_requests: 0,
                cached_writes: VecDeque::new(),
            }),
            request_handler: Mutex::new(None),
        })
    }

    /// Spawn the event dispatch loop. Call once, before [`start`].
    ///
    /// [`start`]: MasterController::start
    pub fn spawn_event_loop(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let mut events = self
            .client
            .take_events()
            .ok_or_else(|| Error::Internal("event receiver already taken".to_string()))?;
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event);
            }
            debug!("coordination event channel closed");
        }))
    }

    /// Enable the controller: detect replicas and workers, register the server
    /// znode. Suspends in `WAIT_COORD` when the store is unreachable.
    pub fn start(&self) {
        let mut st = self.state.lock();
        if st.master_state != MasterState::Init {
            info!("already starting");
            return;
        }
        if !self.client.is_connected() {
            st.master_state = MasterState::WaitCoord;
            error!("master waiting for coordination service");
            return;
        }
        st.master_state = MasterState::Starting;
        self.do_start(&mut st);
    }

    /// Disable the controller and release the server registration.
    pub fn stop(&self) {
        {
            let mut st = self.state.lock();
            st.stopping = true;
        }
        if self.client.is_connected() {
            let (server_real_path, server_parent) = {
                let st = self.state.lock();
                (st.server_real_path.clone(), self.paths.server_parent())
            };
            if !server_real_path.is_empty() {
                let _ = self.client.delete(&server_real_path);
            }
            if self
                .client
                .children_or_empty(&server_parent, Watch::None)
                .is_empty()
            {
                let _ = self.client.delete(&server_parent);
            }
            // disconnect waits on the store's dispatch side, never under the lock
            self.client.disconnect();
        }
        let mut st = self.state.lock();
        st.master_state = MasterState::Init;
        st.waiting_requests = 0;
    }

    pub fn master_state(&self) -> MasterState {
        self.state.lock().master_state
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    pub fn current_shard(&self) -> ShardId {
        self.state.lock().topology.current.shard
    }

    /// The ephemeral-sequential path this master registered under `Servers`.
    pub fn server_real_path(&self) -> String {
        self.state.lock().server_real_path.clone()
    }

    pub fn is_mine_primary(&self) -> bool {
        let st = self.state.lock();
        self.is_mine_primary_locked(&st)
    }

    pub fn has_cached_requests(&self) -> bool {
        let st = self.state.lock();
        st.is_mine_primary && !st.cached_writes.is_empty()
    }

    /// Host and data port of the worker currently bound to a shard.
    pub fn shard_receiver(&self, shard: ShardId) -> Option<(String, u16)> {
        let st = self.state.lock();
        let node = st.registry.worker(shard)?;
        Some((node.host.clone(), node.data_port?))
    }

    /// Register an aggregator and bind its routing table immediately.
    pub fn register_aggregator(&self, aggregator: Arc<dyn Aggregator>, read_only: bool) {
        let mut st = self.state.lock();
        st.binder.register(aggregator, read_only);
        if read_only {
            self.rebind_read_only(&mut st);
        } else {
            self.rebind_primary(&mut st);
        }
    }

    /// Inject the broker's new-request handler.
    pub fn set_request_handler(&self, handler: impl Fn() -> bool + Send + Sync + 'static) {
        *self.request_handler.lock() = Some(Arc::new(handler));
    }

    /// Replace the topology snapshot; a changed shard set forces re-detection.
    pub fn update_topology(&self, topology: Topology) {
        let mut st = self.state.lock();
        info!("topology changed");
        let shard_changed = topology.all_shards != st.topology.all_shards;
        st.topology = topology;

        if !self.client.is_connected() {
            return;
        }
        if matches!(
            st.master_state,
            MasterState::StartingWaitWorkers | MasterState::Started
        ) {
            if st.stopping {
                return;
            }
            if shard_changed {
                self.detect_workers(&mut st);
            }
        }

        let server_real_path = st.server_real_path.clone();
        match self.client.get_payload(&server_real_path, Watch::Set) {
            Ok(mut payload) if !payload.is_empty() => {
                self.set_services_payload(&st, &mut payload);
                let _ = self.client.set_data(&server_real_path, &payload.serialize());
            }
            _ => warn!("get old server service data error"),
        }
        self.rebind_primary(&mut st);
    }

    /// Called by the node-side manager when this master's primary status flips.
    pub fn notify_changed_primary(&self, is_primary: bool) {
        let mut st = self.state.lock();
        if !is_primary {
            // release any prepare lock held from before the flip
            broker::end_write(self, &mut st);
        }
        st.is_mine_primary = is_primary;
        info!("mine primary master state changed: {}", is_primary);
        if is_primary
            && matches!(
                st.master_state,
                MasterState::Started | MasterState::StartingWaitWorkers
            )
        {
            if st.stopping {
                return;
            }
            // the primary view only routes to primary workers, re-detect
            self.detect_workers(&mut st);
            let prepare = self.paths.write_prepare_node(st.topology.current.shard);
            self.client.exists(&prepare, Watch::Set);
            if st.cached_writes.is_empty() {
                broker::cache_refill(self, &mut st);
            }
        }
    }

    /// Caller-supplied readiness: all primary workers of this shard started.
    pub fn update_ready_for_new_write(&self, ready: bool) {
        let fire = {
            let mut st = self.state.lock();
            st.ready_for_new_write = ready;
            if ready && self.is_mine_primary_locked(&st) && !st.stopping {
                broker::check_for_write(self, &mut st)
            } else {
                false
            }
        };
        if fire {
            self.run_request_handler();
        }
    }

    /// Recompute and publish the advertised service-readiness state.
    pub fn update_service_read_state(&self, desired: ServiceState, include_self: bool) {
        let mut st = self.state.lock();
        self.update_read_state_locked(&mut st, desired, include_self);
    }

    /// Advertise an in-flight index rebuild on the server and node znodes.
    pub fn register_index_status(&self, collection: &str, indexing: bool) {
        let status = if indexing { "indexing" } else { "notindexing" };
        let (server_real_path, node_path) = {
            let st = self.state.lock();
            (
                st.server_real_path.clone(),
                self.paths
                    .node(st.topology.current.replica, st.topology.current.shard),
            )
        };
        if let Ok(mut payload) = self.client.get_payload(&server_real_path, Watch::None) {
            payload.set(collection, status);
            let _ = self.client.set_data(&server_real_path, &payload.serialize());
        }
        if let Ok(mut payload) = self.client.get_payload(&node_path, Watch::Set) {
            payload.set(collection, status);
            let _ = self.client.set_data(&node_path, &payload.serialize());
        }
    }

    /// Find the address of a master serving `service`, scanning server znodes.
    pub fn find_service_master(&self, service: &str) -> Option<(String, u16)> {
        if !self.client.is_connected() {
            return None;
        }
        for child in self
            .client
            .children_or_empty(&self.paths.server_parent(), Watch::None)
        {
            let Ok(payload) = self.client.get_payload(&child, Watch::None) else {
                continue;
            };
            if !payload.get_str(KEY_SERVICE_NAMES).contains(service) {
                continue;
            }
            if let Ok(port) = payload.get_port(KEY_MASTER_PORT) {
                info!(
                    "found service master for {} on server {}",
                    service, child
                );
                return Some((payload.get_str(KEY_HOST).to_string(), port));
            }
        }
        None
    }

    /// Host of a shard's current primary worker, from its registration.
    pub fn shard_primary_host(&self, shard: ShardId) -> Option<String> {
        let children = self
            .client
            .children_or_empty(&self.paths.primary_node_parent(shard), Watch::None);
        let first = children.first()?;
        let payload = self.client.get_payload(first, Watch::Set).ok()?;
        Some(payload.get_str(KEY_HOST).to_string())
    }

    /// A busy master is holding a prepare lock or waiting on a worker.
    pub fn is_busy(&self) -> bool {
        if !self.distributed.enabled {
            return false;
        }
        let st = self.state.lock();
        if st.stopping || !self.client.is_connected() {
            return true;
        }
        let prepare = self.paths.write_prepare_node(st.topology.current.shard);
        if self.client.exists(&prepare, Watch::None) {
            info!("master is busy: another write request is running");
            return true;
        }
        !self.all_workers_in_state(&st, true, NodeState::Started)
    }

    // ---- shared-state access for the broker and migration components ----

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock()
    }

    pub(crate) fn client(&self) -> &CoordClient {
        &self.client
    }

    pub(crate) fn paths(&self) -> &ClusterPaths {
        &self.paths
    }

    pub(crate) fn distributed(&self) -> &DistributedConfig {
        &self.distributed
    }

    pub(crate) fn is_mine_primary_locked(&self, st: &ControllerState) -> bool {
        if !self.distributed.enabled {
            return true;
        }
        if !self.client.is_connected() {
            return false;
        }
        st.is_mine_primary
    }

    /// Every listed shard's bound worker is good (the current shard's own
    /// worker is the caller's responsibility and skipped here).
    pub(crate) fn all_shard_workers_good(&self, st: &ControllerState, shards: &[ShardId]) -> bool {
        if !self.client.is_connected() {
            return false;
        }
        for shard in shards {
            if *shard == st.topology.current.shard {
                continue;
            }
            match st.registry.worker(*shard) {
                None => info!("shard {} not found while checking workers", shard),
                Some(node) if !node.is_good => {
                    info!("shard {} not ready", shard);
                    return false;
                }
                Some(_) => {}
            }
        }
        true
    }

    pub(crate) fn all_workers_in_state(
        &self,
        st: &ControllerState,
        include_self: bool,
        target: NodeState,
    ) -> bool {
        for node in st.registry.workers() {
            if !include_self && node.shard == st.topology.current.shard {
                continue;
            }
            let node_path = self.paths.node(node.replica, node.shard);
            match self.node_state_at(&node_path) {
                Some(state) if state != target => {
                    info!("worker not in state {:?}: {}", target, node_path);
                    return false;
                }
                Some(_) => {}
                // an unreadable advertisement does not block the sweep
                None => debug!("node state unavailable: {}", node_path),
            }
        }
        true
    }

    /// Read a node's advertised lifecycle state, re-arming the data watch.
    pub(crate) fn node_state_at(&self, node_path: &str) -> Option<NodeState> {
        let payload = self.client.get_payload(node_path, Watch::Set).ok()?;
        let raw = payload.get_u32(KEY_NODE_STATE).ok()?;
        NodeState::from_u32(raw)
    }

    /// Invoke the injected new-request handler, outside the state lock.
    ///
    /// Re-entrancy contract: the handler may call broker APIs freely; it must
    /// not block on work that itself waits for controller events.
    pub(crate) fn run_request_handler(&self) {
        let handler = self.request_handler.lock().clone();
        let Some(handler) = handler else {
            error!("the new request handler not set");
            return;
        };
        if handler() {
            info!("all new write requests have been delivered");
            return;
        }
        error!("the write request handler returned failure");
        let mut st = self.state.lock();
        st.write_prepared = false;
        broker::end_write(self, &mut st);
        let queue_parent = self.paths.write_queue_parent(st.topology.current.shard);
        let _ = self.client.get_children(&queue_parent, Watch::Set);
    }

    // ---- event handling ----

    fn handle_event(&self, event: CoordEvent) {
        {
            let st = self.state.lock();
            info!("master {}, event {}", st.master_state, event);
        }
        match event {
            CoordEvent::Session(SessionEvent::Connected) => self.on_connected(),
            CoordEvent::Session(SessionEvent::Expired) => self.on_expired(),
            CoordEvent::Path { event, path } => match event {
                PathEvent::Created => self.on_created(&path),
                PathEvent::Deleted => self.on_deleted(&path),
                PathEvent::DataChanged => self.on_data_changed(&path),
                PathEvent::ChildrenChanged => self.on_children_changed(&path),
            },
        }
    }

    fn on_connected(&self) {
        let fire = {
            let mut st = self.state.lock();
            if st.stopping {
                return;
            }
            match st.master_state {
                MasterState::WaitCoord => {
                    st.master_state = MasterState::Starting;
                    self.do_start(&mut st);
                    false
                }
                MasterState::Init | MasterState::Starting => false,
                _ => {
                    info!("auto-reconnect in master {}", st.server_real_path);
                    if !self.client.exists(&st.server_real_path, Watch::Set) {
                        // the store may have re-created the ephemeral for us
                        let recreated = self.find_recreated_server_path(&st);
                        if recreated.is_empty() {
                            info!("server path disconnected, waiting reconnect");
                            return;
                        }
                        info!("server path reconnected after auto-reconnect: {}", recreated);
                        st.server_real_path = recreated;
                    }
                    self.watch_all(&mut st);
                    self.update_read_state_locked(&mut st, ServiceState::ReadyForRead, true);
                    broker::check_for_write(self, &mut st)
                }
            }
        };
        if fire {
            self.run_request_handler();
        }
    }

    fn on_expired(&self) {
        {
            let mut st = self.state.lock();
            if st.stopping {
                return;
            }
            warn!("master session expired, reconnecting");
            st.stopping = true;
        }
        // fresh session; must happen with the state lock released
        self.client.reconnect();

        let fire = {
            let mut st = self.state.lock();
            st.stopping = false;
            st.master_state = MasterState::Starting;
            self.do_start(&mut st);
            warn!("master restarted after session expiry");
            self.update_read_state_locked(&mut st, ServiceState::ReadyForRead, true);
            broker::check_for_write(self, &mut st)
        };
        if fire {
            self.run_request_handler();
        }
    }

    fn on_created(&self, path: &str) {
        let mut st = self.state.lock();
        if st.stopping {
            return;
        }
        if !self.paths.in_topology(path) {
            debug!("created path not cared: {}", path);
            return;
        }
        match st.master_state {
            MasterState::StartingWaitWorkers => {
                st.master_state = MasterState::Starting;
                self.detect_workers(&mut st);
            }
            MasterState::Started => self.recover_path(&mut st, path),
            _ => {}
        }
        self.update_read_state_locked(&mut st, ServiceState::ReadyForRead, true);
    }

    fn on_deleted(&self, path: &str) {
        let fire = {
            let mut st = self.state.lock();
            if st.stopping {
                return;
            }
            if matches!(
                st.master_state,
                MasterState::Started | MasterState::StartingWaitWorkers
            ) && self.paths.in_topology(path)
            {
                self.failover_path(&mut st, path);
                // watch the dead path so its return can trigger recovery
                self.client.exists(path, Watch::Set);
                self.update_read_state_locked(&mut st, ServiceState::ReadyForRead, true);
            }
            broker::check_for_write(self, &mut st)
        };
        if fire {
            self.run_request_handler();
        }
    }

    fn on_children_changed(&self, path: &str) {
        let fire = {
            let mut st = self.state.lock();
            if st.stopping {
                return;
            }
            if matches!(
                st.master_state,
                MasterState::StartingWaitWorkers | MasterState::Started
            ) && self.paths.in_topology(path)
            {
                let _ = self.client.get_data(path, Watch::Set);
                self.detect_replica_set(&mut st);

                let current_replica = st.topology.current.replica;
                let shards: Vec<ShardId> = st.topology.all_shards.iter().copied().collect();
                for shard in shards {
                    let node_path = self.paths.node(current_replica, shard);
                    if node_path.starts_with(path) {
                        self.recover_path(&mut st, &node_path);
                    }
                }
                self.update_read_state_locked(&mut st, ServiceState::ReadyForRead, true);
            }
            broker::check_for_write(self, &mut st)
        };
        if fire {
            self.run_request_handler();
        }
    }

    fn on_data_changed(&self, path: &str) {
        let fire = {
            let mut st = self.state.lock();
            if st.stopping {
                return;
            }
            let cared = self.paths.in_topology(path);
            if st.master_state == MasterState::StartingWaitWorkers {
                if cared {
                    st.master_state = MasterState::Starting;
                    self.detect_workers(&mut st);
                }
            } else if cared {
                self.recover_path(&mut st, path);
            }
            if cared {
                self.client.exists(path, Watch::Set);
                self.update_read_state_locked(&mut st, ServiceState::ReadyForRead, true);
            }
            broker::check_for_write(self, &mut st)
        };
        if fire {
            self.run_request_handler();
        }
    }

    // ---- startup and registration ----

    fn do_start(&self, st: &mut ControllerState) {
        st.stopping = false;
        self.detect_replica_set(st);
        self.detect_workers(st);
        // every master doubles as a search server, register before all
        // workers are necessarily up
        self.register_server(st);
        info!(
            "distributed node started: cluster {}, shard {}, replica {}",
            st.topology.cluster_name, st.topology.current.shard, st.topology.current.replica
        );
    }

    fn register_server(&self, st: &mut ControllerState) {
        if let Err(err) = self.client.ensure_path(self.paths.root()) {
            error!("failed to create cluster root: {}", err);
            return;
        }
        let _ = self.client.ensure_path(&self.paths.server_parent());

        let mut payload = KvPayload::new();
        payload.set(KEY_HOST, &st.topology.current.host);
        payload.set(KEY_BA_PORT, st.topology.current.ba_port);
        self.set_services_payload(st, &mut payload);

        match self
            .client
            .create_ephemeral_sequential(&self.paths.server(), &payload.serialize())
        {
            Ok(real_path) => {
                info!("self server registered: {}", real_path);
                st.server_real_path = real_path;
            }
            Err(err) => error!("failed to register server znode: {}", err),
        }

        let queue_root = self.paths.write_queue_root();
        if !self.client.exists(&queue_root, Watch::Set) {
            let _ = self.client.ensure_path(&queue_root);
        }
        let queue_parent = self.paths.write_queue_parent(st.topology.current.shard);
        if !self.client.exists(&queue_parent, Watch::Set) {
            let _ = self.client.ensure_path(&queue_parent);
        }
        let prepare_parent = self.paths.write_prepare_parent();
        if !self.client.exists(&prepare_parent, Watch::Set) {
            let _ = self.client.ensure_path(&prepare_parent);
        }
        let _ = self.client.get_children(&queue_parent, Watch::Set);
    }

    fn find_recreated_server_path(&self, st: &ControllerState) -> String {
        for child in self
            .client
            .children_or_empty(&self.paths.server_parent(), Watch::None)
        {
            let Ok(payload) = self.client.get_payload(&child, Watch::None) else {
                continue;
            };
            if payload.get_str(KEY_HOST) == st.topology.current.host {
                info!("found server real path for current: {}", child);
                self.client.exists(&child, Watch::Set);
                return child;
            }
        }
        String::new()
    }

    fn watch_all(&self, st: &mut ControllerState) {
        let replicas = self
            .client
            .children_or_empty(&self.paths.topology(), Watch::Set);
        for replica_path in &replicas {
            let _ = self.client.get_children(replica_path, Watch::Set);
        }
        let current_replica = st.topology.current.replica;
        for shard in st.topology.all_shards.iter().copied() {
            self.client
                .exists(&self.paths.node(current_replica, shard), Watch::Set);
        }
        if self.is_mine_primary_locked(st) {
            let shard = st.topology.current.shard;
            self.client
                .exists(&self.paths.write_prepare_node(shard), Watch::Set);
            self.client
                .exists(&self.paths.write_queue_parent(shard), Watch::Set);
        }
    }

    // ---- detection ----

    fn detect_replica_set(&self, st: &mut ControllerState) {
        let children = self
            .client
            .children_or_empty(&self.paths.topology(), Watch::Set);

        st.replica_ids.clear();
        for replica_path in &children {
            match self.client.get_data(replica_path, Watch::None) {
                Ok(data) => {
                    let raw = String::from_utf8_lossy(&data);
                    match raw.trim().parse::<ReplicaId>() {
                        Ok(id) => {
                            st.replica_ids.push(id);
                            info!("detected replica id {} for {}", id, replica_path);
                        }
                        Err(_) => {
                            error!("failed to parse replica id {:?} for {}", raw, replica_path)
                        }
                    }
                }
                Err(err) => warn!("read replica znode {} failed: {}", replica_path, err),
            }
            let _ = self.client.get_children(replica_path, Watch::Set);
            self.client.exists(replica_path, Watch::Set);
        }

        if st.master_state == MasterState::StartingWaitWorkers {
            self.detect_workers(st);
        } else {
            self.detect_read_only_all(st);
        }

        let bad_shards: Vec<ShardId> = st
            .registry
            .workers()
            .filter(|node| !node.is_good)
            .map(|node| node.shard)
            .collect();
        let mut need_rebind = false;
        for shard in bad_shards {
            if !self.failover_node_slot(st, shard) {
                warn!("a worker failed and no replica can cover it");
                st.master_state = MasterState::StartingWaitWorkers;
            }
            need_rebind = true;
        }
        if need_rebind {
            self.rebind_primary(st);
        }
    }

    fn detect_workers(&self, st: &mut ControllerState) {
        let old_workers = st.registry.take_workers();
        let current_replica = st.topology.current.replica;
        let mut detected = 0usize;
        self.detect_workers_in_replica(st, current_replica, &mut detected);

        let replicas = st.replica_ids.clone();
        for replica in replicas {
            if st.master_state != MasterState::StartingWaitWorkers {
                info!("detected workers enough, stop detecting other replicas");
                break;
            }
            if replica == current_replica {
                continue;
            }
            info!("begin detect workers in other replica: {}", replica);
            self.detect_workers_in_replica(st, replica, &mut detected);
        }

        if !st.registry.workers_match(&old_workers) {
            self.rebind_primary(st);
        }
        self.detect_read_only_all(st);
    }

    fn detect_workers_in_replica(
        &self,
        st: &mut ControllerState,
        replica: ReplicaId,
        detected: &mut usize,
    ) {
        let mine_primary = self.is_mine_primary_locked(st);
        if mine_primary {
            info!("I am primary master");
        }
        let shards: Vec<ShardId> = st.topology.all_shards.iter().copied().collect();
        for shard in shards {
            let node_path = self.paths.node(replica, shard);
            match self.client.get_payload(&node_path, Watch::Set) {
                Ok(payload) if payload.has_key(KEY_WORKER_PORT) => {
                    if mine_primary && !self.is_primary_worker(replica, shard) {
                        info!(
                            "primary master ignores non-primary worker, node {} replica {}",
                            shard, replica
                        );
                        continue;
                    }
                    if st.registry.worker(shard).is_some_and(|node| node.is_good) {
                        continue;
                    }
                    let node = SearchNode::from_payload(shard, replica, &payload);
                    info!(
                        "detected worker on node {}: {}:{:?}",
                        shard, node.host, node.worker_port
                    );
                    st.registry.insert_worker(node);
                    *detected += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    // arm a watch so the node's arrival restarts detection
                    self.client.exists(&node_path, Watch::Set);
                }
            }
        }

        let total = st.topology.all_shards.len();
        if *detected >= total {
            st.master_state = MasterState::Started;
            info!("detected all {} workers", total);
        } else {
            st.master_state = MasterState::StartingWaitWorkers;
            info!("detected {} workers of {}", detected, total);
        }
    }

    fn detect_read_only_all(&self, st: &mut ControllerState) {
        let old = st.registry.take_read_only();
        let replicas = st.replica_ids.clone();
        for replica in replicas {
            debug!("detecting read only workers in replica {}", replica);
            self.detect_read_only_in_replica(st, replica);
        }
        if !st.registry.read_only_match(&old) {
            self.rebind_read_only(st);
        } else {
            st.binder.refresh_busy(&st.registry);
            debug!("read only workers unchanged");
        }
    }

    fn detect_read_only_in_replica(&self, st: &mut ControllerState, replica: ReplicaId) {
        let shards: Vec<ShardId> = st.topology.all_shards.iter().copied().collect();
        for shard in shards {
            let node_path = self.paths.node(replica, shard);
            match self.client.get_payload(&node_path, Watch::Set) {
                Ok(payload) if payload.has_key(KEY_WORKER_PORT) => {
                    st.registry
                        .insert_read_only(SearchNode::from_payload(shard, replica, &payload));
                }
                Ok(_) => {}
                Err(_) => {
                    self.client.exists(&node_path, Watch::Set);
                }
            }
        }
    }

    /// Update the read-only view for one node path (`created` false on loss).
    fn detect_read_only_at(&self, st: &mut ControllerState, path: &str, created: bool) {
        let mut located = None;
        for shard in st.topology.all_shards.iter().copied() {
            for replica in &st.replica_ids {
                if self.paths.node(*replica, shard) == path {
                    located = Some((shard, *replica));
                }
            }
        }
        let Some((shard, replica)) = located else {
            debug!("not a cared read only node: {}", path);
            return;
        };

        info!("update for read only node: {}", path);
        if !created {
            match st.registry.read_only_worker_mut(shard, replica) {
                Some(node) => node.is_good = false,
                None => {
                    info!("failed node is not in the read only list");
                    return;
                }
            }
        } else {
            let payload = match self.client.get_payload(path, Watch::Set) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("read read-only node data failed: {}", err);
                    return;
                }
            };
            if !payload.has_key(KEY_WORKER_PORT) {
                error!("the node has no worker port: {}", path);
                return;
            }
            st.registry
                .insert_read_only(SearchNode::from_payload(shard, replica, &payload));
        }
        self.rebind_read_only(st);
    }

    // ---- failover and recovery ----

    fn failover_path(&self, st: &mut ControllerState, path: &str) {
        self.detect_read_only_at(st, path, false);

        let target = st
            .registry
            .workers()
            .find(|node| self.paths.node(node.replica, node.shard) == path)
            .map(|node| (node.shard, node.replica, node.host.clone()));
        let Some((shard, replica, host)) = target else {
            info!("failed node is not in my watching workers: {}", path);
            return;
        };

        warn!(
            "node {} @{} broke down in replica {}",
            shard, host, replica
        );
        if self.failover_node_slot(st, shard) {
            info!("failover finished");
        } else {
            info!("failover failed to cover this failure");
            st.master_state = MasterState::StartingWaitWorkers;
        }
        self.rebind_primary(st);
    }

    /// Rebind a shard slot to another replica; true when a good node is bound.
    fn failover_node_slot(&self, st: &mut ControllerState, shard: ShardId) -> bool {
        if let Some(node) = st.registry.worker_mut(shard) {
            node.is_good = false;
        }
        let from_replica = st.registry.worker(shard).map(|node| node.replica);
        let mine_primary = self.is_mine_primary_locked(st);
        if mine_primary {
            info!("I am primary master");
        }

        let replicas = st.replica_ids.clone();
        for replica in replicas {
            if Some(replica) == from_replica {
                continue;
            }
            let node_path = self.paths.node(replica, shard);
            let Ok(payload) = self.client.get_payload(&node_path, Watch::Set) else {
                continue;
            };
            if mine_primary && !self.is_primary_worker(replica, shard) {
                info!(
                    "primary master ignores non-primary worker, node {} replica {}",
                    shard, replica
                );
                continue;
            }
            if !payload.has_key(KEY_WORKER_PORT) {
                // nodes with one id must carry the same capabilities everywhere
                error!(
                    "replica {} node {} has no worker server, mismatched configuration",
                    replica, shard
                );
                continue;
            }
            let candidate = SearchNode::from_payload(shard, replica, &payload);
            if !candidate.is_good {
                continue;
            }
            info!(
                "switching node {} from replica {:?} to {}",
                shard, from_replica, replica
            );
            st.registry.insert_worker(candidate);
            break;
        }

        // watch the preferred replica so its return triggers recovery
        let current_replica = st.topology.current.replica;
        self.client
            .exists(&self.paths.node(current_replica, shard), Watch::Set);

        st.registry.worker(shard).map(|n| n.is_good).unwrap_or(false)
    }

    /// Switch a slot back to the preferred replica when its node returns.
    fn recover_path(&self, st: &mut ControllerState, path: &str) {
        let mine_primary = self.is_mine_primary_locked(st);
        let current_replica = st.topology.current.replica;
        let mut need_rebind = false;

        let shards: Vec<ShardId> = st.registry.workers().map(|node| node.shard).collect();
        for shard in shards {
            if self.paths.node(current_replica, shard) != path {
                continue;
            }
            if mine_primary && !self.is_primary_worker(current_replica, shard) {
                info!(
                    "primary master ignores non-primary worker while recovering, node {}",
                    shard
                );
                continue;
            }
            let bound = st
                .registry
                .worker(shard)
                .map(|node| (node.replica, node.is_good));
            if bound == Some((current_replica, true)) {
                break;
            }
            info!(
                "recover: node {} back in current replica {}",
                shard, current_replica
            );
            match self.client.get_payload(path, Watch::Set) {
                Ok(payload) if payload.has_key(KEY_WORKER_PORT) => {
                    let candidate = SearchNode::from_payload(shard, current_replica, &payload);
                    if !candidate.is_good {
                        // a bad advertisement leaves the current binding alone
                        continue;
                    }
                    st.registry.insert_worker(candidate);
                    need_rebind = true;
                    break;
                }
                _ => continue,
            }
        }

        if need_rebind {
            self.rebind_primary(st);
        }
        self.detect_read_only_at(st, path, true);
    }

    /// The shard's primary worker is the first-registered primary candidate.
    fn is_primary_worker(&self, replica: ReplicaId, shard: ShardId) -> bool {
        let node_path = self.paths.node(replica, shard);
        let Ok(payload) = self.client.get_payload(&node_path, Watch::Set) else {
            return false;
        };
        let self_registered = payload.get_str(KEY_SELF_REG_PRIMARY_PATH);
        let candidates = self
            .client
            .children_or_empty(&self.paths.primary_node_parent(shard), Watch::None);
        match candidates.first() {
            Some(first) => self_registered == first,
            None => {
                info!("no primary node registered for shard {}", shard);
                false
            }
        }
    }

    // ---- service state publication ----

    fn is_mine_new_sharding(&self, st: &ControllerState) -> bool {
        match self
            .client
            .get_payload(&self.paths.migrate_prepare(), Watch::Set)
        {
            Ok(payload) => {
                match decode_id_list(payload.get_str(KEY_NEW_SHARDING_NODEIDS)) {
                    Ok(ids) => st.topology.is_mine_new_sharding(&ids),
                    Err(err) => {
                        warn!("invalid new sharding id list: {}", err);
                        false
                    }
                }
            }
            Err(_) => false,
        }
    }

    fn set_services_payload(&self, st: &ControllerState, payload: &mut KvPayload) {
        let state = if self.is_mine_new_sharding(st) {
            info!("I am the new sharding node waiting migrate");
            ServiceState::BusyForSelf
        } else {
            ServiceState::ReadyForRead
        };
        payload.set(KEY_REPLICA_ID, st.topology.current.replica);
        payload.set(KEY_SERVICE_STATE, state.as_str());

        if st.topology.current.master.enabled {
            let services: Vec<&str> = st.topology.service_names().collect();
            if !services.is_empty() {
                payload.set(KEY_SERVICE_NAMES, services.join(","));
                for service in &services {
                    let collections = st
                        .topology
                        .collections_for(service)
                        .iter()
                        .map(|route| route.name.as_str())
                        .collect::<Vec<_>>()
                        .join(",");
                    payload.set(&service_collection_key(service), collections);
                }
                payload.set(KEY_MASTER_PORT, st.topology.current.master.port);
                payload.set(KEY_MASTER_NAME, &st.topology.current.master.name);
            }
        }
    }

    fn update_read_state_locked(
        &self,
        st: &mut ControllerState,
        desired: ServiceState,
        include_self: bool,
    ) {
        // readable means every shard worker this master fans out to is readable
        if !matches!(
            st.master_state,
            MasterState::Started | MasterState::StartingWaitWorkers
        ) || st.stopping
        {
            return;
        }
        let server_real_path = st.server_real_path.clone();
        if server_real_path.is_empty() {
            return;
        }
        let mut payload = match self.client.get_payload(&server_real_path, Watch::Set) {
            Ok(payload) if !payload.is_empty() => payload,
            _ => {
                info!("get server service data error");
                return;
            }
        };

        let mut new_state = if self.is_mine_new_sharding(st) {
            info!("I am the new sharding node waiting migrate");
            ServiceState::BusyForSelf
        } else {
            desired
        };
        let old_state = payload.get_str(KEY_SERVICE_STATE).to_string();

        if new_state.serves_reads() {
            let mut all_ready = true;
            let current_shard = st.topology.current.shard;
            let workers: Vec<(ShardId, ReplicaId)> = st
                .registry
                .workers()
                .map(|node| (node.shard, node.replica))
                .collect();
            for (shard, replica) in workers {
                if shard == current_shard && !include_self {
                    continue;
                }
                let node_path = self.paths.node(replica, shard);
                match self.client.get_payload(&node_path, Watch::Set) {
                    Ok(node_payload) => {
                        let advertised =
                            ServiceState::parse(node_payload.get_str(KEY_SERVICE_STATE));
                        if !advertised.is_some_and(ServiceState::serves_reads) {
                            info!("one shard is not ready for read: {}", node_path);
                            all_ready = false;
                            new_state = if shard == current_shard {
                                ServiceState::BusyForSelf
                            } else {
                                ServiceState::BusyForShard
                            };
                            break;
                        }
                    }
                    Err(_) => {
                        info!("get node data failed: {}", node_path);
                        if shard == current_shard {
                            all_ready = false;
                            new_state = ServiceState::BusyForSelf;
                            break;
                        }
                    }
                }
            }
            if all_ready {
                new_state = ServiceState::ReadyForRead;
            }
        }

        if old_state == new_state.as_str() {
            return;
        }
        payload.set(KEY_HOST, &st.topology.current.host);
        payload.set(KEY_BA_PORT, st.topology.current.ba_port);
        self.set_services_payload(st, &mut payload);
        payload.set(KEY_SERVICE_STATE, new_state.as_str());
        info!(
            "master service state changed: {} to {}",
            old_state, new_state
        );
        let _ = self.client.set_data(&server_real_path, &payload.serialize());
    }

    // ---- aggregator rebinds ----

    fn rebind_primary(&self, st: &mut ControllerState) {
        st.binder.rebind_primary(&st.topology, &st.registry);
    }

    fn rebind_read_only(&self, st: &mut ControllerState) {
        st.binder.rebind_read_only(&st.topology, &st.registry);
    }
}
