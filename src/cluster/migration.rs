//! Resharding/migration handshake.
//!
//! One primary master drives a migration: it takes the cluster-wide
//! migration-prepare ephemeral (refusing if another migration holds it),
//! advertises the new shard ids through the marker's payload so those nodes
//! report themselves busy, then polls until the cluster is quiescent and the
//! new nodes have drained their indexing queues. While the marker exists the
//! write broker refuses new cluster writes, which is the whole interlock.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::controller::MasterController;
use super::node::{NodeState, ShardId};
use crate::coordination::payload::{encode_id_list, KEY_NEW_SHARDING_NODEIDS, KEY_NODE_STATE};
use crate::coordination::{KvPayload, Watch};
use crate::CoordError;

/// Drives the migration protocol against the shared controller state.
pub struct MigrationCoordinator {
    controller: Arc<MasterController>,
    /// Poll period while waiting for readiness/quiescence.
    ready_poll: Duration,
    /// Poll period while waiting for the indexing drain.
    indexing_poll: Duration,
}

impl MigrationCoordinator {
    pub fn new(controller: Arc<MasterController>) -> Self {
        Self {
            controller,
            ready_poll: Duration::from_secs(30),
            indexing_poll: Duration::from_secs(10),
        }
    }

    /// Override the poll periods (tests drive the handshake in milliseconds).
    pub fn with_poll_intervals(mut self, ready: Duration, indexing: Duration) -> Self {
        self.ready_poll = ready;
        self.indexing_poll = indexing;
        self
    }

    /// Begin a migration: verify the cluster is idle and take the marker.
    ///
    /// Returns false when this master is not primary, any listed shard is not
    /// started, a write is prepared or queued, or another migration holds the
    /// marker.
    pub fn begin_migrate(&self, shard_ids: &[ShardId]) -> bool {
        let ctl = &self.controller;
        {
            let st = ctl.lock_state();
            if !ctl.is_mine_primary_locked(&st) {
                info!("not primary master while beginning migrate");
                return false;
            }
            if !ctl.all_shard_workers_good(&st, shard_ids) {
                return false;
            }
            if st.write_prepared {
                info!("a prepared write is still waiting on its worker");
                return false;
            }
            let prepare = ctl.paths().write_prepare_node(st.topology.current.shard);
            if ctl.client().exists(&prepare, Watch::Set) {
                info!("begin migrate failed: a write is running");
                return false;
            }
        }
        if !self.write_queues_empty(shard_ids) {
            return false;
        }

        let marker = ctl.paths().migrate_prepare();
        match ctl
            .client()
            .create_ephemeral(&marker, &KvPayload::new().serialize())
        {
            Ok(()) => true,
            Err(err) => {
                if err.is_already_exists() {
                    info!("another migration is already running");
                } else {
                    warn!("failed to create migration marker: {}", err);
                }
                ctl.client().exists(&marker, Watch::Set);
                false
            }
        }
    }

    /// Advertise the new shard ids and poll until every one is up.
    ///
    /// Nodes named in the marker payload publish themselves busy-for-self and
    /// drop out of read fan-out until the migration ends.
    pub async fn wait_for_new_sharding_nodes(&self, shard_ids: &[ShardId]) -> bool {
        let ctl = &self.controller;
        let marker = ctl.paths().migrate_prepare();
        loop {
            let mut payload = match ctl.client().get_payload(&marker, Watch::Set) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("get migration marker data error: {}", err);
                    KvPayload::new()
                }
            };
            let ids = encode_id_list(shard_ids);
            info!("setting new sharding node id list: {}", ids);
            payload.set(KEY_NEW_SHARDING_NODEIDS, &ids);
            let _ = ctl.client().set_data(&marker, &payload.serialize());

            info!("waiting for new sharding nodes to start up");
            tokio::time::sleep(self.ready_poll).await;
            if ctl.is_stopping() {
                return false;
            }
            if !self.sharding_nodes_ok(shard_ids) {
                continue;
            }
            return true;
        }
    }

    /// Poll until the listed shards are started and their queues are empty.
    pub async fn wait_for_migrate_ready(&self, shard_ids: &[ShardId]) -> bool {
        loop {
            info!("waiting for ready to migrate");
            tokio::time::sleep(self.ready_poll).await;
            if self.controller.is_stopping() {
                return false;
            }
            if !self.write_queues_empty(shard_ids) {
                continue;
            }
            if !self.sharding_nodes_ok(shard_ids) {
                continue;
            }
            return true;
        }
    }

    /// Poll until the new nodes have drained their indexing backlog.
    pub async fn wait_for_migrate_indexing(&self, shard_ids: &[ShardId]) -> bool {
        loop {
            info!("waiting for new sharding nodes to finish indexing");
            tokio::time::sleep(self.indexing_poll).await;
            if self.controller.is_stopping() {
                return false;
            }
            if !self.write_queues_empty(shard_ids) {
                continue;
            }
            if !self.sharding_nodes_ok(shard_ids) {
                continue;
            }
            return true;
        }
    }

    /// End the migration, releasing the marker and the write interlock.
    pub fn end_migrate(&self) {
        let marker = self.controller.paths().migrate_prepare();
        match self.controller.client().delete(&marker) {
            Ok(()) => info!("migrate end"),
            Err(err) if matches!(err, crate::Error::Coord(CoordError::NoNode)) => {
                debug!("migration marker already gone")
            }
            Err(err) => warn!("failed to delete migration marker: {}", err),
        }
    }

    /// Every listed shard has a started primary worker and a queue parent.
    fn sharding_nodes_ok(&self, shard_ids: &[ShardId]) -> bool {
        let ctl = &self.controller;
        if !ctl.client().is_connected() {
            return false;
        }
        for shard in shard_ids {
            let parent = ctl.paths().primary_node_parent(*shard);
            let candidates = ctl.client().children_or_empty(&parent, Watch::None);
            let Some(first) = candidates.first() else {
                info!("no primary candidates under {}", parent);
                return false;
            };
            let started = ctl
                .client()
                .get_payload(first, Watch::Set)
                .ok()
                .and_then(|payload| payload.get_u32(KEY_NODE_STATE).ok())
                .and_then(NodeState::from_u32)
                == Some(NodeState::Started);
            if !started {
                return false;
            }
            if !ctl
                .client()
                .exists(&ctl.paths().write_queue_parent(*shard), Watch::Set)
            {
                return false;
            }
        }
        true
    }

    /// True when no listed shard has queued writes; re-arms the child watch on
    /// this master's own queue when it observes it empty.
    fn write_queues_empty(&self, shard_ids: &[ShardId]) -> bool {
        let ctl = &self.controller;
        let own_queue = ctl.paths().write_queue_parent(ctl.current_shard());
        for shard in shard_ids {
            let queue = ctl.paths().write_queue_parent(*shard);
            let children = ctl.client().children_or_empty(&queue, Watch::None);
            if children.is_empty() {
                if queue == own_queue {
                    let _ = ctl.client().get_children(&queue, Watch::Set);
                }
            } else {
                return false;
            }
        }
        true
    }
}
