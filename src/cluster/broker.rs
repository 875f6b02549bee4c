//! Write-request broker: serialized cluster-wide write admission.
//!
//! Writes from any master land as ephemeral-sequential znodes in the owning
//! shard's queue. Only the shard's primary master consumes them: it takes the
//! per-shard prepare lock (an ephemeral znode naming the owner), drains the
//! queue through a local FIFO cache in sequence order, and hands batches to a
//! caller-supplied handler. Non-primary masters only enqueue, with mild
//! backpressure so a flooded queue slows producers down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::controller::{CachedWrite, ControllerState, MasterController, MasterState};
use super::node::ShardId;
use crate::coordination::payload::{
    KEY_MASTER_SERVER_REAL_PATH, KEY_REQ_DATA, KEY_REQ_TYPE,
};
use crate::coordination::{KvPayload, Watch};
use crate::Result;

/// Soft cap on a single request payload; larger payloads warn but proceed so
/// operators notice before the store starts refusing them.
pub const MAX_WRITE_PAYLOAD: usize = 512 * 1024;

/// Queue children fetched into the local cache per refill.
const CACHE_REFILL_WINDOW: usize = 1000;

/// Queue depth beyond which producers are slowed down.
const QUEUE_SLOWDOWN_THRESHOLD: usize = 10_000;

/// Request type stamped on cross-shard fan-out writes.
const REQ_TYPE_FROM_SHARD: &str = "api_from_shard";

/// Public API of the write broker. Construction borrows the controller it
/// shares state with; all methods are safe from any thread.
pub struct WriteBroker {
    controller: Arc<MasterController>,
}

impl WriteBroker {
    pub fn new(controller: Arc<MasterController>) -> Self {
        Self { controller }
    }

    /// Take the per-shard write lock.
    ///
    /// `Ok(true)` means this master owns the in-flight write. `Ok(false)` is a
    /// soft refusal (non-primary, disabled, or another write in flight, with a
    /// watch armed on the lock). A hard store error is returned as `Err`.
    pub fn prepare_write(&self) -> Result<bool> {
        let ctl = &self.controller;
        if !ctl.distributed().enabled {
            return Ok(true);
        }
        let mut st = ctl.lock_state();
        if st.stopping {
            return Ok(false);
        }
        let shard = st.topology.current.shard;
        let prepare = ctl.paths().write_prepare_node(shard);
        if !ctl.is_mine_primary_locked(&st) {
            warn!("non-primary master can not prepare a write request");
            ctl.client().exists(&prepare, Watch::None);
            ctl.client()
                .exists(&ctl.paths().write_queue_parent(shard), Watch::None);
            return Ok(false);
        }
        if st.new_write_disabled {
            info!("prepare failed: new writes temporarily disabled");
            return Ok(false);
        }
        if ctl.distributed().async_write {
            st.write_prepared = true;
            return Ok(true);
        }

        let mut payload = KvPayload::new();
        payload.set(KEY_MASTER_SERVER_REAL_PATH, &st.server_real_path);
        match ctl.client().create_ephemeral(&prepare, &payload.serialize()) {
            Ok(()) => {
                info!("prepare write success on server {}", st.server_real_path);
                st.write_prepared = true;
                Ok(true)
            }
            Err(err) if err.is_already_exists() => {
                info!(
                    "another write request is running, prepare failed on server {}",
                    st.server_real_path
                );
                ctl.client().exists(&prepare, Watch::Set);
                Ok(false)
            }
            Err(err) => {
                error!("failed to prepare write request: {}", err);
                ctl.client().exists(&prepare, Watch::Set);
                Err(err)
            }
        }
    }

    /// Enqueue a write for this master's shard. Returns false on refusal.
    pub async fn push_write(&self, data: &str, req_type: &str) -> bool {
        let ctl = &self.controller;
        if !ctl.distributed().enabled {
            error!("master is not configured as distributed, write refused");
            return false;
        }
        if ctl.is_stopping() {
            error!("master is stopping, write refused");
            return false;
        }
        if !ctl.client().is_connected() {
            error!("master is not connected to coordination service, write refused");
            return false;
        }
        if ctl
            .client()
            .exists(&ctl.paths().migrate_prepare(), Watch::Set)
        {
            info!("refusing write for the running migration");
            return false;
        }
        if data.len() > MAX_WRITE_PAYLOAD {
            warn!(
                "write request payload of {} bytes exceeds the soft cap",
                data.len()
            );
        }

        // mild backpressure, outside the state lock
        let (mine_primary, waiting) = {
            let st = ctl.lock_state();
            (ctl.is_mine_primary_locked(&st), st.waiting_requests)
        };
        if !mine_primary {
            let pause = if ctl.distributed().async_write {
                Duration::from_millis(10)
            } else {
                Duration::from_millis(500)
            };
            tokio::time::sleep(pause).await;
        } else if waiting > QUEUE_SLOWDOWN_THRESHOLD {
            info!("too many write requests waiting, slowing down: {}", waiting);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let queue_node = ctl.paths().write_queue_node(ctl.current_shard());
        let mut payload = KvPayload::new();
        payload.set(KEY_REQ_TYPE, req_type);
        payload.set(KEY_REQ_DATA, data);
        match ctl
            .client()
            .create_ephemeral_sequential(&queue_node, &payload.serialize())
        {
            Ok(real_path) => {
                info!("a write request pushed to the queue: {}", real_path);
                true
            }
            Err(err) => {
                error!("write request push failed: {}", err);
                false
            }
        }
    }

    /// Enqueue one write under each target shard's queue.
    ///
    /// Refused while a migration is in progress unless `for_migrate`.
    pub fn push_write_to_shards(
        &self,
        data: &str,
        shard_ids: &[ShardId],
        for_migrate: bool,
        include_self: bool,
    ) -> bool {
        let ctl = &self.controller;
        if !ctl.client().is_connected() {
            error!("master is not connected to coordination service, write refused");
            return false;
        }
        if data.len() > MAX_WRITE_PAYLOAD {
            warn!(
                "write request payload of {} bytes exceeds the soft cap",
                data.len()
            );
        }
        if !for_migrate
            && ctl
                .client()
                .exists(&ctl.paths().migrate_prepare(), Watch::Set)
        {
            info!("refusing cross-shard write for the running migration");
            return false;
        }

        let current_shard = ctl.current_shard();
        let mut payload = KvPayload::new();
        payload.set(KEY_REQ_TYPE, REQ_TYPE_FROM_SHARD);
        payload.set(KEY_REQ_DATA, data);
        let serialized = payload.serialize();

        for shard in shard_ids {
            if !include_self && *shard == current_shard {
                continue;
            }
            let queue_node = ctl.paths().write_queue_node(*shard);
            match ctl
                .client()
                .create_ephemeral_sequential(&queue_node, &serialized)
            {
                Ok(real_path) => {
                    info!("a write request pushed to shard queue: {}", real_path)
                }
                Err(err) => {
                    error!("write request push failed for shard {}: {}", shard, err);
                    return false;
                }
            }
        }
        true
    }

    /// Pop the next cached request, deleting its queue znode.
    ///
    /// Only meaningful after a successful prepare; returns `(data, req_type)`.
    pub fn pop_write(&self) -> Option<(String, String)> {
        let ctl = &self.controller;
        if !ctl.distributed().enabled {
            return None;
        }
        let mut st = ctl.lock_state();
        if st.cached_writes.is_empty() && !cache_refill(ctl, &mut st) {
            return None;
        }
        let head = st.cached_writes.front().cloned()?;
        info!(
            "a request popped: {} on server {}",
            head.path, st.server_real_path
        );
        if let Err(err) = ctl.client().delete(&head.path) {
            if !ctl.client().is_connected() {
                return None;
            }
            warn!("delete popped request {} failed: {}", head.path, err);
        }
        st.cached_writes.pop_front();
        Some((head.data, head.req_type))
    }

    /// Release the prepare lock, verifying ownership first.
    ///
    /// `Ok(true)` when the lock is absent or was released; `Ok(false)` when
    /// another master owns the in-flight write, in which case the lock is
    /// left untouched. `Err` only on a hard store failure.
    pub fn end_write_req(&self) -> Result<bool> {
        let ctl = &self.controller;
        let mut st = ctl.lock_state();
        try_end_write(ctl, &mut st)
    }

    /// Forget the in-memory prepared flag once a write round is fully done.
    pub fn end_prepared_write(&self) {
        let mut st = self.controller.lock_state();
        st.write_prepared = false;
    }

    /// Block further prepares; refused while a write is already prepared.
    pub fn disable_new_write(&self) -> bool {
        let mut st = self.controller.lock_state();
        if st.write_prepared {
            info!("disable write failed: a write is already prepared");
            return false;
        }
        st.new_write_disabled = true;
        true
    }

    pub fn enable_new_write(&self) {
        let mut st = self.controller.lock_state();
        st.new_write_disabled = false;
    }

    /// Requests known to be waiting in the store beyond the local cache.
    pub fn waiting_requests(&self) -> usize {
        self.controller.lock_state().waiting_requests
    }
}

// ---- shared logic driven from the controller's event path ----

/// Entry point for every watch fire that may unblock a write. Returns true
/// when the caller should invoke the new-request handler (after releasing the
/// state lock).
pub(crate) fn check_for_write(ctl: &MasterController, st: &mut ControllerState) -> bool {
    if !ctl.distributed().enabled {
        return false;
    }
    if !ctl.is_mine_primary_locked(st) {
        if !ctl.client().is_connected() {
            return false;
        }
        if !st.cached_writes.is_empty() {
            info!("non-primary master with cached write requests, clearing cache");
            st.cached_writes.clear();
        }
        let shard = st.topology.current.shard;
        ctl.client()
            .exists(&ctl.paths().write_prepare_node(shard), Watch::None);
        ctl.client()
            .exists(&ctl.paths().write_queue_parent(shard), Watch::None);
        return false;
    }
    match st.master_state {
        MasterState::Started | MasterState::StartingWaitWorkers => check_for_new_write(ctl, st),
        other => {
            info!("master state not ready for write check: {}", other);
            false
        }
    }
}

fn check_for_new_write(ctl: &MasterController, st: &mut ControllerState) -> bool {
    if st.write_prepared {
        info!("a prepared write is still waiting on its worker");
        return false;
    }
    if !st.ready_for_new_write {
        return false;
    }
    if !end_write(ctl, st) {
        let prepare = ctl.paths().write_prepare_node(st.topology.current.shard);
        ctl.client().exists(&prepare, Watch::Set);
        return false;
    }
    if st.cached_writes.is_empty() && !cache_refill(ctl, st) {
        return false;
    }
    if st.cached_writes.is_empty() {
        return false;
    }
    info!("cached write requests ready: {}", st.cached_writes.len());
    true
}

/// Refill the local cache from the queue, oldest sequence first. Returns false
/// when the queue is empty (a child watch is then armed on the parent).
pub(crate) fn cache_refill(ctl: &MasterController, st: &mut ControllerState) -> bool {
    if !st.cached_writes.is_empty() {
        return false;
    }
    let queue_parent = ctl.paths().write_queue_parent(st.topology.current.shard);
    let children = ctl.client().children_or_empty(&queue_parent, Watch::None);
    if children.is_empty() {
        info!(
            "no write request while checking queue on server {}",
            st.server_real_path
        );
        let _ = ctl.client().get_children(&queue_parent, Watch::Set);
        return false;
    }

    info!("write requests waiting: {}", children.len());
    let fetch = children.len().min(CACHE_REFILL_WINDOW);
    st.waiting_requests = children.len() - fetch;
    for child in &children[..fetch] {
        match ctl.client().get_data(child, Watch::None) {
            Ok(data) => {
                let payload = KvPayload::parse(&data);
                st.cached_writes.push_back(CachedWrite {
                    path: child.clone(),
                    data: payload.get_str(KEY_REQ_DATA).to_string(),
                    req_type: payload.get_str(KEY_REQ_TYPE).to_string(),
                });
            }
            Err(err) => warn!("read queued request {} failed: {}", child, err),
        }
    }
    true
}

/// Ownership-checked prepare release. A foreign holder is a plain `Ok(false)`
/// outcome, never a delete and never an error.
fn try_end_write(ctl: &MasterController, st: &mut ControllerState) -> Result<bool> {
    if ctl.distributed().async_write {
        return Ok(true);
    }
    if st.stopping {
        return Ok(true);
    }
    let prepare = ctl.paths().write_prepare_node(st.topology.current.shard);
    if !ctl.client().exists(&prepare, Watch::None) {
        return Ok(true);
    }
    let payload = ctl.client().get_payload(&prepare, Watch::None)?;
    let holder = payload.get_str(KEY_MASTER_SERVER_REAL_PATH);
    if holder != st.server_real_path {
        warn!(
            "end write request mismatch: {} vs {}",
            holder, st.server_real_path
        );
        return Ok(false);
    }
    let _ = ctl.client().delete(&prepare);
    info!("end write request success on server {}", st.server_real_path);
    Ok(true)
}

/// Bool-shaped release for the event path, which only logs failures.
pub(crate) fn end_write(ctl: &MasterController, st: &mut ControllerState) -> bool {
    match try_end_write(ctl, st) {
        Ok(done) => done,
        Err(err) => {
            warn!("end write request failed: {}", err);
            false
        }
    }
}
