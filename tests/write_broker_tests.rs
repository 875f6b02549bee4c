//! Integration tests for the write-request broker
//!
//! Covers the prepare lock, queue admission, FIFO draining, handler dispatch,
//! and the enable/disable interlocks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, TestCluster};
use helmsman::cluster::{MasterState, WriteBroker};
use helmsman::config::DistributedConfig;
use helmsman::coordination::Watch;
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(5);

/// Two replicas by three shards, master primary of shard 1.
fn primary_cluster(name: &str) -> (TestCluster, Arc<helmsman::cluster::MasterController>) {
    let cluster = TestCluster::new(name);
    cluster.add_replica(1);
    cluster.add_replica(2);
    for replica in [1u32, 2] {
        for shard in [1u32, 2, 3] {
            cluster.register_worker(replica, shard, &format!("10.0.{}.{}", replica, shard));
        }
    }
    let topology = cluster.master_topology(1, "10.0.1.1", &[1, 2, 3]);
    let master = cluster.spawn_master(topology, DistributedConfig::default());
    master.notify_changed_primary(true);
    master.start();
    assert_eq!(master.master_state(), MasterState::Started);
    (cluster, master)
}

#[tokio::test]
async fn happy_path_write_round_trip() {
    let (cluster, master) = primary_cluster("happy-path");
    let broker = Arc::new(WriteBroker::new(master.clone()));

    let delivered: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let broker = broker.clone();
        let delivered = delivered.clone();
        master.set_request_handler(move || {
            if !broker.prepare_write().unwrap_or(false) {
                return false;
            }
            while let Some(request) = broker.pop_write() {
                delivered.lock().push(request);
            }
            true
        });
    }
    master.update_ready_for_new_write(true);

    assert!(broker.push_write("{op:add}", "index").await);
    let queue_parent = cluster.paths.write_queue_parent(1);
    assert!(
        wait_until(WAIT, || {
            delivered.lock().contains(&("{op:add}".to_string(), "index".to_string()))
        })
        .await,
        "the handler must receive the pushed request"
    );

    // the worker round finished; release the lock and verify cleanup
    assert!(broker.end_write_req().unwrap());
    broker.end_prepared_write();
    assert!(
        !cluster
            .admin
            .exists(&cluster.paths.write_prepare_node(1), Watch::None),
        "prepare node must be deleted"
    );
    assert!(
        cluster
            .admin
            .get_children(&queue_parent, Watch::None)
            .unwrap()
            .is_empty(),
        "the consumed request must leave the queue"
    );
}

#[tokio::test]
async fn prepare_lock_is_exclusive_across_masters() {
    let cluster = TestCluster::new("contention");
    cluster.add_replica(1);
    for shard in [1u32, 2] {
        cluster.register_worker(1, shard, &format!("10.0.1.{}", shard));
    }

    // split brain for test: two masters both believe they are primary of shard 1
    let master_a =
        cluster.spawn_master(cluster.master_topology(1, "10.0.1.1", &[1, 2]), DistributedConfig::default());
    let master_b =
        cluster.spawn_master(cluster.master_topology(1, "10.0.9.9", &[1, 2]), DistributedConfig::default());
    master_a.notify_changed_primary(true);
    master_b.notify_changed_primary(true);
    master_a.start();
    master_b.start();

    let broker_a = WriteBroker::new(master_a.clone());
    let broker_b = WriteBroker::new(master_b.clone());

    assert!(broker_a.prepare_write().unwrap(), "first prepare wins");
    assert!(
        !broker_b.prepare_write().unwrap(),
        "second prepare observes the lock and soft-fails"
    );

    // the loser must not be able to release the winner's lock
    assert!(
        !broker_b.end_write_req().unwrap(),
        "a foreign holder must make the release report false"
    );
    assert!(
        cluster
            .admin
            .exists(&cluster.paths.write_prepare_node(1), Watch::None),
        "the lock must survive the foreign release attempt"
    );

    assert!(broker_a.end_write_req().unwrap());
    assert!(
        !cluster
            .admin
            .exists(&cluster.paths.write_prepare_node(1), Watch::None)
    );
}

#[tokio::test]
async fn oversized_payload_warns_but_still_enqueues() {
    let (cluster, master) = primary_cluster("oversized");
    let broker = WriteBroker::new(master);

    let data = "x".repeat(600 * 1024);
    assert!(broker.push_write(&data, "index").await);

    let children = cluster
        .admin
        .get_children(&cluster.paths.write_queue_parent(1), Watch::None)
        .unwrap();
    assert_eq!(children.len(), 1, "the oversized request is still queued");
}

#[tokio::test]
async fn pop_drains_in_sequence_order() {
    let (_cluster, master) = primary_cluster("fifo");
    let broker = WriteBroker::new(master);

    for i in 0..3 {
        assert!(broker.push_write(&format!("req-{}", i), "index").await);
    }

    for i in 0..3 {
        let (data, req_type) = broker.pop_write().expect("queued request");
        assert_eq!(data, format!("req-{}", i), "pops must follow push order");
        assert_eq!(req_type, "index");
    }
    assert!(broker.pop_write().is_none(), "the queue must be drained");
}

#[tokio::test]
async fn cross_shard_fanout_reaches_every_queue() {
    let (cluster, master) = primary_cluster("fanout");
    for shard in [2u32, 3] {
        cluster.add_write_queue(shard);
    }
    let broker = WriteBroker::new(master);

    assert!(broker.push_write_to_shards("rebuild", &[1, 2, 3], false, false));

    for shard in [2u32, 3] {
        let children = cluster
            .admin
            .get_children(&cluster.paths.write_queue_parent(shard), Watch::None)
            .unwrap();
        assert_eq!(children.len(), 1, "shard {} must receive the request", shard);
    }
    // include_self = false keeps the fan-out off the caller's own queue
    assert!(
        cluster
            .admin
            .get_children(&cluster.paths.write_queue_parent(1), Watch::None)
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn disable_blocks_prepare_until_enabled_again() {
    let (_cluster, master) = primary_cluster("disable");
    let broker = WriteBroker::new(master);

    assert!(broker.disable_new_write());
    // idempotent: a second disable with no prepare active also succeeds
    assert!(broker.disable_new_write());
    assert!(!broker.prepare_write().unwrap(), "disabled broker must refuse");

    broker.enable_new_write();
    broker.enable_new_write();
    assert!(broker.prepare_write().unwrap());

    // a prepared write blocks disabling
    assert!(!broker.disable_new_write());
    assert!(broker.end_write_req().unwrap());
    broker.end_prepared_write();
}

#[tokio::test]
async fn non_primary_masters_enqueue_but_never_consume() {
    let cluster = TestCluster::new("non-primary");
    cluster.add_replica(1);
    for shard in [1u32, 2] {
        cluster.register_worker(1, shard, &format!("10.0.1.{}", shard));
    }
    let master = cluster.spawn_master(
        cluster.master_topology(1, "10.0.1.1", &[1, 2]),
        DistributedConfig::default(),
    );
    master.start();
    let broker = WriteBroker::new(master.clone());

    assert!(
        !broker.prepare_write().unwrap(),
        "a non-primary master must not take the write lock"
    );
    // the push still lands (after the backpressure pause) for the primary to drain
    assert!(broker.push_write("queued-by-standby", "index").await);
    let children = cluster
        .admin
        .get_children(&cluster.paths.write_queue_parent(1), Watch::None)
        .unwrap();
    assert_eq!(children.len(), 1);
}

#[tokio::test]
async fn handler_failure_releases_the_lock_and_the_request_is_retried() {
    let (cluster, master) = primary_cluster("handler-failure");
    let broker = Arc::new(WriteBroker::new(master.clone()));

    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let delivered: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let broker = broker.clone();
        let attempts = attempts.clone();
        let delivered = delivered.clone();
        master.set_request_handler(move || {
            if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                // first round: take the lock, then fail dispatch
                let _ = broker.prepare_write();
                return false;
            }
            if !broker.prepare_write().unwrap_or(false) {
                return false;
            }
            while let Some(request) = broker.pop_write() {
                delivered.lock().push(request);
            }
            true
        });
    }
    master.update_ready_for_new_write(true);

    assert!(broker.push_write("retried", "index").await);
    assert!(
        wait_until(WAIT, || attempts.load(std::sync::atomic::Ordering::SeqCst) >= 1).await,
        "the first round must run"
    );
    assert!(
        wait_until(WAIT, || {
            !cluster
                .admin
                .exists(&cluster.paths.write_prepare_node(1), Watch::None)
        })
        .await,
        "the failed round must release the prepare lock"
    );

    // the next queue event triggers the retry round, which drains both
    assert!(broker.push_write("second", "index").await);
    assert!(
        wait_until(WAIT, || {
            let delivered = delivered.lock();
            delivered.contains(&("retried".to_string(), "index".to_string()))
                && delivered.contains(&("second".to_string(), "index".to_string()))
        })
        .await,
        "the released lock must allow a retry to deliver the cached request"
    );
    assert!(
        attempts.load(std::sync::atomic::Ordering::SeqCst) >= 2,
        "the request must have been retried"
    );
    assert!(broker.end_write_req().unwrap());
    broker.end_prepared_write();
    assert!(
        cluster
            .admin
            .get_children(&cluster.paths.write_queue_parent(1), Watch::None)
            .unwrap()
            .is_empty(),
        "the retried request must be consumed"
    );
}
