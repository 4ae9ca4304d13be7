//! Multi-node scenarios over a shared in-memory quorum disk

mod common;

use std::sync::atomic::Ordering;

use common::{boot, cycle_all, shared_disk, TestNode};
use qdiskd::cluster::ClusterEvent;
use qdiskd::disk::QuorumDisk;
use qdiskd::failsafe::FailSafeReason;
use qdiskd::protocol::{NodeState, StatusBlock};
use qdiskd::Error;

const MEMBERS: [u32; 3] = [1, 2, 3];

fn three_nodes(extra: &str) -> (qdiskd::disk::MemoryDevice, Vec<TestNode>) {
    let shared = shared_disk();
    let nodes = MEMBERS
        .iter()
        .map(|&id| TestNode::new(&shared, id, &MEMBERS, extra))
        .collect();
    (shared, nodes)
}

#[test]
fn test_lowest_node_becomes_master() {
    let (_shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 8);

    assert_eq!(nodes[0].daemon.state(), NodeState::Master);
    for node in &nodes[1..] {
        assert_eq!(node.daemon.state(), NodeState::Run);
        assert_eq!(node.daemon.master(), Some(1));
        assert_eq!(node.cluster.last_poll(), Some(true));
    }

    let master_mask = nodes[0].daemon.master_mask();
    assert_eq!(master_mask.node_ids().collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(nodes[0].cluster.last_poll(), Some(true));
}

#[test]
fn test_frozen_node_is_evicted_and_rejoins() {
    let (shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 8);
    assert_eq!(nodes[0].daemon.state(), NodeState::Master);

    // Node 3 stops heartbeating; tko = 3 so the fourth stale read evicts it
    cycle_all(&mut nodes[..2], 6);
    assert_eq!(nodes[0].cluster.kills(), vec![3]);
    assert!(nodes[1].cluster.kills().is_empty());
    assert!(!nodes[0].daemon.mask().is_set(3));
    assert!(!nodes[0].daemon.master_mask().is_set(3));

    // The frozen daemon wakes up and finds the eviction notice
    let err = nodes[2].daemon.cycle().unwrap_err();
    assert!(matches!(err, Error::FailSafe(FailSafeReason::EvictedByMaster)));
    assert_eq!(
        nodes[2].failsafe.reasons(),
        vec![FailSafeReason::EvictedByMaster]
    );

    // A fresh run of node 3 comes back with a new incarnation
    let old_incarnation = nodes[2].daemon.incarnation();
    nodes[2] = TestNode::new(&shared, 3, &MEMBERS, "");
    assert_ne!(nodes[2].daemon.incarnation(), old_incarnation);

    nodes[2].daemon.start().unwrap();
    for _ in 0..3 {
        nodes[2].daemon.init_round().unwrap();
        cycle_all(&mut nodes[..2], 1);
    }
    nodes[2].daemon.finish_init().unwrap();
    cycle_all(&mut nodes, 6);

    // Not treated as undead, so no second eviction
    assert_eq!(nodes[0].cluster.kills(), vec![3]);
    assert!(nodes[2].failsafe.reasons().is_empty());
    assert_eq!(nodes[0].daemon.state(), NodeState::Master);
    assert_eq!(nodes[2].daemon.state(), NodeState::Run);
    assert_eq!(nodes[2].daemon.master(), Some(1));
    assert!(nodes[0].daemon.master_mask().is_set(3));

    let info = nodes[0].daemon.tracker().node(3).unwrap();
    assert_eq!(info.state, NodeState::Run);
    assert_eq!(info.incarnation, nodes[2].daemon.incarnation());
}

#[test]
fn test_lower_bidder_wins() {
    let shared = shared_disk();
    let mut late = TestNode::new(&shared, 1, &MEMBERS, "master_wait = 10");
    let mut nodes: Vec<TestNode> = [2, 3]
        .iter()
        .map(|&id| TestNode::new(&shared, id, &MEMBERS, "master_wait = 10"))
        .collect();

    // Nodes 2 and 3 start alone; node 2 is lowest and bids
    boot(&mut nodes);
    cycle_all(&mut nodes, 2);
    assert!(nodes[0].daemon.election().bid_pending() > 0);

    // Node 1 shows up while node 2 is still waiting on its bid
    late.daemon.start().unwrap();
    for _ in 0..3 {
        late.daemon.init_round().unwrap();
        cycle_all(&mut nodes, 1);
    }
    late.daemon.finish_init().unwrap();
    nodes.insert(0, late);

    for _ in 0..25 {
        cycle_all(&mut nodes, 1);
        assert_ne!(nodes[1].daemon.state(), NodeState::Master);
    }

    assert_eq!(nodes[0].daemon.state(), NodeState::Master);
    assert_eq!(nodes[1].daemon.master(), Some(1));
    assert_eq!(nodes[2].daemon.master(), Some(1));
}

#[test]
fn test_eviction_notice_in_own_slot_triggers_fail_safe() {
    let (shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 4);

    let disk = QuorumDisk::new(Box::new(shared.attach()));
    disk.write_status(&StatusBlock::eviction_notice(2, 1, u64::MAX / 2))
        .unwrap();

    let err = nodes[1].daemon.cycle().unwrap_err();
    assert!(matches!(err, Error::FailSafe(FailSafeReason::EvictedByMaster)));
    assert_eq!(
        nodes[1].failsafe.reasons(),
        vec![FailSafeReason::EvictedByMaster]
    );
}

#[test]
fn test_local_write_failures_trigger_fail_safe() {
    let shared = shared_disk();
    let mut nodes = vec![TestNode::new(&shared, 1, &[1], "")];
    boot(&mut nodes);
    cycle_all(&mut nodes, 2);

    nodes[0].device.fail_writes(true);
    nodes[0].daemon.cycle().unwrap();
    nodes[0].daemon.cycle().unwrap();
    let err = nodes[0].daemon.cycle().unwrap_err();
    assert!(matches!(
        err,
        Error::FailSafe(FailSafeReason::LocalWriteFailures)
    ));
    assert_eq!(
        nodes[0].failsafe.reasons(),
        vec![FailSafeReason::LocalWriteFailures]
    );
}

#[test]
fn test_read_errors_exhaust_error_budget() {
    let shared = shared_disk();
    let mut nodes = vec![TestNode::new(&shared, 1, &[1], "max_error_cycles = 2")];
    boot(&mut nodes);
    cycle_all(&mut nodes, 2);

    nodes[0].device.fail_reads(true);
    nodes[0].daemon.cycle().unwrap();
    let err = nodes[0].daemon.cycle().unwrap_err();
    assert!(matches!(err, Error::TooManyErrors(2)));
    assert!(nodes[0].failsafe.reasons().is_empty());
}

#[test]
fn test_shutdown_request_logs_out() {
    let shared = shared_disk();
    let mut nodes = vec![TestNode::new(&shared, 1, &[1], "")];
    boot(&mut nodes);

    nodes[0].cluster.push_event(ClusterEvent::TryShutdown);
    nodes[0].daemon.run().unwrap();

    assert!(nodes[0].cluster.unregistered());
    let disk = QuorumDisk::new(Box::new(shared.attach()));
    let (block, _) = disk.read_status(1).unwrap();
    assert_eq!(block.state, NodeState::None);
    assert_eq!(block.update_node, 1);
}

#[test]
fn test_reconfigure_enables_status_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("qdiskd.status");
    let config_path = dir.path().join("qdiskd.toml");
    std::fs::write(
        &config_path,
        format!(
            "[quorumd]\ndevice = \"/dev/qdisk\"\ntko = 3\nstatus_file = \"{}\"\n",
            report.display()
        ),
    )
    .unwrap();

    let shared = shared_disk();
    let mut node = TestNode::new(&shared, 1, &[1], "");
    node.daemon = node.daemon.with_config_path(config_path);
    let mut nodes = vec![node];
    boot(&mut nodes);

    cycle_all(&mut nodes, 1);
    assert!(!report.exists());

    nodes[0]
        .daemon
        .reconfigure_flag()
        .store(true, Ordering::SeqCst);
    cycle_all(&mut nodes, 1);

    let text = std::fs::read_to_string(&report).unwrap();
    assert!(text.contains("Node ID: 1\n"));
    assert!(text.contains("Score: 1/1 (Minimum required = 1)\n"));
}

#[test]
fn test_node_id_without_slot_is_rejected() {
    let (shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 4);

    for bad_id in [0, 17] {
        let mut stray = TestNode::new(&shared, bad_id, &MEMBERS, "");
        let err = stray.daemon.start().unwrap_err();
        assert!(matches!(err, Error::InvalidNodeId { node_id, .. } if node_id == bad_id));
    }

    let disk = QuorumDisk::new(Box::new(shared.attach()));
    let (block, _) = disk.read_status(1).unwrap();
    assert_eq!(block.node_id, 1);
    assert_eq!(block.update_node, 1);
    assert_eq!(block.state, NodeState::Master);

    cycle_all(&mut nodes, 2);
    assert_eq!(nodes[0].daemon.state(), NodeState::Master);
}

#[test]
fn test_master_poll_failure_stops_loop_and_logs_out() {
    let (shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 8);
    assert_eq!(nodes[0].daemon.state(), NodeState::Master);

    nodes[0].cluster.fail_poll(true);
    let err = nodes[0].daemon.run().unwrap_err();
    assert!(matches!(err, Error::ClusterRequest(_)));
    assert!(nodes[0].cluster.unregistered());
    assert!(nodes[0].failsafe.reasons().is_empty());

    let disk = QuorumDisk::new(Box::new(shared.attach()));
    let (block, _) = disk.read_status(1).unwrap();
    assert_eq!(block.state, NodeState::None);
}

#[test]
fn test_follower_dispatch_failure_is_fatal() {
    let (_shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 8);
    assert_eq!(nodes[1].daemon.state(), NodeState::Run);

    nodes[1].cluster.fail_dispatch(true);
    let err = nodes[1].daemon.cycle().unwrap_err();
    assert!(matches!(err, Error::ClusterUnavailable(_)));
    assert!(nodes[1].failsafe.reasons().is_empty());
}

#[test]
fn test_failed_kill_still_leaves_eviction_notice() {
    let (shared, mut nodes) = three_nodes("");
    boot(&mut nodes);
    cycle_all(&mut nodes, 8);

    nodes[0].cluster.fail_kill(true);
    cycle_all(&mut nodes[..2], 6);
    assert_eq!(nodes[0].cluster.kills(), vec![3]);

    let disk = QuorumDisk::new(Box::new(shared.attach()));
    let (block, _) = disk.read_status(3).unwrap();
    assert_eq!(block.state, NodeState::Evict);
    assert_eq!(block.update_node, 1);

    // The master carries on without node 3
    cycle_all(&mut nodes[..2], 3);
    assert_eq!(nodes[0].daemon.state(), NodeState::Master);
    assert!(!nodes[0].daemon.master_mask().is_set(3));
    assert_eq!(nodes[1].daemon.master(), Some(1));

    let err = nodes[2].daemon.cycle().unwrap_err();
    assert!(matches!(err, Error::FailSafe(FailSafeReason::EvictedByMaster)));
}

#[test]
fn test_eviction_without_kill_permission() {
    let (shared, mut nodes) = three_nodes("allow_kill = false");
    boot(&mut nodes);
    cycle_all(&mut nodes, 8);

    cycle_all(&mut nodes[..2], 6);
    assert!(nodes[0].cluster.kills().is_empty());
    assert!(!nodes[0].daemon.mask().is_set(3));

    let disk = QuorumDisk::new(Box::new(shared.attach()));
    let (block, _) = disk.read_status(3).unwrap();
    assert_eq!(block.state, NodeState::Evict);
    assert_eq!(block.update_node, 1);
}
