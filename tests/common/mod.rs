//! Shared harness for the quorum scenarios: several daemons over one
//! in-memory disk, with a scripted cluster manager and a fail-safe that
//! only records what it was asked to do.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use qdiskd::cluster::{ClusterEvent, ClusterManager, ClusterMember};
use qdiskd::config::QuorumdConfig;
use qdiskd::daemon::QuorumDaemon;
use qdiskd::disk::{scan, MemoryDevice, QuorumDisk};
use qdiskd::failsafe::{FailSafe, FailSafeReason};
use qdiskd::heuristic::{Score, ScoreCell};
use qdiskd::{Error, Result};

#[derive(Default)]
pub struct MockState {
    pub members: Vec<u32>,
    pub polls: Vec<bool>,
    pub kills: Vec<u32>,
    pub registered: Option<(String, u32)>,
    pub unregistered: bool,
    pub events: VecDeque<ClusterEvent>,
    pub fail_poll: bool,
    pub fail_dispatch: bool,
    pub fail_kill: bool,
}

/// Cluster manager that records every call
#[derive(Clone, Default)]
pub struct MockClusterManager {
    pub state: Arc<Mutex<MockState>>,
}

impl MockClusterManager {
    pub fn with_members(members: &[u32]) -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().members = members.to_vec();
        mock
    }

    pub fn kills(&self) -> Vec<u32> {
        self.state.lock().unwrap().kills.clone()
    }

    pub fn last_poll(&self) -> Option<bool> {
        self.state.lock().unwrap().polls.last().copied()
    }

    pub fn push_event(&self, event: ClusterEvent) {
        self.state.lock().unwrap().events.push_back(event);
    }

    pub fn unregistered(&self) -> bool {
        self.state.lock().unwrap().unregistered
    }

    pub fn fail_poll(&self, fail: bool) {
        self.state.lock().unwrap().fail_poll = fail;
    }

    pub fn fail_dispatch(&self, fail: bool) {
        self.state.lock().unwrap().fail_dispatch = fail;
    }

    pub fn fail_kill(&self, fail: bool) {
        self.state.lock().unwrap().fail_kill = fail;
    }
}

impl ClusterManager for MockClusterManager {
    fn is_active(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn local_node_id(&mut self) -> Result<u32> {
        Ok(0)
    }

    fn members(&mut self) -> Result<Vec<ClusterMember>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .iter()
            .map(|&node_id| ClusterMember {
                node_id,
                member: true,
            })
            .collect())
    }

    fn register_quorum_device(&mut self, name: &str, votes: u32) -> Result<()> {
        self.state.lock().unwrap().registered = Some((name.to_string(), votes));
        Ok(())
    }

    fn unregister_quorum_device(&mut self) -> Result<()> {
        self.state.lock().unwrap().unregistered = true;
        Ok(())
    }

    fn poll_quorum_device(&mut self, available: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_poll {
            return Err(Error::ClusterRequest("poll refused".into()));
        }
        state.polls.push(available);
        Ok(())
    }

    fn kill_node(&mut self, node_id: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // Attempts are recorded even when they fail
        state.kills.push(node_id);
        if state.fail_kill {
            return Err(Error::ClusterRequest(format!("cannot fence node {}", node_id)));
        }
        Ok(())
    }

    fn leave_cluster(&mut self) -> Result<()> {
        Ok(())
    }

    fn dispatch(&mut self, _timeout: Duration) -> Result<Vec<ClusterEvent>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_dispatch {
            return Err(Error::ClusterUnavailable("connection reset".into()));
        }
        Ok(state.events.drain(..).collect())
    }
}

/// Fail-safe that records instead of rebooting
#[derive(Clone, Default)]
pub struct RecordingFailSafe(pub Arc<Mutex<Vec<FailSafeReason>>>);

impl RecordingFailSafe {
    pub fn reasons(&self) -> Vec<FailSafeReason> {
        self.0.lock().unwrap().clone()
    }
}

impl FailSafe for RecordingFailSafe {
    fn trigger(&self, reason: FailSafeReason) {
        self.0.lock().unwrap().push(reason);
    }
}

pub fn config(extra: &str) -> QuorumdConfig {
    QuorumdConfig::from_str(&format!(
        "[quorumd]\ndevice = \"/dev/qdisk\"\ninterval = 1\ntko = 3\n{}",
        extra
    ))
    .unwrap()
}

/// A freshly initialized shared disk
pub fn shared_disk() -> MemoryDevice {
    let device = MemoryDevice::new(512);
    let disk = QuorumDisk::new(Box::new(device.attach()));
    scan::initialize(&disk, "harness", "scenario").unwrap();
    device
}

/// One daemon plus handles on everything it talks to
pub struct TestNode {
    pub daemon: QuorumDaemon,
    pub cluster: MockClusterManager,
    pub failsafe: RecordingFailSafe,
    pub device: MemoryDevice,
    pub score: ScoreCell,
}

impl TestNode {
    pub fn new(shared: &MemoryDevice, node_id: u32, members: &[u32], extra: &str) -> Self {
        let device = shared.attach();
        let cluster = MockClusterManager::with_members(members);
        let failsafe = RecordingFailSafe::default();
        let score = ScoreCell::new(Score::FIXED);

        let daemon = QuorumDaemon::new(
            config(extra),
            node_id,
            QuorumDisk::new(Box::new(device.clone())),
            Box::new(cluster.clone()),
            Box::new(failsafe.clone()),
            score.clone(),
            CancellationToken::new(),
        );

        Self {
            daemon,
            cluster,
            failsafe,
            device,
            score,
        }
    }
}

/// Run the startup sequence on every node in lockstep
pub fn boot(nodes: &mut [TestNode]) {
    for node in nodes.iter_mut() {
        node.daemon.start().unwrap();
    }
    for _ in 0..3 {
        for node in nodes.iter_mut() {
            node.daemon.init_round().unwrap();
        }
    }
    for node in nodes.iter_mut() {
        node.daemon.finish_init().unwrap();
    }
}

/// Run `rounds` cycles on every node in lockstep
pub fn cycle_all(nodes: &mut [TestNode], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes.iter_mut() {
            node.daemon.cycle().unwrap();
        }
    }
}
