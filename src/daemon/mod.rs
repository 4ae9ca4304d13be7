//! Quorum Daemon
//!
//! Drives the per-cycle protocol: read every slot, reconcile node
//! transitions, check our fitness, run the master election, talk to the
//! cluster manager and write our own heartbeat. Runs on a dedicated OS
//! thread; the heuristic scorer feeds it through a `ScoreCell`.

pub mod report;
pub mod timing;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterEvent, ClusterManager};
use crate::config::QuorumdConfig;
use crate::disk::{self, QuorumDisk};
use crate::error::{Error, Result};
use crate::failsafe::{FailSafe, FailSafeReason};
use crate::heuristic::{Score, ScoreCell};
use crate::protocol::{MemberMask, NodeState, StatusBlock};
use crate::state::election::master_mask;
use crate::state::{Eviction, MasterElection, NodeTracker, Role};
use crate::sys;

use report::StatusReport;
use timing::CycleTimer;

/// Longest single sleep while waiting for the next cycle
const DISPATCH_SLICE: Duration = Duration::from_millis(100);

/// Quorum loop state for the local node
pub struct QuorumDaemon {
    config: QuorumdConfig,
    config_path: Option<PathBuf>,
    my_id: u32,
    debug: bool,
    disk: QuorumDisk,
    cluster: Box<dyn ClusterManager>,
    failsafe: Box<dyn FailSafe>,
    score: ScoreCell,
    cancel: CancellationToken,
    reconfig: Arc<AtomicBool>,
    tracker: NodeTracker,
    election: MasterElection,
    status: NodeState,
    master: Option<u32>,
    mask: MemberMask,
    master_mask: MemberMask,
    incarnation: u64,
    last_timestamp: u64,
    timer: CycleTimer,
    write_failures: u32,
    error_cycles: u32,
}

impl QuorumDaemon {
    pub fn new(
        config: QuorumdConfig,
        my_id: u32,
        disk: QuorumDisk,
        cluster: Box<dyn ClusterManager>,
        failsafe: Box<dyn FailSafe>,
        score: ScoreCell,
        cancel: CancellationToken,
    ) -> Self {
        let q = &config.quorumd;
        let tracker = NodeTracker::new(my_id, q.tko, q.tko_up());
        let election = MasterElection::new(my_id, q.master_wait());

        Self {
            config,
            config_path: None,
            my_id,
            debug: false,
            disk,
            cluster,
            failsafe,
            score,
            cancel,
            reconfig: Arc::new(AtomicBool::new(false)),
            tracker,
            election,
            status: NodeState::None,
            master: None,
            mask: MemberMask::default(),
            master_mask: MemberMask::default(),
            incarnation: new_incarnation(),
            last_timestamp: 0,
            timer: CycleTimer::new(),
            write_failures: 0,
            error_cycles: 0,
        }
    }

    /// Dump per-node state in the status report
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// File to re-read when a reconfiguration is requested
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Flag that requests a reload of the dynamic settings
    pub fn reconfigure_flag(&self) -> Arc<AtomicBool> {
        self.reconfig.clone()
    }

    pub fn my_id(&self) -> u32 {
        self.my_id
    }

    pub fn state(&self) -> NodeState {
        self.status
    }

    pub fn master(&self) -> Option<u32> {
        self.master
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn mask(&self) -> MemberMask {
        self.mask
    }

    pub fn master_mask(&self) -> MemberMask {
        self.master_mask
    }

    pub fn tracker(&self) -> &NodeTracker {
        &self.tracker
    }

    pub fn election(&self) -> &MasterElection {
        &self.election
    }

    pub fn config(&self) -> &QuorumdConfig {
        &self.config
    }

    /// Register the quorum disk with the cluster manager
    pub fn register(&mut self) -> Result<()> {
        let name = self
            .config
            .quorumd
            .cman_label
            .clone()
            .unwrap_or_else(|| self.disk.name().to_string());
        let votes = self.config.quorumd.votes;

        self.cluster.register_quorum_device(&name, votes)?;
        info!("Registered quorum device {} with {} votes", name, votes);
        Ok(())
    }

    /// Announce ourselves and watch the disk for `tko` cycles
    pub fn init(&mut self) -> Result<()> {
        info!("Quorum Daemon Initializing");
        self.start()?;

        let interval = self.config.quorumd.interval();
        for _ in 0..self.config.quorumd.tko {
            if self.cancel.is_cancelled() {
                break;
            }
            self.init_round()?;
            self.wait(interval);
        }

        self.finish_init()
    }

    /// Write INIT before the first read so a stale eviction notice in our
    /// slot from a previous run is overwritten
    pub fn start(&mut self) -> Result<()> {
        disk::check_node_id(self.my_id)?;
        self.status = NodeState::Init;
        self.write_own_status().map_err(|e| {
            error!("Could not initialize status block: {}", e);
            e
        })
    }

    /// One initialization round; the membership view is not used yet
    pub fn init_round(&mut self) -> Result<()> {
        self.read_blocks()?;
        let transitions = self.tracker.check_transitions(false);
        self.issue_evictions(&transitions.evictions);

        self.write_own_status().map_err(|e| {
            error!("Initialization failed: {}", e);
            e
        })?;

        let score = self.score.get();
        self.report(score, score.required(self.config.quorumd.min_score));
        Ok(())
    }

    /// Check the score after initialization
    pub fn finish_init(&mut self) -> Result<()> {
        let score = self.score.get();
        let required = score.required(self.config.quorumd.min_score);
        info!("Initial score {}/{}", score.score, score.max);

        if self.config.quorumd.stop_cman && score.score < required {
            return Err(Error::ScoreInsufficient {
                score: score.score,
                required,
            });
        }

        self.status = NodeState::None;
        info!("Initialization complete");
        Ok(())
    }

    /// Run cycles until stopped; logs out on a clean stop
    pub fn run(&mut self) -> Result<()> {
        let result = self.run_cycles();

        match &result {
            Ok(()) => self.logout(),
            Err(e) if e.is_fail_safe() => {}
            // Our slot belongs to someone else now
            Err(Error::SlotHijacked { .. }) => {}
            Err(e) => {
                error!("Quorum loop stopped: {}", e);
                self.logout();
            }
        }

        result
    }

    fn run_cycles(&mut self) -> Result<()> {
        let use_uptime = self.config.quorumd.use_uptime;

        while !self.cancel.is_cancelled() {
            let started = sys::now_micros(use_uptime);
            self.cycle()?;
            let elapsed =
                Duration::from_micros(sys::now_micros(use_uptime).saturating_sub(started));

            let pause = self.end_cycle(elapsed)?;
            self.wait(pause);
        }

        info!("Quorum loop stopping");
        Ok(())
    }

    /// One protocol cycle, without the trailing sleep
    pub fn cycle(&mut self) -> Result<()> {
        if self.reconfig.swap(false, Ordering::SeqCst) {
            self.reload_config();
        }

        // Grace counter ticks before the fitness check
        self.election.tick();

        let mut errors = self.read_blocks()?;
        let is_master = self.status == NodeState::Master;
        let transitions = self.tracker.check_transitions(is_master);
        self.mask = transitions.mask;
        self.issue_evictions(&transitions.evictions);

        let score = self.score.get();
        let required = score.required(self.config.quorumd.min_score);
        self.check_fitness(score, required)?;

        let scan = self.election.master_exists(&self.tracker);
        self.master = scan.master;
        let role = self.election.step(&mut self.status, &scan, &self.tracker);
        self.act_on_role(role, errors)?;

        if self.status != NodeState::Master {
            self.master_mask.reset();
        }

        match self.write_own_status() {
            Ok(()) => self.write_failures = 0,
            Err(e) => {
                error!("Error writing to quorum disk: {}", e);
                errors += 1;
                self.write_failures += 1;
                if self.write_failures >= self.config.quorumd.tko {
                    return Err(self.fail_safe(FailSafeReason::LocalWriteFailures));
                }
            }
        }

        self.report(score, required);

        let max_error_cycles = self.config.quorumd.max_error_cycles;
        if errors > 0 && max_error_cycles > 0 {
            self.error_cycles += 1;
            if self.error_cycles >= max_error_cycles {
                error!("Too many I/O errors; giving up");
                return Err(Error::TooManyErrors(self.error_cycles));
            }
        } else {
            self.error_cycles = 0;
        }

        Ok(())
    }

    /// Record a cycle's duration and return how long to sleep
    pub fn end_cycle(&mut self, elapsed: Duration) -> Result<Duration> {
        self.timer.record(elapsed);

        let max_time = self.config.quorumd.max_cycle_time();
        if elapsed > max_time && self.config.quorumd.paranoid {
            error!(
                "Failed to complete a cycle within {}s ({:?}) - REBOOTING",
                max_time.as_secs(),
                elapsed
            );
            return Err(self.fail_safe(FailSafeReason::CycleOverrun));
        }

        Ok(timing::sleep_time(elapsed, self.config.quorumd.interval()))
    }

    /// Withdraw from the cluster manager and mark our slot as shut down
    pub fn logout(&mut self) {
        if let Err(e) = self.cluster.unregister_quorum_device() {
            warn!("Failed to unregister quorum device: {}", e);
        }

        self.status = NodeState::None;
        self.election.clear();
        self.mask.reset();
        self.master_mask.reset();
        if let Err(e) = self.write_own_status() {
            warn!("Failed to write final status: {}", e);
        }
        info!("Quorum daemon logged out");
    }

    /// Leave the cluster after a startup failure if configured to
    pub fn stop_cluster(&mut self) -> Result<()> {
        stop_cluster_on_failure(
            self.cluster.as_mut(),
            self.failsafe.as_ref(),
            self.config.quorumd.stop_cman,
        )
    }

    fn read_blocks(&mut self) -> Result<u32> {
        match self.tracker.read_node_blocks(&self.disk) {
            Err(Error::SlotHijacked { state, .. }) if state == NodeState::Evict as u8 => {
                Err(self.fail_safe(FailSafeReason::EvictedByMaster))
            }
            other => other,
        }
    }

    fn check_fitness(&mut self, score: Score, required: u32) -> Result<()> {
        if score.score < required {
            self.mask.clear(self.my_id);

            if self.status > NodeState::None {
                warn!(
                    "Score insufficient for master operation ({}/{}; required={}); downgrading",
                    score.score, score.max, required
                );
                self.status = NodeState::None;
                self.election.clear();

                match self.dispatch_events() {
                    Ok(()) => {
                        if let Err(e) = self.cluster.poll_quorum_device(false) {
                            warn!("Failed to withdraw quorum device vote: {}", e);
                        }
                    }
                    Err(e) => error!("Cluster manager dispatch failed: {}", e),
                }

                if self.config.quorumd.reboot {
                    return Err(self.fail_safe(FailSafeReason::ScoreInsufficient));
                }
            }
        } else {
            self.mask.set(self.my_id);

            if self.status == NodeState::None {
                debug!(
                    "Score sufficient for master operation ({}/{}; required={}); upgrading",
                    score.score, score.max, required
                );
                self.status = NodeState::Run;
                self.election
                    .start_upgrade(self.config.quorumd.upgrade_wait());
            }
        }

        Ok(())
    }

    fn act_on_role(&mut self, role: Role, errors: u32) -> Result<()> {
        match role {
            Role::Master => {
                self.dispatch_events().map_err(halt)?;
                match self.cluster.members() {
                    Ok(members) => self.master_mask = master_mask(&self.mask, &members),
                    Err(e) => warn!("Unable to get cluster membership: {}", e),
                }
                if errors == 0 {
                    self.cluster.poll_quorum_device(true).map_err(halt)?;
                }
            }
            Role::Follower { included: true, .. } => {
                self.dispatch_events().map_err(halt)?;
                if errors == 0 {
                    self.cluster.poll_quorum_device(true).map_err(halt)?;
                }
            }
            // Left unresolved; both masters keep their role
            Role::Conflict { master } => {
                error!("A master exists, but it's not me?! (node {})", master);
            }
            Role::Follower { included: false, .. } | Role::Electing | Role::Idle => {}
        }
        Ok(())
    }

    fn issue_evictions(&mut self, evictions: &[Eviction]) {
        for eviction in evictions {
            let notice =
                StatusBlock::eviction_notice(eviction.node_id, self.my_id, self.next_timestamp());
            if let Err(e) = self.disk.write_status(&notice) {
                warn!(
                    "Failed to write eviction notice for node {}: {}",
                    eviction.node_id, e
                );
            }

            if !self.config.quorumd.allow_kill {
                debug!("Not killing node {}: allow_kill is off", eviction.node_id);
                continue;
            }
            info!("Telling the cluster manager to kill node {}", eviction.node_id);
            if let Err(e) = self.cluster.kill_node(eviction.node_id) {
                error!("Failed to kill node {}: {}", eviction.node_id, e);
            }
        }
    }

    fn write_own_status(&mut self) -> Result<()> {
        let score = self.score.get();
        let block = StatusBlock {
            update_node: self.my_id,
            timestamp: self.next_timestamp(),
            node_id: self.my_id,
            state: self.status,
            flags: 0,
            score: score.score.min(u16::MAX as u32) as u16,
            score_max: score.max.min(u16::MAX as u32) as u16,
            average_cycle: self.timer.average(),
            last_cycle: self.timer.last(),
            incarnation: self.incarnation,
            message: self.election.message(),
            mask: self.mask,
            master_mask: self.master_mask,
        };
        self.disk.write_status(&block)
    }

    /// Strictly increasing heartbeat timestamp
    fn next_timestamp(&mut self) -> u64 {
        let now = sys::now_micros(self.config.quorumd.use_uptime);
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn report(&self, score: Score, required: u32) {
        let Some(target) = self.config.quorumd.status_file.as_deref() else {
            return;
        };

        let text = StatusReport {
            my_id: self.my_id,
            state: self.status,
            score,
            required,
            master: self.master,
            tracker: &self.tracker,
            debug: self.debug,
        }
        .render();

        if let Err(e) = report::write_report(target, &text) {
            debug!("Unable to write status report to {}: {}", target, e);
        }
    }

    /// Process pending cluster manager events
    fn dispatch_events(&mut self) -> Result<()> {
        for event in self.cluster.dispatch(Duration::ZERO)? {
            match event {
                ClusterEvent::TryShutdown => {
                    info!("Cluster manager requested shutdown");
                    self.cancel.cancel();
                }
                ClusterEvent::ConfigUpdate => {
                    debug!("Cluster configuration changed");
                    self.reconfig.store(true, Ordering::SeqCst);
                }
                ClusterEvent::StateChange => debug!("Cluster membership changed"),
            }
        }
        Ok(())
    }

    /// Sleep for `duration`, pumping cluster manager events meanwhile
    fn wait(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;

        while !self.cancel.is_cancelled() {
            if let Err(e) = self.dispatch_events() {
                debug!("Cluster manager dispatch failed: {}", e);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(DISPATCH_SLICE.min(deadline - now));
        }
    }

    fn reload_config(&mut self) {
        let Some(path) = self.config_path.as_deref() else {
            debug!("Reconfiguration requested without a configuration file");
            return;
        };

        let fresh = match QuorumdConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to reload {}: {}", path.display(), e);
                return;
            }
        };

        let old = (self.config.quorumd.scheduler, self.config.quorumd.priority);
        self.config.quorumd.apply_dynamic(&fresh.quorumd);
        let new = (self.config.quorumd.scheduler, self.config.quorumd.priority);
        if old != new {
            sys::set_priority(new.0, new.1);
        }
        info!("Configuration reloaded from {}", path.display());
    }

    fn fail_safe(&self, reason: FailSafeReason) -> Error {
        self.failsafe.trigger(reason);
        Error::FailSafe(reason)
    }
}

/// Ask the cluster manager to take this node out of the cluster
///
/// Falls back to the fail-safe if the cluster manager cannot be told.
pub fn stop_cluster_on_failure(
    cluster: &mut dyn ClusterManager,
    failsafe: &dyn FailSafe,
    stop_cman: bool,
) -> Result<()> {
    if !stop_cman {
        return Ok(());
    }

    warn!("Telling the cluster manager to leave the cluster; qdiskd is not running");
    if let Err(e) = cluster.leave_cluster() {
        error!("Could not leave the cluster: {} - REBOOTING", e);
        failsafe.trigger(FailSafeReason::CannotLeaveCluster);
        return Err(Error::FailSafe(FailSafeReason::CannotLeaveCluster));
    }
    Ok(())
}

fn halt(e: Error) -> Error {
    error!("Cluster manager failure: {}", e);
    error!("Halting qdisk operations");
    e
}

/// Random non-zero token for this run
fn new_incarnation() -> u64 {
    loop {
        let token: u64 = rand::random();
        if token != 0 {
            return token;
        }
    }
}
