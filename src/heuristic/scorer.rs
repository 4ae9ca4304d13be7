//! Heuristic Scorer Task
//!
//! Runs the configured heuristics as child processes, reaps them without
//! blocking, and publishes the aggregate score once a second.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{total_score, Heuristic, RunningCheck, ScoreCell};
use crate::config::HeuristicConfig;
use crate::error::Error;
use crate::sys;

/// How often the scorer wakes up
const SCORE_INTERVAL: Duration = Duration::from_secs(1);

/// Background scorer
pub struct HeuristicScorer {
    heuristics: Vec<Heuristic>,
    cell: ScoreCell,
    cancel: CancellationToken,
}

impl HeuristicScorer {
    pub fn new(heuristics: Vec<Heuristic>, cell: ScoreCell, cancel: CancellationToken) -> Self {
        Self {
            heuristics,
            cell,
            cancel,
        }
    }

    /// Build a scorer from configuration
    pub fn from_config(
        configs: &[HeuristicConfig],
        cell: ScoreCell,
        cancel: CancellationToken,
    ) -> Self {
        let heuristics: Vec<Heuristic> = configs.iter().map(Heuristic::from_config).collect();
        debug!("{} heuristics loaded", heuristics.len());
        Self::new(heuristics, cell, cancel)
    }

    pub fn heuristics(&self) -> &[Heuristic] {
        &self.heuristics
    }

    /// Start the scorer on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Score until cancelled, then kill and reap outstanding checks
    pub async fn run(mut self) {
        info!("Score task started with {} heuristics", self.heuristics.len());

        loop {
            self.poll_once().await;
            self.cell.set(total_score(&self.heuristics));

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(SCORE_INTERVAL) => {}
            }
        }

        self.shutdown().await;
        info!("Score task going away");
    }

    /// Start due checks and collect finished ones
    pub async fn poll_once(&mut self) {
        let now = Instant::now();
        for heuristic in self.heuristics.iter_mut() {
            start_check(heuristic, now);
        }
        for heuristic in self.heuristics.iter_mut() {
            collect_check(heuristic, now).await;
        }
    }

    /// Kill and reap every outstanding check
    pub async fn shutdown(&mut self) {
        for heuristic in self.heuristics.iter_mut() {
            if let Some(mut check) = heuristic.running.take() {
                debug!("Killing heuristic '{}'", heuristic.program);
                if let Err(e) = check.child.kill().await {
                    warn!("Failed to kill heuristic '{}': {}", heuristic.program, e);
                }
            }
        }
    }
}

fn spawn_check(program: &str) -> Result<tokio::process::Child, Error> {
    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(program)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: the hook only makes async-signal-safe syscalls
    unsafe {
        command.pre_exec(sys::prepare_heuristic_child);
    }

    command.spawn().map_err(|e| Error::HeuristicSpawn {
        program: program.to_string(),
        reason: e.to_string(),
    })
}

/// Fork the check if it is due and none is outstanding
fn start_check(heuristic: &mut Heuristic, now: Instant) {
    if heuristic.running.is_some() {
        return;
    }
    if heuristic.next_run.is_some_and(|next| now < next) {
        return;
    }
    heuristic.next_run = Some(now + heuristic.interval);

    match spawn_check(&heuristic.program) {
        Ok(child) => {
            heuristic.running = Some(RunningCheck {
                child,
                started: now,
            })
        }
        Err(e) => {
            warn!("{}", e);
            heuristic.record_result(false);
        }
    }
}

/// Reap the check if it finished; kill it if it overran its interval
async fn collect_check(heuristic: &mut Heuristic, now: Instant) {
    let Some(check) = heuristic.running.as_mut() else {
        return;
    };

    match check.child.try_wait() {
        Ok(Some(status)) => {
            heuristic.running = None;
            // Exit code 0 and not killed by a signal
            heuristic.record_result(status.success());
        }
        Ok(None) => {
            if now.duration_since(check.started) < heuristic.interval {
                return;
            }
            warn!(
                "Heuristic '{}' still running after {:?}; killing it",
                heuristic.program, heuristic.interval
            );
            if let Err(e) = check.child.kill().await {
                warn!("Failed to kill heuristic '{}': {}", heuristic.program, e);
            }
            heuristic.running = None;
            heuristic.record_result(false);
        }
        Err(e) => {
            warn!("Failed to reap heuristic '{}': {}", heuristic.program, e);
            heuristic.running = None;
            heuristic.record_result(false);
        }
    }
}
