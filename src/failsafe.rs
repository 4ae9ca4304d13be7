//! Fail-Safe Reboot
//!
//! When the daemon detects it can no longer be trusted to take part in the
//! cluster, it removes itself by rebooting the host rather than risk a
//! split brain.

use serde::Serialize;
use tracing::error;

/// Why the fail-safe path was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailSafeReason {
    /// The master wrote an eviction notice into our slot
    EvictedByMaster,
    /// Heuristic score dropped below the required minimum
    ScoreInsufficient,
    /// A cycle took longer than interval x tko
    CycleOverrun,
    /// Our own status block could not be written for tko cycles
    LocalWriteFailures,
    /// Initialization failed and the cluster could not be left cleanly
    CannotLeaveCluster,
}

impl std::fmt::Display for FailSafeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailSafeReason::EvictedByMaster => write!(f, "evicted by the quorum master"),
            FailSafeReason::ScoreInsufficient => write!(f, "heuristic score insufficient"),
            FailSafeReason::CycleOverrun => write!(f, "cycle exceeded the eviction timeout"),
            FailSafeReason::LocalWriteFailures => write!(f, "unable to write our status block"),
            FailSafeReason::CannotLeaveCluster => write!(f, "unable to leave the cluster"),
        }
    }
}

/// Last-resort self removal
pub trait FailSafe: Send {
    fn trigger(&self, reason: FailSafeReason);
}

/// Reboots the host immediately
pub struct RebootFailSafe {
    /// Log instead of rebooting
    debug: bool,
}

impl RebootFailSafe {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl FailSafe for RebootFailSafe {
    fn trigger(&self, reason: FailSafeReason) {
        if self.debug {
            error!("Fail-safe reboot averted (debug mode): {}", reason);
            return;
        }

        error!("Rebooting: {}", reason);
        if let Err(e) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
            error!("Reboot failed: {}", e);
        }
    }
}
