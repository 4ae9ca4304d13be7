//! System Helpers
//!
//! Scheduling class, memory locking, clocks and privilege checks.

use nix::errno::Errno;
use nix::sys::mman::{mlockall, MlockAllFlags};
use nix::unistd::Uid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Scheduling class for the quorum loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    #[default]
    Rr,
    Fifo,
    Other,
}

impl Scheduler {
    fn policy(self) -> libc::c_int {
        match self {
            Scheduler::Rr => libc::SCHED_RR,
            Scheduler::Fifo => libc::SCHED_FIFO,
            Scheduler::Other => libc::SCHED_OTHER,
        }
    }
}

/// Apply a scheduling class to the calling thread
///
/// For `Other`, `priority` is a nice value. Failures are logged only.
pub fn set_priority(scheduler: Scheduler, priority: i32) {
    let (param, what) = match scheduler {
        Scheduler::Other => (libc::sched_param { sched_priority: 0 }, "nice"),
        _ => (
            libc::sched_param {
                sched_priority: priority,
            },
            "sched_setscheduler",
        ),
    };

    // SAFETY: plain syscalls on the calling thread with a valid param
    let failed = unsafe {
        let ret = libc::sched_setscheduler(0, scheduler.policy(), &param);
        if scheduler == Scheduler::Other {
            Errno::clear();
            libc::nice(priority) == -1 && Errno::last() != Errno::UnknownErrno
        } else {
            ret < 0
        }
    };

    if failed {
        warn!("set_priority [{}] failed: {}", what, Errno::last());
    } else {
        debug!("Scheduling set to {:?} priority {}", scheduler, priority);
    }
}

/// Lock current and future pages in memory; failure is not fatal
pub fn lock_memory() {
    if let Err(e) = mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        warn!("Unable to mlockall(): {}", e);
    }
}

/// Reset a freshly forked heuristic child before exec
///
/// Runs between fork and exec, so it only makes raw syscalls.
pub fn prepare_heuristic_child() -> std::io::Result<()> {
    // SAFETY: async-signal-safe syscalls only
    unsafe {
        let param = libc::sched_param { sched_priority: 0 };
        libc::sched_setscheduler(0, libc::SCHED_OTHER, &param);
        libc::nice(-1);
        libc::munlockall();

        for sig in 1..libc::SIGRTMAX() {
            if sig != libc::SIGKILL && sig != libc::SIGSTOP {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
    Ok(())
}

/// Current time as microseconds
///
/// With `use_uptime` the monotonic clock is used, so wall clock jumps do
/// not look like missed or doubled heartbeats.
pub fn now_micros(use_uptime: bool) -> u64 {
    let clock = if use_uptime {
        nix::time::ClockId::CLOCK_MONOTONIC
    } else {
        nix::time::ClockId::CLOCK_REALTIME
    };

    match nix::time::clock_gettime(clock) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000,
        Err(_) => chrono::Utc::now().timestamp_micros().max(0) as u64,
    }
}

/// Running as root
pub fn is_root() -> bool {
    Uid::effective().is_root()
}
