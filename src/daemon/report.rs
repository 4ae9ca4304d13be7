//! Status Report
//!
//! Human-readable snapshot of the local view, rewritten every cycle to the
//! configured status file ("-" for stdout).

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;

use crate::heuristic::Score;
use crate::protocol::NodeState;
use crate::state::NodeTracker;

/// Everything the report shows
pub struct StatusReport<'a> {
    pub my_id: u32,
    pub state: NodeState,
    pub score: Score,
    pub required: u32,
    pub master: Option<u32>,
    pub tracker: &'a NodeTracker,
    /// Append the per-node dump
    pub debug: bool,
}

impl StatusReport<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let now = chrono::Local::now();

        let _ = writeln!(out, "Time Stamp: {}", now.format("%a %b %e %H:%M:%S %Y"));
        let _ = writeln!(out, "Node ID: {}", self.my_id);
        let _ = writeln!(
            out,
            "Score: {}/{} (Minimum required = {})",
            self.score.score, self.score.max, self.required
        );
        let _ = writeln!(out, "Current state: {}", self.state);

        let nodes = self.tracker.nodes();
        let initializing = nodes
            .iter()
            .filter(|n| n.status.state == NodeState::Init && n.seen > 0)
            .map(|n| n.node_id());
        let _ = writeln!(out, "Initializing Set: {}", id_set(initializing));

        let visible = nodes
            .iter()
            .filter(|n| n.state.is_running() || n.node_id() == self.my_id)
            .map(|n| n.node_id());
        let _ = writeln!(out, "Visible Set: {}", id_set(visible));

        if self.state != NodeState::Init {
            match self.master {
                Some(master) => {
                    let _ = writeln!(out, "Master Node ID: {}", master);
                    if let Some(info) = self.tracker.node(master) {
                        let _ = writeln!(out, "Quorate Set: {}", info.status.master_mask);
                    }
                }
                None => {
                    let _ = writeln!(out, "Master Node ID: (none)");
                }
            }
        }

        if self.debug {
            for info in nodes {
                let _ = writeln!(out, "{}", info);
            }
        }

        out.push('\n');
        out
    }
}

fn id_set(ids: impl Iterator<Item = u32>) -> String {
    let mut out = String::from("{");
    for id in ids {
        let _ = write!(out, " {}", id);
    }
    out.push_str(" }");
    out
}

/// Write a rendered report, truncating the target file
pub fn write_report(target: &str, text: &str) -> std::io::Result<()> {
    if target == "-" {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        return stdout.flush();
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(target)?;
    file.write_all(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusBlock;

    fn tracker_with(states: &[(u32, NodeState)]) -> NodeTracker {
        let mut tracker = NodeTracker::new(1, 3, 1);
        // Two heartbeats each, enough to join with tko_up = 1
        for ts in 1..=2 {
            for &(node_id, state) in states {
                let block = StatusBlock {
                    update_node: node_id,
                    timestamp: ts,
                    state,
                    incarnation: 7,
                    ..StatusBlock::empty(node_id)
                };
                tracker.observe(block).unwrap();
            }
            tracker.check_transitions(false);
        }
        tracker
    }

    #[test]
    fn test_report_sets() {
        let tracker = tracker_with(&[(1, NodeState::Run), (2, NodeState::Run), (3, NodeState::Init)]);
        let report = StatusReport {
            my_id: 1,
            state: NodeState::Run,
            score: Score { score: 2, max: 3 },
            required: 2,
            master: None,
            tracker: &tracker,
            debug: false,
        };
        let text = report.render();

        assert!(text.contains("Node ID: 1\n"));
        assert!(text.contains("Score: 2/3 (Minimum required = 2)\n"));
        assert!(text.contains("Current state: Running\n"));
        assert!(text.contains("Initializing Set: { 3 }\n"));
        assert!(text.contains("Visible Set: { 1 2 3 }\n"));
        assert!(text.contains("Master Node ID: (none)\n"));
        assert!(!text.contains("Quorate Set"));
    }

    #[test]
    fn test_report_skips_master_while_initializing() {
        let tracker = tracker_with(&[]);
        let report = StatusReport {
            my_id: 4,
            state: NodeState::Init,
            score: Score::FIXED,
            required: 1,
            master: None,
            tracker: &tracker,
            debug: false,
        };
        let text = report.render();
        assert!(text.contains("Visible Set: { 4 }\n"));
        assert!(!text.contains("Master Node ID"));
    }

    #[test]
    fn test_write_report_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status");
        let target = path.to_str().unwrap();

        write_report(target, "a much longer first report\n").unwrap();
        write_report(target, "short\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short\n");
    }
}
