//! qdiskd Configuration
//!
//! This module provides configuration structures for the quorum disk
//! daemon: the `[quorumd]` section, zero or more `[[heuristic]]` entries
//! and `[logging]`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::sys::Scheduler;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/qdiskd/qdiskd.toml";

/// Smallest accepted tko
pub const MIN_TKO: u32 = 3;

/// Main qdiskd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumdConfig {
    /// Quorum daemon settings
    pub quorumd: QuorumdSection,

    /// Heuristics contributing to the node's score
    #[serde(default, rename = "heuristic")]
    pub heuristics: Vec<HeuristicConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[quorumd]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumdSection {
    /// Quorum disk device path
    #[serde(default)]
    pub device: Option<PathBuf>,

    /// Quorum disk label; takes precedence over `device`
    #[serde(default)]
    pub label: Option<String>,

    /// Seconds between cycles
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Missed cycles before a node is declared dead
    #[serde(default = "default_tko")]
    pub tko: u32,

    /// Cycles a node must be seen before it joins (default tko/2)
    #[serde(default)]
    pub tko_up: Option<u32>,

    /// Cycles to wait after a fitness upgrade before bidding (default tko/3)
    #[serde(default)]
    pub upgrade_wait: Option<u32>,

    /// Cycles a bid must be held before taking the master role (default tko/3)
    #[serde(default)]
    pub master_wait: Option<u32>,

    /// Votes the quorum device is worth
    #[serde(default = "default_votes")]
    pub votes: u32,

    /// Minimum score; 0 means a majority of the maximum
    #[serde(default)]
    pub min_score: u32,

    /// Scheduling class for the quorum loop
    #[serde(default)]
    pub scheduler: Scheduler,

    /// Real-time priority, or nice value for `other`
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Reboot when the score drops below the minimum
    #[serde(default = "default_true")]
    pub reboot: bool,

    /// Leave the cluster if the quorum disk cannot be used
    #[serde(default)]
    pub stop_cman: bool,

    /// Reboot if a cycle takes longer than interval x tko
    #[serde(default)]
    pub paranoid: bool,

    /// Ask the cluster manager to fence evicted nodes
    #[serde(default = "default_true")]
    pub allow_kill: bool,

    /// Time cycles with the monotonic clock instead of the wall clock
    #[serde(default = "default_true")]
    pub use_uptime: bool,

    /// Consecutive cycles with I/O errors before giving up (0 = never)
    #[serde(default)]
    pub max_error_cycles: u32,

    /// Status report file; "-" for stdout
    #[serde(default)]
    pub status_file: Option<String>,

    /// Name the device is registered under with the cluster manager
    #[serde(default)]
    pub cman_label: Option<String>,

    /// Cluster manager control socket
    #[serde(default = "default_cluster_socket")]
    pub cluster_socket: PathBuf,
}

/// `[[heuristic]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeuristicConfig {
    /// Shell command; exit status 0 means the check passed
    pub program: String,

    /// Weight added to the score while the check passes
    #[serde(default = "default_heuristic_score")]
    pub score: i64,

    /// Seconds between runs
    #[serde(default = "default_heuristic_interval")]
    pub interval: i64,

    /// Consecutive failures before the check counts as down
    #[serde(default = "default_heuristic_tko")]
    pub tko: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_interval() -> u64 {
    1
}

fn default_tko() -> u32 {
    10
}

fn default_votes() -> u32 {
    1
}

fn default_priority() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_cluster_socket() -> PathBuf {
    PathBuf::from("/var/run/cman/qdisk.sock")
}

fn default_heuristic_score() -> i64 {
    1
}

fn default_heuristic_interval() -> i64 {
    2
}

fn default_heuristic_tko() -> i64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for QuorumdSection {
    fn default() -> Self {
        Self {
            device: None,
            label: None,
            interval: default_interval(),
            tko: default_tko(),
            tko_up: None,
            upgrade_wait: None,
            master_wait: None,
            votes: default_votes(),
            min_score: 0,
            scheduler: Scheduler::default(),
            priority: default_priority(),
            reboot: true,
            stop_cman: false,
            paranoid: false,
            allow_kill: true,
            use_uptime: true,
            max_error_cycles: 0,
            status_file: None,
            cman_label: None,
            cluster_socket: default_cluster_socket(),
        }
    }
}

impl HeuristicConfig {
    /// Weight, with non-positive values replaced by 1
    pub fn score(&self) -> u32 {
        if self.score <= 0 {
            1
        } else {
            self.score.min(u32::MAX as i64) as u32
        }
    }

    /// Run interval, with non-positive values replaced by 2 seconds
    pub fn interval(&self) -> Duration {
        if self.interval <= 0 {
            Duration::from_secs(2)
        } else {
            Duration::from_secs(self.interval as u64)
        }
    }

    /// Failure tolerance, with non-positive values replaced by 1
    pub fn tko(&self) -> u32 {
        if self.tko <= 0 {
            1
        } else {
            self.tko.min(u32::MAX as i64) as u32
        }
    }
}

impl QuorumdSection {
    /// Clamp values below their minimums
    pub fn normalize(&mut self) {
        if self.interval < 1 {
            warn!("interval {} too small; using 1", self.interval);
            self.interval = 1;
        }
        if self.tko < MIN_TKO {
            warn!("tko {} too small; using {}", self.tko, MIN_TKO);
            self.tko = MIN_TKO;
        }
    }

    /// Cycle interval
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Longest a cycle may take before other nodes evict us
    pub fn max_cycle_time(&self) -> Duration {
        self.interval() * self.tko
    }

    /// Cycles a node must be seen before it joins
    pub fn tko_up(&self) -> u32 {
        self.tko_up.unwrap_or(self.tko / 2).max(1)
    }

    /// Cycles to wait after a fitness upgrade before bidding
    pub fn upgrade_wait(&self) -> u32 {
        self.upgrade_wait.unwrap_or(self.tko / 3).max(1)
    }

    /// Cycles a bid must be held before taking the master role
    pub fn master_wait(&self) -> u32 {
        self.master_wait.unwrap_or(self.tko / 3).max(1)
    }

    /// Adopt the settings that may change while running
    pub fn apply_dynamic(&mut self, other: &QuorumdSection) {
        self.status_file = other.status_file.clone();
        self.scheduler = other.scheduler;
        self.priority = other.priority;
        self.reboot = other.reboot;
        self.stop_cman = other.stop_cman;
        self.paranoid = other.paranoid;
        self.allow_kill = other.allow_kill;
        self.max_error_cycles = other.max_error_cycles;
    }
}

impl QuorumdConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let mut config: QuorumdConfig = toml::from_str(content)?;
        config.quorumd.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.quorumd.device.is_none() && self.quorumd.label.is_none() {
            return Err(crate::Error::Config(
                "quorumd.device or quorumd.label must be set".into(),
            ));
        }

        if let Some(label) = &self.quorumd.label {
            if label.is_empty() {
                return Err(crate::Error::Config("quorumd.label cannot be empty".into()));
            }
        }

        for (i, h) in self.heuristics.iter().enumerate() {
            if h.program.trim().is_empty() {
                return Err(crate::Error::Config(format!(
                    "heuristic[{}].program cannot be empty",
                    i + 1
                )));
            }
        }

        Ok(())
    }

    /// Sum of all heuristic weights
    pub fn max_score(&self) -> u32 {
        if self.heuristics.is_empty() {
            return 1;
        }
        self.heuristics.iter().map(|h| h.score()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[quorumd]
label = "prodqdisk"
interval = 2
tko = 12
votes = 3
scheduler = "fifo"
priority = 10
paranoid = true
status_file = "-"

[[heuristic]]
program = "ping -c1 -w1 10.0.0.254"
score = 2

[[heuristic]]
program = "test -f /etc/ok"
interval = 5
tko = 3

[logging]
level = "debug"
"#;

        let config = QuorumdConfig::from_str(toml).unwrap();
        let q = &config.quorumd;
        assert_eq!(q.label.as_deref(), Some("prodqdisk"));
        assert_eq!(q.interval(), Duration::from_secs(2));
        assert_eq!(q.scheduler, Scheduler::Fifo);
        assert_eq!(q.tko_up(), 6);
        assert_eq!(q.upgrade_wait(), 4);
        assert_eq!(q.master_wait(), 4);
        assert_eq!(q.max_cycle_time(), Duration::from_secs(24));
        assert!(q.paranoid);
        assert!(q.reboot);

        assert_eq!(config.heuristics.len(), 2);
        assert_eq!(config.heuristics[0].score(), 2);
        assert_eq!(config.heuristics[0].interval(), Duration::from_secs(2));
        assert_eq!(config.heuristics[1].tko(), 3);
        assert_eq!(config.max_score(), 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults_and_clamping() {
        let toml = r#"
[quorumd]
device = "/dev/sdb1"
interval = 0
tko = 1

[[heuristic]]
program = "true"
score = -4
interval = 0
tko = -1
"#;

        let config = QuorumdConfig::from_str(toml).unwrap();
        let q = &config.quorumd;
        assert_eq!(q.interval, 1);
        assert_eq!(q.tko, MIN_TKO);
        assert_eq!(q.tko_up(), 1);
        assert_eq!(q.upgrade_wait(), 1);
        assert_eq!(q.master_wait(), 1);
        assert_eq!(q.votes, 1);
        assert!(q.allow_kill);
        assert!(q.use_uptime);
        assert!(!q.stop_cman);
        assert_eq!(q.max_error_cycles, 0);

        let h = &config.heuristics[0];
        assert_eq!(h.score(), 1);
        assert_eq!(h.interval(), Duration::from_secs(2));
        assert_eq!(h.tko(), 1);
    }

    #[test]
    fn test_explicit_waits() {
        let toml = r#"
[quorumd]
device = "/dev/sdb1"
tko_up = 2
upgrade_wait = 0
master_wait = 5
"#;
        let q = QuorumdConfig::from_str(toml).unwrap().quorumd;
        assert_eq!(q.tko_up(), 2);
        assert_eq!(q.upgrade_wait(), 1);
        assert_eq!(q.master_wait(), 5);
        assert_eq!(q.tko_up.unwrap_or(0), 2);
    }

    #[test]
    fn test_missing_device_rejected() {
        let result = QuorumdConfig::from_str("[quorumd]\ntko = 5\n");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_empty_heuristic_rejected() {
        let toml = "[quorumd]\ndevice = \"/dev/sdb\"\n[[heuristic]]\nprogram = \"\"\n";
        assert!(QuorumdConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_apply_dynamic() {
        let mut current = QuorumdSection::default();
        let mut updated = QuorumdSection::default();
        updated.tko = 20;
        updated.paranoid = true;
        updated.scheduler = Scheduler::Other;
        updated.status_file = Some("/tmp/qdisk.status".into());

        current.apply_dynamic(&updated);
        assert!(current.paranoid);
        assert_eq!(current.scheduler, Scheduler::Other);
        assert_eq!(current.status_file.as_deref(), Some("/tmp/qdisk.status"));
        // Static settings are untouched
        assert_eq!(current.tko, 10);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qdiskd.toml");
        std::fs::write(&path, "[quorumd]\nlabel = \"q\"\n").unwrap();
        let config = QuorumdConfig::from_file(&path).unwrap();
        assert_eq!(config.quorumd.tko, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.heuristics.is_empty());
        assert_eq!(config.max_score(), 1);
    }
}
