//! Heuristic Scoring
//!
//! A node's fitness is the sum of the weights of its heuristics that are
//! currently passing. Each heuristic is an external command run on its own
//! interval by the `HeuristicScorer` task.

mod scorer;

pub use scorer::HeuristicScorer;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::HeuristicConfig;

/// Fitness score and its maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Score {
    pub score: u32,
    pub max: u32,
}

impl Score {
    /// Score used when no heuristics are configured
    pub const FIXED: Score = Score { score: 1, max: 1 };

    /// Minimum score needed for the node to take part
    ///
    /// `min_score` of 0 means a simple majority of the maximum.
    pub fn required(&self, min_score: u32) -> u32 {
        if min_score > 0 {
            min_score
        } else {
            self.max / 2 + 1
        }
    }
}

/// Score shared between the scorer task and the quorum loop
#[derive(Debug, Clone, Default)]
pub struct ScoreCell(Arc<Mutex<Score>>);

impl ScoreCell {
    pub fn new(initial: Score) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> Score {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, score: Score) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = score;
    }
}

/// A check in progress
pub(crate) struct RunningCheck {
    pub(crate) child: Child,
    pub(crate) started: Instant,
}

/// One configured heuristic and its runtime state
pub struct Heuristic {
    pub program: String,
    pub weight: u32,
    pub interval: Duration,
    /// Consecutive failures tolerated before going unavailable
    pub tko: u32,
    pub(crate) next_run: Option<Instant>,
    pub(crate) running: Option<RunningCheck>,
    available: bool,
    misses: u32,
}

impl Heuristic {
    pub fn new(program: impl Into<String>, weight: u32, interval: Duration, tko: u32) -> Self {
        Self {
            program: program.into(),
            weight: weight.max(1),
            interval: if interval.is_zero() {
                Duration::from_secs(2)
            } else {
                interval
            },
            tko: tko.max(1),
            next_run: None,
            running: None,
            available: false,
            misses: 0,
        }
    }

    pub fn from_config(config: &HeuristicConfig) -> Self {
        let heuristic = Self::new(
            config.program.clone(),
            config.score(),
            config.interval(),
            config.tko(),
        );
        debug!(
            "Heuristic: '{}' score={} interval={:?} tko={}",
            heuristic.program, heuristic.weight, heuristic.interval, heuristic.tko
        );
        heuristic
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    /// Apply the result of one check
    pub fn record_result(&mut self, success: bool) {
        if success {
            if !self.available {
                self.available = true;
                info!("Heuristic: '{}' UP", self.program);
            }
            self.misses = 0;
            return;
        }

        // Only a heuristic that is up can go down
        if !self.available {
            return;
        }

        self.misses += 1;
        if self.misses >= self.tko {
            info!(
                "Heuristic: '{}' DOWN ({}/{})",
                self.program, self.misses, self.tko
            );
            self.available = false;
        } else {
            debug!(
                "Heuristic: '{}' missed ({}/{})",
                self.program, self.misses, self.tko
            );
        }
    }
}

/// Sum of available weights and of all weights
pub fn total_score(heuristics: &[Heuristic]) -> Score {
    if heuristics.is_empty() {
        return Score::FIXED;
    }

    heuristics.iter().fold(Score::default(), |mut acc, h| {
        acc.max += h.weight;
        if h.available {
            acc.score += h.weight;
        }
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heuristic(weight: u32, tko: u32) -> Heuristic {
        Heuristic::new("true", weight, Duration::from_secs(2), tko)
    }

    #[test]
    fn test_no_heuristics_scores_one() {
        assert_eq!(total_score(&[]), Score { score: 1, max: 1 });
    }

    #[test]
    fn test_score_sums_available_weights() {
        let mut hs = vec![heuristic(1, 1), heuristic(2, 1), heuristic(4, 1)];
        assert_eq!(total_score(&hs), Score { score: 0, max: 7 });

        hs[0].record_result(true);
        hs[2].record_result(true);
        assert_eq!(total_score(&hs), Score { score: 5, max: 7 });
    }

    #[test]
    fn test_tolerance_hysteresis() {
        let mut hs = vec![heuristic(1, 1), heuristic(5, 2)];
        hs[0].record_result(true);
        hs[1].record_result(true);
        assert_eq!(total_score(&hs).score, 6);

        hs[1].record_result(false);
        assert!(hs[1].is_available());
        assert_eq!(total_score(&hs).score, 6);

        hs[1].record_result(false);
        assert!(!hs[1].is_available());
        assert_eq!(total_score(&hs).score, 1);

        // A success resets the miss counter
        hs[1].record_result(true);
        hs[1].record_result(false);
        assert_eq!(hs[1].misses(), 1);
        assert!(hs[1].is_available());
    }

    #[test]
    fn test_unavailable_does_not_count_misses() {
        let mut h = heuristic(1, 3);
        h.record_result(false);
        h.record_result(false);
        assert_eq!(h.misses(), 0);
        assert!(!h.is_available());
    }

    #[test]
    fn test_defaults_clamped() {
        let h = Heuristic::new("x", 0, Duration::ZERO, 0);
        assert_eq!(h.weight, 1);
        assert_eq!(h.interval, Duration::from_secs(2));
        assert_eq!(h.tko, 1);
    }

    #[test]
    fn test_required_score() {
        let score = Score { score: 3, max: 5 };
        assert_eq!(score.required(0), 3);
        assert_eq!(score.required(2), 2);
        assert_eq!(Score::FIXED.required(0), 1);
    }

    #[test]
    fn test_score_cell_shared() {
        let cell = ScoreCell::new(Score::FIXED);
        let other = cell.clone();
        other.set(Score { score: 2, max: 4 });
        assert_eq!(cell.get(), Score { score: 2, max: 4 });
    }
}
