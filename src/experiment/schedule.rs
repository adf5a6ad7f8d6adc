//! Ground-truth rule-change schedules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::memory::RoundStamp;
use crate::task::TaskKind;

/// Threshold in force before any change.
pub const BASE_THRESHOLD: i64 = 100;

/// Threshold the schedule alternates to.
pub const ALT_THRESHOLD: i64 = 120;

/// Changes in `high` mode: five changes, six evenly sized segments.
pub const HIGH_MODE_CHANGES: usize = 5;

/// Shortest `high` mode segment, so that no two consecutive rounds both change.
const MIN_SEGMENT_ROUNDS: usize = 2;

/// How often the ground-truth threshold changes during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Constant threshold
    #[default]
    None,
    /// One change at the midpoint
    Low,
    /// Alternating segments
    High,
}

impl RuleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleMode::None => "none",
            RuleMode::Low => "low",
            RuleMode::High => "high",
        }
    }
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(RuleMode::None),
            "low" => Ok(RuleMode::Low),
            "high" => Ok(RuleMode::High),
            other => Err(Error::InvalidRequest(format!("unknown rule mode: {}", other))),
        }
    }
}

/// Per-round thresholds and rule-version ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSchedule {
    pub thresholds: Vec<i64>,
    pub versions: Vec<i64>,
}

impl ThresholdSchedule {
    /// Build the schedule for `rounds` rounds.
    ///
    /// The version id increments whenever the threshold differs from the
    /// previous round's. `high` mode splits the run into at most
    /// `HIGH_MODE_CHANGES + 1` segments of at least two rounds each; runs too
    /// short for that get fewer segments.
    pub fn build(rounds: usize, mode: RuleMode) -> Self {
        let segments = (rounds / MIN_SEGMENT_ROUNDS).clamp(1, HIGH_MODE_CHANGES + 1);

        let mut thresholds = Vec::with_capacity(rounds);
        let mut versions = Vec::with_capacity(rounds);
        let mut version = 1;

        for i in 0..rounds {
            let threshold = match mode {
                RuleMode::None => BASE_THRESHOLD,
                RuleMode::Low if i >= rounds / 2 => ALT_THRESHOLD,
                RuleMode::Low => BASE_THRESHOLD,
                RuleMode::High if (i * segments / rounds) % 2 == 1 => ALT_THRESHOLD,
                RuleMode::High => BASE_THRESHOLD,
            };
            if let Some(prev) = thresholds.last() {
                if *prev != threshold {
                    version += 1;
                }
            }
            thresholds.push(threshold);
            versions.push(version);
        }

        Self {
            thresholds,
            versions,
        }
    }

    /// Schedule for tasks whose rules never change: no threshold, one version.
    pub fn unscheduled(rounds: usize) -> Self {
        Self {
            thresholds: vec![0; rounds],
            versions: vec![1; rounds],
        }
    }

    pub fn for_task(kind: TaskKind, rounds: usize, mode: RuleMode) -> Self {
        if kind.follows_schedule() {
            Self::build(rounds, mode)
        } else {
            Self::unscheduled(rounds)
        }
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Ground truth of a round.
    pub fn stamp(&self, round: usize) -> RoundStamp {
        RoundStamp {
            round: round as i64,
            rule_version: self.versions.get(round).copied().unwrap_or(1),
            rule_threshold: self.thresholds.get(round).copied().unwrap_or(0),
        }
    }

    /// Rounds at which the rule version changes.
    pub fn change_points(&self) -> Vec<usize> {
        self.versions
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[0] != w[1])
            .map(|(i, _)| i + 1)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_mode_is_constant() {
        let s = ThresholdSchedule::build(8, RuleMode::None);
        assert!(s.thresholds.iter().all(|t| *t == BASE_THRESHOLD));
        assert!(s.versions.iter().all(|v| *v == 1));
        assert!(s.change_points().is_empty());
    }

    #[test]
    fn test_low_mode_changes_once_at_midpoint() {
        let s = ThresholdSchedule::build(20, RuleMode::Low);
        assert_eq!(s.change_points(), vec![10]);
        assert_eq!(s.thresholds[9], BASE_THRESHOLD);
        assert_eq!(s.thresholds[10], ALT_THRESHOLD);
        assert_eq!(s.versions[19], 2);
    }

    #[test]
    fn test_high_mode_segments() {
        let s = ThresholdSchedule::build(30, RuleMode::High);
        assert_eq!(s.change_points(), vec![5, 10, 15, 20, 25]);
        assert_eq!(s.versions[29], 6);
        assert_eq!(s.thresholds[5], ALT_THRESHOLD);
        assert_eq!(s.thresholds[10], BASE_THRESHOLD);
    }

    #[test]
    fn test_high_mode_never_changes_on_consecutive_rounds() {
        for (rounds, expected) in [
            (4, vec![2]),
            (10, vec![2, 4, 6, 8]),
            (20, vec![4, 7, 10, 14, 17]),
            (31, vec![6, 11, 16, 21, 26]),
        ] {
            let points = ThresholdSchedule::build(rounds, RuleMode::High).change_points();
            assert!(points.len() <= HIGH_MODE_CHANGES, "rounds={}", rounds);
            assert!(points.windows(2).all(|w| w[1] - w[0] >= 2), "rounds={}", rounds);
            assert_eq!(points, expected, "rounds={}", rounds);
        }
    }

    #[test]
    fn test_high_mode_too_short_to_change() {
        for rounds in [0, 1, 2, 3] {
            assert!(ThresholdSchedule::build(rounds, RuleMode::High).change_points().is_empty());
        }
    }

    #[test]
    fn test_unscheduled_tasks() {
        let s = ThresholdSchedule::for_task(TaskKind::LotteryV2, 3, RuleMode::High);
        assert_eq!(s.thresholds, vec![0, 0, 0]);
        assert_eq!(s.stamp(2).rule_version, 1);
        assert_eq!(s.stamp(2).round, 2);
    }

    #[test]
    fn test_rule_mode_parse() {
        assert_eq!("".parse::<RuleMode>().unwrap(), RuleMode::None);
        assert_eq!("HIGH".parse::<RuleMode>().unwrap(), RuleMode::High);
        assert!("often".parse::<RuleMode>().is_err());
    }
}
