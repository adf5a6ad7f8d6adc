//! Round-indexed views of a run: flag sequences, cumulative curves and
//! adaptation latency after rule changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::schedule::RuleMode;
use super::stats::GroupStats;
use crate::groups::Group;
use crate::memory::{RunId, Trial};

/// Running accuracy and error by round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Curves {
    pub cumulative_accuracy: Vec<f64>,
    pub cumulative_error: Vec<f64>,
}

/// Incorrect rounds between each rule change and the first correct answer after it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialAndError {
    /// Rounds at which the rule version changed
    pub change_points: Vec<usize>,
    /// Attempts per change point
    pub attempts: Vec<usize>,
    pub avg_attempts: f64,
    pub max_attempts: usize,
}

/// Per-round flags and ground truth recovered from stored trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundFlags {
    /// 1 for an incorrect or missing round
    pub flags: Vec<u8>,
    pub thresholds: Vec<i64>,
    pub versions: Vec<i64>,
}

/// Comparison view of one run, used to contrast rule-change modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeCurve {
    pub run_id: RunId,
    pub rule_mode: RuleMode,
    pub rounds: usize,
    pub thresholds: Vec<i64>,
    pub groups: Vec<Group>,
    pub overall: BTreeMap<Group, GroupStats>,
    pub curves: BTreeMap<Group, Curves>,
    /// Adaptation latency of group C
    pub trial_and_error: TrialAndError,
    /// First incorrect round per group, -1 if none
    pub first_error_round: BTreeMap<Group, i64>,
    /// First round at which group C had to revise its memory, -1 if never
    pub memory_change_start_round: i64,
    /// Memory revisions of group C per round (its incorrect flags)
    pub memory_changes_per_round: Vec<u8>,
}

/// Cumulative accuracy over `rounds` rounds. Rounds past the end of `flags`
/// count as errors.
pub fn build_cumulative_curves(flags: &[u8], rounds: usize) -> Curves {
    let mut accuracy = Vec::with_capacity(rounds);
    let mut error = Vec::with_capacity(rounds);
    let mut correct = 0usize;
    for i in 0..rounds {
        if flags.get(i).copied() == Some(0) {
            correct += 1;
        }
        let acc = correct as f64 / (i + 1) as f64;
        accuracy.push(acc);
        error.push(1.0 - acc);
    }
    Curves {
        cumulative_accuracy: accuracy,
        cumulative_error: error,
    }
}

/// Count incorrect rounds from each version change until the first correct
/// round, staying within that version's span.
pub fn compute_trial_and_error(versions: &[i64], flags: &[u8]) -> TrialAndError {
    let change_points: Vec<usize> = versions
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] != w[1])
        .map(|(i, _)| i + 1)
        .collect();

    let attempts: Vec<usize> = change_points
        .iter()
        .map(|&cp| {
            let version = versions[cp];
            (cp..flags.len().min(versions.len()))
                .take_while(|&i| versions[i] == version && flags[i] != 0)
                .count()
        })
        .collect();

    let max_attempts = attempts.iter().copied().max().unwrap_or(0);
    let avg_attempts = if attempts.is_empty() {
        0.0
    } else {
        attempts.iter().sum::<usize>() as f64 / attempts.len() as f64
    };

    TrialAndError {
        change_points,
        attempts,
        avg_attempts,
        max_attempts,
    }
}

/// Index of the first incorrect round, or -1.
pub fn first_error_round(flags: &[u8]) -> i64 {
    flags
        .iter()
        .position(|f| *f != 0)
        .map(|i| i as i64)
        .unwrap_or(-1)
}

/// Recover round flags from trials. Missing or unjudged rounds are flagged
/// incorrect; missing rule versions carry the previous round's (starting at 1).
pub fn extract_round_flags(trials: &[Trial], rounds: usize) -> RoundFlags {
    let mut flags = vec![1u8; rounds];
    let mut thresholds = vec![0i64; rounds];
    let mut versions = vec![0i64; rounds];

    for trial in trials {
        let Ok(round) = usize::try_from(trial.round) else {
            continue;
        };
        if round >= rounds {
            continue;
        }
        match trial.is_correct {
            Some(true) => flags[round] = 0,
            Some(false) => flags[round] = 1,
            None => {}
        }
        thresholds[round] = trial.rule_threshold;
        if trial.rule_version > 0 {
            versions[round] = trial.rule_version;
        }
    }

    let mut previous = 1;
    for version in versions.iter_mut() {
        if *version == 0 {
            *version = previous;
        }
        previous = *version;
    }

    RoundFlags {
        flags,
        thresholds,
        versions,
    }
}
