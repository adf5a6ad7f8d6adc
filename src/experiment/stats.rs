//! Per-group error rates, Wilson intervals and two-proportion z-tests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ConclusionThresholds;
use crate::groups::Group;
use crate::memory::Trial;

/// Aggregate outcome of a group's trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    /// All trials, judged or not
    pub n: usize,
    pub correct: usize,
    pub incorrect: usize,
    /// Trials without a verdict (failed executions, pending judgments)
    pub unknown: usize,
    /// Incorrect over judged trials
    pub error_rate: f64,
    pub ci95_low: f64,
    pub ci95_high: f64,
    pub total_tokens: i64,
    pub avg_tokens: f64,
}

impl GroupStats {
    pub fn judged(&self) -> usize {
        self.correct + self.incorrect
    }
}

/// Aggregate a set of trials. Unjudged trials count towards `n` only.
pub fn compute_group_stats(trials: &[Trial], z: f64) -> GroupStats {
    let mut stats = GroupStats {
        n: trials.len(),
        ..GroupStats::default()
    };
    for trial in trials {
        stats.total_tokens += trial.token_count;
        match trial.is_correct {
            Some(true) => stats.correct += 1,
            Some(false) => stats.incorrect += 1,
            None => stats.unknown += 1,
        }
    }

    let judged = stats.judged();
    if judged > 0 {
        stats.error_rate = stats.incorrect as f64 / judged as f64;
        let (low, high) = wilson_ci(stats.incorrect, judged, z);
        stats.ci95_low = low;
        stats.ci95_high = high;
    }
    if stats.n > 0 {
        stats.avg_tokens = stats.total_tokens as f64 / stats.n as f64;
    }
    stats
}

/// Wilson score interval for `k` successes out of `n`, clamped to [0, 1].
pub fn wilson_ci(k: usize, n: usize, z: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let n = n as f64;
    let p = k as f64 / n;
    let zz = z * z;
    let denominator = 1.0 + zz / n;
    let center = (p + zz / (2.0 * n)) / denominator;
    let half = (z / denominator) * ((p * (1.0 - p) + zz / (4.0 * n)) / n).sqrt();
    ((center - half).max(0.0), (center + half).min(1.0))
}

/// Two-sided two-proportion z-test. Returns `(p_value, z)`.
///
/// `z` is positive when the second proportion is larger. An empty sample, or
/// a zero pooled standard error, yields `(1, 0)`.
pub fn two_prop_z_test(x1: usize, n1: usize, x2: usize, n2: usize) -> (f64, f64) {
    if n1 == 0 || n2 == 0 {
        return (1.0, 0.0);
    }
    let (n1, n2) = (n1 as f64, n2 as f64);
    let p1 = x1 as f64 / n1;
    let p2 = x2 as f64 / n2;
    let pooled = (x1 + x2) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 || se.is_nan() {
        return (1.0, 0.0);
    }
    let z = (p2 - p1) / se;
    let p_value = 2.0 * (1.0 - normal_cdf(z.abs()));
    (p_value.clamp(0.0, 1.0), z)
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

/// Outcome of one significance test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub p_value: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_half_error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_half_error_rate: Option<f64>,
}

/// Key of a treatment-versus-control test, e.g. `C_vs_A`.
pub fn pair_key(treatment: Group, control: Group) -> String {
    format!("{}_vs_{}", treatment, control)
}

/// Key of a group's first-half-versus-second-half test, e.g. `C_trend`.
pub fn trend_key(group: Group) -> String {
    format!("{}_trend", group)
}

/// Treatment-versus-control tests for every pair present, plus a trend test
/// for every group with enough rounds.
pub fn compute_tests(
    stats: &BTreeMap<Group, GroupStats>,
    trends: &BTreeMap<Group, Vec<u8>>,
    thresholds: &ConclusionThresholds,
) -> BTreeMap<String, TestResult> {
    let mut tests = BTreeMap::new();

    for treatment in Group::TREATMENTS {
        let Some(t) = stats.get(&treatment) else {
            continue;
        };
        for control in Group::CONTROLS {
            let Some(c) = stats.get(&control) else {
                continue;
            };
            let (p_value, z) = two_prop_z_test(c.incorrect, c.judged(), t.incorrect, t.judged());
            tests.insert(
                pair_key(treatment, control),
                TestResult {
                    p_value,
                    z,
                    first_half_error_rate: None,
                    second_half_error_rate: None,
                },
            );
        }
    }

    for (group, flags) in trends {
        if let Some(result) = trend_test(flags, thresholds.min_trend_rounds) {
            tests.insert(trend_key(*group), result);
        }
    }
    tests
}

/// First half versus second half of a flag sequence; `None` when too short.
pub fn trend_test(flags: &[u8], min_rounds: usize) -> Option<TestResult> {
    if flags.len() < min_rounds.max(2) {
        return None;
    }
    let mid = flags.len() / 2;
    let (first, second) = flags.split_at(mid);
    let first_bad = count_flags(first);
    let second_bad = count_flags(second);
    let (p_value, z) = two_prop_z_test(first_bad, first.len(), second_bad, second.len());
    Some(TestResult {
        p_value,
        z,
        first_half_error_rate: Some(first_bad as f64 / first.len() as f64),
        second_half_error_rate: Some(second_bad as f64 / second.len() as f64),
    })
}

pub(crate) fn count_flags(flags: &[u8]) -> usize {
    flags.iter().filter(|f| **f != 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::RuleMode;
    use crate::task::TaskKind;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn trial(is_correct: Option<bool>, tokens: i64) -> Trial {
        Trial {
            id: 1,
            run_id: 1,
            task_type: TaskKind::Lottery,
            input: String::new(),
            output: String::new(),
            is_correct,
            memory_ids: Vec::new(),
            token_count: tokens,
            group: Group::C,
            round: 0,
            rule_mode: RuleMode::None,
            rule_version: 1,
            rule_threshold: 100,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_wilson_empty() {
        assert_eq!(wilson_ci(0, 0, 1.96), (0.0, 0.0));
    }

    #[test]
    fn test_wilson_matches_closed_form() {
        let (low, high) = wilson_ci(5, 10, 1.96);
        let zz = 1.96f64 * 1.96;
        let den = 1.0 + zz / 10.0;
        let center = (0.5 + zz / 20.0) / den;
        let half = (1.96 / den) * ((0.25 + zz / 40.0) / 10.0).sqrt();
        assert!((low - (center - half)).abs() < 1e-12);
        assert!((high - (center + half)).abs() < 1e-12);
        assert!(low < 0.5 && high > 0.5);
        assert!(((low + high) / 2.0 - center).abs() < 1e-12);
    }

    #[test]
    fn test_wilson_clamped() {
        let (low, high) = wilson_ci(0, 3, 1.96);
        assert_eq!(low, 0.0);
        assert!(high > 0.0 && high <= 1.0);
        let (_, high) = wilson_ci(3, 3, 1.96);
        assert!(high <= 1.0);
    }

    #[test]
    fn test_z_test_empty_sample() {
        assert_eq!(two_prop_z_test(0, 0, 5, 10), (1.0, 0.0));
        assert_eq!(two_prop_z_test(5, 10, 0, 0), (1.0, 0.0));
    }

    #[test]
    fn test_z_test_zero_variance() {
        assert_eq!(two_prop_z_test(0, 10, 0, 10), (1.0, 0.0));
    }

    #[test]
    fn test_z_test_direction_and_significance() {
        let (p, z) = two_prop_z_test(15, 20, 2, 20);
        assert!(z < 0.0);
        assert!(p < 0.05);
        let (p_same, z_same) = two_prop_z_test(5, 10, 5, 10);
        assert!(z_same.abs() < 1e-12);
        assert!((p_same - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_stats_exclude_unjudged() {
        let trials = vec![
            trial(Some(true), 10),
            trial(Some(false), 10),
            trial(Some(false), 10),
            trial(None, 0),
        ];
        let stats = compute_group_stats(&trials, 1.96);
        assert_eq!(stats.n, 4);
        assert_eq!(stats.correct, 1);
        assert_eq!(stats.incorrect, 2);
        assert_eq!(stats.unknown, 1);
        assert!((stats.error_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.total_tokens, 30);
        assert!((stats.avg_tokens - 7.5).abs() < 1e-12);
        assert!(stats.ci95_low <= stats.error_rate && stats.error_rate <= stats.ci95_high);
    }

    #[test]
    fn test_group_stats_without_verdicts() {
        let stats = compute_group_stats(&[trial(None, 0)], 1.96);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!((stats.ci95_low, stats.ci95_high), (0.0, 0.0));
    }

    #[test]
    fn test_compute_tests_pairs_and_trends() {
        let mut stats = BTreeMap::new();
        stats.insert(Group::A, GroupStats { n: 10, correct: 2, incorrect: 8, ..GroupStats::default() });
        stats.insert(Group::C, GroupStats { n: 10, correct: 8, incorrect: 2, ..GroupStats::default() });
        let mut trends = BTreeMap::new();
        trends.insert(Group::A, vec![1u8; 4]);
        trends.insert(Group::C, vec![1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 1, 0]);

        let tests = compute_tests(&stats, &trends, &ConclusionThresholds::default());
        let keys: Vec<&str> = tests.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["C_trend", "C_vs_A"]);

        let trend = &tests["C_trend"];
        assert_eq!(trend.first_half_error_rate, Some(4.0 / 6.0));
        assert_eq!(trend.second_half_error_rate, Some(1.0 / 6.0));
        assert!(tests["C_vs_A"].z < 0.0);
    }

    #[test]
    fn test_trend_serialization_omits_empty_rates() {
        let result = TestResult {
            p_value: 1.0,
            z: 0.0,
            first_half_error_rate: None,
            second_half_error_rate: None,
        };
        assert_eq!(serde_json::to_string(&result).unwrap(), r#"{"p_value":1.0,"z":0.0}"#);
    }
}
