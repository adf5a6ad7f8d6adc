//! Rules-based conclusion synthesis.
//!
//! Pure function of the run's numbers: identical statistics always produce
//! an identical conclusion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::stats::{count_flags, pair_key, GroupStats, TestResult};
use crate::config::ConclusionThresholds;
use crate::groups::Group;

/// Overall reading of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConclusionVerdict {
    InsufficientData,
    LearningObserved,
    LearningNotObserved,
    MemoryEffectSupported,
}

impl ConclusionVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConclusionVerdict::InsufficientData => "insufficient_data",
            ConclusionVerdict::LearningObserved => "learning_observed",
            ConclusionVerdict::LearningNotObserved => "learning_not_observed",
            ConclusionVerdict::MemoryEffectSupported => "memory_effect_supported",
        }
    }
}

impl std::fmt::Display for ConclusionVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict, claims and caveats with the metrics they were drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conclusion {
    pub verdict: ConclusionVerdict,
    pub claims: Vec<String>,
    pub caveats: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
}

fn p_value(tests: &BTreeMap<String, TestResult>, key: &str) -> f64 {
    tests.get(key).map(|t| t.p_value).unwrap_or(1.0)
}

fn mean_flag(flags: &[u8]) -> f64 {
    if flags.is_empty() {
        return 0.0;
    }
    count_flags(flags) as f64 / flags.len() as f64
}

/// Build the conclusion of a run.
///
/// The learning verdict comes from group C's trend. The memory-effect claim
/// needs C below both A and B with both differences significant.
pub fn synthesize_conclusion(
    stats: &BTreeMap<Group, GroupStats>,
    tests: &BTreeMap<String, TestResult>,
    trends: &BTreeMap<Group, Vec<u8>>,
    thresholds: &ConclusionThresholds,
) -> Conclusion {
    let mut verdict = ConclusionVerdict::InsufficientData;
    let mut claims = Vec::new();
    let mut caveats = Vec::new();
    let mut metrics = BTreeMap::new();

    match trends.get(&Group::C) {
        Some(flags) if flags.len() >= thresholds.min_trend_rounds && flags.len() >= 2 => {
            let (first, second) = flags.split_at(flags.len() / 2);
            let first = mean_flag(first);
            let second = mean_flag(second);
            metrics.insert("C_first_half_error_rate".to_string(), first);
            metrics.insert("C_second_half_error_rate".to_string(), second);
            if second < first {
                claims.push(
                    "Group C made fewer errors in the second half of the run than in the first: \
                     feedback, reflection and memory changed its behaviour."
                        .to_string(),
                );
                verdict = ConclusionVerdict::LearningObserved;
            } else {
                claims.push(
                    "Group C's error rate did not fall across rounds; no stable learning trend \
                     was observed."
                        .to_string(),
                );
                verdict = ConclusionVerdict::LearningNotObserved;
            }
        }
        _ => caveats.push(format!(
            "Group C has fewer than {} rounds; the learning trend cannot be assessed.",
            thresholds.min_trend_rounds
        )),
    }

    match (stats.get(&Group::A), stats.get(&Group::B), stats.get(&Group::C)) {
        (Some(a), Some(b), Some(c)) => {
            for (group, s) in [(Group::A, a), (Group::B, b), (Group::C, c)] {
                metrics.insert(format!("{}_error_rate", group), s.error_rate);
                metrics.insert(format!("{}_ci95_low", group), s.ci95_low);
                metrics.insert(format!("{}_ci95_high", group), s.ci95_high);
            }
            let p_ca = p_value(tests, &pair_key(Group::C, Group::A));
            let p_cb = p_value(tests, &pair_key(Group::C, Group::B));
            metrics.insert("p_C_vs_A".to_string(), p_ca);
            metrics.insert("p_C_vs_B".to_string(), p_cb);

            let significant = p_ca < thresholds.significance && p_cb < thresholds.significance;
            if c.error_rate < a.error_rate && c.error_rate < b.error_rate && significant {
                claims.push(format!(
                    "Group C's error rate is significantly lower than groups A and B \
                     (p<{}): abstracted rule memory beats no memory and raw case logs.",
                    thresholds.significance
                ));
                let reduction = (a.error_rate - c.error_rate) / a.error_rate.max(1e-9);
                metrics.insert("C_vs_A_relative_reduction".to_string(), reduction);
                if verdict == ConclusionVerdict::InsufficientData {
                    verdict = ConclusionVerdict::MemoryEffectSupported;
                }
            } else {
                caveats.push(
                    "Overall error rates do not show C < B < A with significance; more rounds \
                     or stricter feedback may be needed."
                        .to_string(),
                );
            }
        }
        _ => caveats.push(
            "Groups A, B and C are not all present; no between-group comparison was made."
                .to_string(),
        ),
    }

    for group in [Group::D, Group::E, Group::F] {
        let (Some(s), Some(a)) = (stats.get(&group), stats.get(&Group::A)) else {
            continue;
        };
        let p = p_value(tests, &pair_key(group, Group::A));
        metrics.insert(format!("{}_error_rate", group), s.error_rate);
        metrics.insert(format!("p_{}_vs_A", group), p);
        if s.error_rate < a.error_rate && p < thresholds.significance {
            claims.push(format!(
                "Group {}'s error rate is significantly lower than group A (p={:.4}).",
                group, p
            ));
        }
    }

    let unjudged: usize = stats.values().map(|s| s.unknown).sum();
    if unjudged > 0 {
        caveats.push(format!(
            "{} trials have no verdict (failed or cancelled executions) and are excluded from error rates.",
            unjudged
        ));
    }

    Conclusion {
        verdict,
        claims,
        caveats,
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::stats::compute_tests;
    use pretty_assertions::assert_eq;

    fn stats(correct: usize, incorrect: usize) -> GroupStats {
        let judged = correct + incorrect;
        GroupStats {
            n: judged,
            correct,
            incorrect,
            error_rate: if judged == 0 { 0.0 } else { incorrect as f64 / judged as f64 },
            ..GroupStats::default()
        }
    }

    fn inputs(
        a: (usize, usize),
        b: (usize, usize),
        c: (usize, usize),
        c_flags: Vec<u8>,
    ) -> (BTreeMap<Group, GroupStats>, BTreeMap<Group, Vec<u8>>) {
        let mut s = BTreeMap::new();
        s.insert(Group::A, stats(a.0, a.1));
        s.insert(Group::B, stats(b.0, b.1));
        s.insert(Group::C, stats(c.0, c.1));
        let mut trends = BTreeMap::new();
        trends.insert(Group::C, c_flags);
        (s, trends)
    }

    #[test]
    fn test_insufficient_data() {
        let conclusion = synthesize_conclusion(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &ConclusionThresholds::default(),
        );
        assert_eq!(conclusion.verdict, ConclusionVerdict::InsufficientData);
        assert!(conclusion.claims.is_empty());
        assert_eq!(conclusion.caveats.len(), 2);
    }

    #[test]
    fn test_learning_observed() {
        let mut flags = vec![1u8; 10];
        flags.extend(vec![0u8; 10]);
        let (s, trends) = inputs((10, 10), (10, 10), (10, 10), flags);
        let thresholds = ConclusionThresholds::default();
        let tests = compute_tests(&s, &trends, &thresholds);
        let conclusion = synthesize_conclusion(&s, &tests, &trends, &thresholds);
        assert_eq!(conclusion.verdict, ConclusionVerdict::LearningObserved);
        assert_eq!(conclusion.metrics["C_first_half_error_rate"], 1.0);
        assert_eq!(conclusion.metrics["C_second_half_error_rate"], 0.0);
    }

    #[test]
    fn test_learning_not_observed() {
        let (s, trends) = inputs((10, 10), (10, 10), (10, 10), vec![0u8; 12]);
        let thresholds = ConclusionThresholds::default();
        let tests = compute_tests(&s, &trends, &thresholds);
        let conclusion = synthesize_conclusion(&s, &tests, &trends, &thresholds);
        assert_eq!(conclusion.verdict, ConclusionVerdict::LearningNotObserved);
    }

    #[test]
    fn test_memory_effect_supported_with_short_trend() {
        let (s, trends) = inputs((5, 45), (10, 40), (45, 5), vec![0u8; 4]);
        let thresholds = ConclusionThresholds::default();
        let tests = compute_tests(&s, &trends, &thresholds);
        let conclusion = synthesize_conclusion(&s, &tests, &trends, &thresholds);
        assert_eq!(conclusion.verdict, ConclusionVerdict::MemoryEffectSupported);
        assert!(conclusion.metrics["C_vs_A_relative_reduction"] > 0.8);
        assert!(conclusion.metrics["p_C_vs_B"] < 0.05);
    }

    #[test]
    fn test_conclusion_is_deterministic() {
        let (s, trends) = inputs((5, 45), (10, 40), (45, 5), vec![1, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        let thresholds = ConclusionThresholds::default();
        let tests = compute_tests(&s, &trends, &thresholds);
        let first = serde_json::to_string(&synthesize_conclusion(&s, &tests, &trends, &thresholds)).unwrap();
        let second = serde_json::to_string(&synthesize_conclusion(&s, &tests, &trends, &thresholds)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_verdict_serializes_as_tag() {
        assert_eq!(
            serde_json::to_string(&ConclusionVerdict::MemoryEffectSupported).unwrap(),
            "\"memory_effect_supported\""
        );
    }
}
