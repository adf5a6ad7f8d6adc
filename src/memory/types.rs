//! Entities persisted by the memory store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::experiment::RuleMode;
use crate::groups::Group;
use crate::normalize::{extract_threshold, is_global_provenance, normalize_trigger_key};
use crate::task::TaskKind;

pub type RuleId = i64;
pub type RunId = i64;
pub type TrialId = i64;
pub type JudgmentId = i64;

/// Run id of trials executed outside any experiment, and of the global pool.
pub const AD_HOC_RUN: RunId = 0;

/// A versioned, confidence-scored lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    /// Owning run; `0` for ad hoc rules and the global pool
    pub run_id: RunId,
    pub trigger: String,
    /// Family merge key derived from `trigger`
    pub trigger_key: String,
    pub lesson: String,
    /// Task type the rule applies to, or the wildcard
    pub apply_to: String,
    /// Provenance: judgment explanation, or a `global|` tag for pool entries
    pub derived_from: String,
    pub confidence: f64,
    pub version: i64,
    pub use_count: i64,
    pub failure_count: i64,
    pub deprecated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Whether this rule belongs to the cross-session pool.
    pub fn is_global(&self) -> bool {
        self.run_id == AD_HOC_RUN && is_global_provenance(&self.derived_from)
    }

    /// Threshold embedded in the rule text, if any.
    pub fn threshold(&self) -> Option<i64> {
        extract_threshold(&format!("{} {}", self.trigger, self.lesson))
    }

    /// Whether the rule was verified at or after the given instant.
    pub fn verified_since(&self, at: DateTime<Utc>) -> bool {
        self.last_verified_at.is_some_and(|v| v >= at)
    }
}

/// A rule about to be inserted. The store assigns id and version.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub run_id: RunId,
    pub trigger: String,
    pub lesson: String,
    pub apply_to: String,
    pub derived_from: String,
    pub confidence: f64,
}

impl NewRule {
    pub fn new(
        run_id: RunId,
        trigger: impl Into<String>,
        lesson: impl Into<String>,
        apply_to: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            trigger: trigger.into(),
            lesson: lesson.into(),
            apply_to: apply_to.into(),
            derived_from: String::new(),
            confidence: 0.8,
        }
    }

    pub fn with_provenance(mut self, derived_from: impl Into<String>) -> Self {
        self.derived_from = derived_from.into();
        self
    }

    /// Set the confidence, clamped to [0, 1].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn trigger_key(&self) -> String {
        normalize_trigger_key(&self.trigger)
    }
}

/// Clamp a confidence value into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Which rules a retrieval may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalScope {
    /// Every non-deprecated rule, regardless of run
    Unscoped,
    /// Only rules of the given run
    RunIsolated(RunId),
    /// Rules of the given run plus the global pool
    RunPlusGlobal(RunId),
}

impl RetrievalScope {
    /// Scope for a run; ad hoc trials are never run-scoped.
    pub fn for_run(run_id: RunId, include_global: bool) -> Self {
        match (run_id, include_global) {
            (AD_HOC_RUN, _) => RetrievalScope::Unscoped,
            (run, true) => RetrievalScope::RunPlusGlobal(run),
            (run, false) => RetrievalScope::RunIsolated(run),
        }
    }
}

/// Filter for listing rules.
#[derive(Debug, Clone, Default)]
pub struct RuleQuery {
    pub run_id: Option<RunId>,
    pub apply_to: Option<String>,
    pub include_deprecated: bool,
    pub limit: Option<usize>,
}

impl RuleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn applying_to(mut self, apply_to: impl Into<String>) -> Self {
        self.apply_to = Some(apply_to.into());
        self
    }

    pub fn include_deprecated(mut self) -> Self {
        self.include_deprecated = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Ground truth in force for one round of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStamp {
    pub round: i64,
    pub rule_version: i64,
    pub rule_threshold: i64,
}

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub run_id: RunId,
    pub task_type: TaskKind,
    pub input: String,
    pub output: String,
    /// `None` until judged; failed executions stay unjudged
    pub is_correct: Option<bool>,
    pub memory_ids: Vec<RuleId>,
    pub token_count: i64,
    pub group: Group,
    pub round: i64,
    pub rule_mode: RuleMode,
    pub rule_version: i64,
    pub rule_threshold: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Trial {
    pub fn stamp(&self) -> RoundStamp {
        RoundStamp {
            round: self.round,
            rule_version: self.rule_version,
            rule_threshold: self.rule_threshold,
        }
    }
}

/// A trial about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrial {
    pub run_id: RunId,
    pub task_type: TaskKind,
    pub input: String,
    pub output: String,
    pub is_correct: Option<bool>,
    pub memory_ids: Vec<RuleId>,
    pub token_count: i64,
    pub group: Group,
    pub stamp: RoundStamp,
    pub rule_mode: RuleMode,
    pub error: Option<String>,
}

impl NewTrial {
    pub fn new(run_id: RunId, task_type: TaskKind, input: impl Into<String>, group: Group) -> Self {
        Self {
            run_id,
            task_type,
            input: input.into(),
            output: String::new(),
            is_correct: None,
            memory_ids: Vec::new(),
            token_count: 0,
            group,
            stamp: RoundStamp::default(),
            rule_mode: RuleMode::None,
            error: None,
        }
    }

    pub fn with_stamp(mut self, stamp: RoundStamp, rule_mode: RuleMode) -> Self {
        self.stamp = stamp;
        self.rule_mode = rule_mode;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>, token_count: i64) -> Self {
        self.output = output.into();
        self.token_count = token_count;
        self
    }

    pub fn with_memory_ids(mut self, ids: Vec<RuleId>) -> Self {
        self.memory_ids = ids;
        self
    }

    /// Mark as a failed execution; it stays unjudged.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.is_correct = None;
        self
    }
}

/// Verdict kind of a judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgmentKind {
    Correct,
    Incorrect,
}

impl JudgmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgmentKind::Correct => "correct",
            JudgmentKind::Incorrect => "incorrect",
        }
    }
}

impl fmt::Display for JudgmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JudgmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "correct" => Ok(JudgmentKind::Correct),
            "incorrect" => Ok(JudgmentKind::Incorrect),
            other => Err(Error::InvalidRequest(format!("unknown judgment kind: {}", other))),
        }
    }
}

/// Feedback on a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub id: JudgmentId,
    pub run_id: RunId,
    pub trial_id: TrialId,
    pub kind: JudgmentKind,
    pub explanation: String,
    /// Set once the evolution step has consumed this judgment
    pub consumed: bool,
    /// Rule created from this judgment, if any
    pub memory_id: Option<RuleId>,
    pub created_at: DateTime<Utc>,
}

/// An experiment invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub task_type: TaskKind,
    pub action: String,
    pub runs_per_group: usize,
    pub seed: u64,
    pub rule_mode: RuleMode,
    pub groups: Vec<Group>,
    pub result_path: Option<String>,
    pub conclusion_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A run about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub task_type: TaskKind,
    pub action: String,
    pub runs_per_group: usize,
    pub seed: u64,
    pub rule_mode: RuleMode,
    pub groups: Vec<Group>,
}

/// Rendered prompt of a trial, kept for the raw-case policy and auditing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCaseLog {
    pub trial_id: TrialId,
    pub run_id: RunId,
    pub task_type: TaskKind,
    pub group: Group,
    pub prompt: String,
    pub input: String,
    pub memory_ids: Vec<RuleId>,
}

/// Row counts removed by a reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    pub case_logs: usize,
    pub judgments: usize,
    pub trials: usize,
    pub rules: usize,
    pub runs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_for_run() {
        assert_eq!(RetrievalScope::for_run(0, true), RetrievalScope::Unscoped);
        assert_eq!(RetrievalScope::for_run(3, false), RetrievalScope::RunIsolated(3));
        assert_eq!(RetrievalScope::for_run(3, true), RetrievalScope::RunPlusGlobal(3));
    }

    #[test]
    fn test_new_rule_clamps_confidence() {
        let rule = NewRule::new(1, "points<100", "deny", "lottery").with_confidence(1.7);
        assert_eq!(rule.confidence, 1.0);
        let rule = rule.with_confidence(f64::NAN);
        assert_eq!(rule.confidence, 0.0);
        assert_eq!(rule.trigger_key(), "points<");
    }

    #[test]
    fn test_judgment_kind_parse() {
        assert_eq!("incorrect".parse::<JudgmentKind>().unwrap(), JudgmentKind::Incorrect);
        assert!("maybe".parse::<JudgmentKind>().is_err());
    }
}
