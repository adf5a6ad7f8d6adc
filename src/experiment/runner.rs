//! Round-by-round execution of a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conclusion::{synthesize_conclusion, Conclusion};
use super::report::{write_reports, ReportPaths};
use super::request::{ExperimentRequest, ResolvedRequest};
use super::schedule::RuleMode;
use super::stats::{compute_group_stats, compute_tests, GroupStats, TestResult};
use crate::agent::{Agent, TrialPlan};
use crate::change_aware::ChangeDetector;
use crate::config::ConclusionThresholds;
use crate::error::Result;
use crate::groups::Group;
use crate::memory::{
    Judgment, JudgmentKind, MemoryEvolver, NewRun, RoundStamp, Run, RunId, Store, Trial, TrialId,
};
use crate::task::{judge, TaskKind};

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub request: ExperimentRequest,
    pub task_type: TaskKind,
    pub rule_mode: RuleMode,
    pub rounds: usize,
    pub seed: u64,
    pub groups: Vec<Group>,
    pub trial_ids: BTreeMap<Group, Vec<TrialId>>,
    /// Per group, 1 for every round answered incorrectly or not at all
    pub trends: BTreeMap<Group, Vec<u8>>,
    pub thresholds: Vec<i64>,
    pub rule_versions: Vec<i64>,
    pub stats: BTreeMap<Group, GroupStats>,
    pub tests: BTreeMap<String, TestResult>,
    pub conclusion: Conclusion,
    pub errors: Vec<String>,
    pub result_path: Option<String>,
    pub conclusion_path: Option<String>,
}

/// Mutable bookkeeping of a run in progress.
struct RunState {
    run_id: RunId,
    trial_ids: BTreeMap<Group, Vec<TrialId>>,
    trends: BTreeMap<Group, Vec<u8>>,
    errors: Vec<String>,
    detector: Option<ChangeDetector>,
}

impl RunState {
    fn flag(&mut self, group: Group, incorrect: bool) {
        self.trends.entry(group).or_default().push(u8::from(incorrect));
    }

    fn error(&mut self, group: Group, round: i64, step: &str, error: impl std::fmt::Display) {
        self.errors.push(format!(
            "run={} group={} round={} {} failed: {}",
            self.run_id, group, round, step, error
        ));
    }
}

/// Drives runs: every round, every group in declared order.
pub struct ExperimentRunner {
    store: Arc<dyn Store>,
    agent: Arc<Agent>,
    evolver: Arc<MemoryEvolver>,
    thresholds: ConclusionThresholds,
    output_dir: PathBuf,
}

impl ExperimentRunner {
    pub fn new(store: Arc<dyn Store>, agent: Arc<Agent>, evolver: Arc<MemoryEvolver>) -> Self {
        Self {
            store,
            agent,
            evolver,
            thresholds: ConclusionThresholds::default(),
            output_dir: PathBuf::from("outputs"),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ConclusionThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Execute a run to completion.
    ///
    /// Only request validation and run creation fail the call. Every later
    /// failure is recorded in [`RunResult::errors`] and the affected round is
    /// flagged incorrect, so trend sequences always cover every round.
    pub async fn run(&self, request: &ExperimentRequest, cancel: &CancellationToken) -> Result<RunResult> {
        let resolved = request.resolve()?;
        let run = self.store.create_run(&NewRun {
            task_type: resolved.task_type,
            action: resolved.action.clone(),
            runs_per_group: resolved.rounds,
            seed: resolved.seed,
            rule_mode: resolved.rule_mode,
            groups: resolved.groups.clone(),
        })?;
        let schedule = resolved.schedule();

        info!(
            run_id = run.id,
            task_type = %resolved.task_type,
            mode = %resolved.rule_mode,
            rounds = resolved.rounds,
            groups = ?resolved.groups,
            "Starting run"
        );

        let mut state = RunState {
            run_id: run.id,
            trial_ids: resolved.groups.iter().map(|g| (*g, Vec::new())).collect(),
            trends: resolved.groups.iter().map(|g| (*g, Vec::new())).collect(),
            errors: Vec::new(),
            detector: resolved
                .groups
                .iter()
                .any(Group::competes)
                .then(|| ChangeDetector::new(self.evolver.lifecycle().change_aware.clone())),
        };

        for (round, input) in resolved.inputs.iter().enumerate() {
            let stamp = schedule.stamp(round);
            for &group in &resolved.groups {
                let plan = TrialPlan::in_run(run.id, resolved.task_type, input.clone(), group, stamp, resolved.rule_mode);
                self.play(&plan, &mut state, cancel).await;
            }
        }

        let result = self.finalize(&run, request, &resolved, schedule.thresholds, schedule.versions, state);
        info!(
            run_id = run.id,
            verdict = %result.conclusion.verdict,
            errors = result.errors.len(),
            "Run finished"
        );
        Ok(result)
    }

    /// One group's turn in one round: execute, judge, then evolve or verify.
    async fn play(&self, plan: &TrialPlan, state: &mut RunState, cancel: &CancellationToken) {
        let group = plan.group;
        let round = plan.stamp.round;
        let detector = state.detector.as_ref().filter(|_| group.competes());

        let mut trial = match self.agent.execute(plan, detector, cancel).await {
            Ok(trial) => trial,
            Err(e) => {
                state.error(group, round, "execute", &e);
                state.flag(group, true);
                return;
            }
        };
        state.trial_ids.entry(group).or_default().push(trial.id);

        if let Some(error) = trial.error.clone() {
            state.error(group, round, "execute", error);
            state.flag(group, true);
            return;
        }

        let judgment = match self.record_verdict(&mut trial, plan.stamp) {
            Ok(judgment) => judgment,
            Err(e) => {
                state.error(group, round, "judge", &e);
                state.flag(group, true);
                return;
            }
        };
        let correct = judgment.kind == JudgmentKind::Correct;
        state.flag(group, !correct);

        if let Some(detector) = state.detector.as_mut().filter(|_| group.competes()) {
            if detector.observe(round, &trial.memory_ids, correct) {
                info!(run_id = trial.run_id, round, "Change detected for group F");
            }
        }

        if correct {
            if group.verifies() {
                if let Err(e) = self.evolver.verify(&trial) {
                    state.error(group, round, "verify", &e);
                }
            }
            return;
        }

        let Some(tier) = group.evolution_tier() else {
            return;
        };
        match self.evolver.evolve(&trial, &judgment, tier).await {
            Ok(outcome) => debug!(
                run_id = trial.run_id,
                group = %group,
                round,
                memory_id = outcome.rule.id,
                penalized = outcome.penalized,
                "Evolved memory"
            ),
            Err(e) => {
                warn!(run_id = trial.run_id, group = %group, round, error = %e, "Evolution failed");
                state.error(group, round, "reflect", &e);
            }
        }
    }

    /// Judge against the round's ground truth and persist the verdict.
    fn record_verdict(&self, trial: &mut Trial, stamp: RoundStamp) -> Result<Judgment> {
        let verdict = judge(trial.task_type, &trial.input, &trial.output, stamp.rule_threshold);
        self.store.set_trial_verdict(trial.id, verdict.is_correct)?;
        trial.is_correct = Some(verdict.is_correct);
        self.store.insert_judgment(trial, verdict.kind(), &verdict.explanation)
    }

    fn finalize(
        &self,
        run: &Run,
        request: &ExperimentRequest,
        resolved: &ResolvedRequest,
        thresholds: Vec<i64>,
        rule_versions: Vec<i64>,
        mut state: RunState,
    ) -> RunResult {
        let mut stats = BTreeMap::new();
        for &group in &resolved.groups {
            match self.store.run_trials(run.id, Some(group)) {
                Ok(trials) => {
                    stats.insert(group, compute_group_stats(&trials, self.thresholds.z));
                }
                Err(e) => state.errors.push(format!("run={} group={} stats failed: {}", run.id, group, e)),
            }
        }
        let tests = compute_tests(&stats, &state.trends, &self.thresholds);
        let conclusion = synthesize_conclusion(&stats, &tests, &state.trends, &self.thresholds);

        let paths = ReportPaths::for_run(&self.output_dir, run.id);
        let mut result = RunResult {
            run_id: run.id,
            request: request.clone(),
            task_type: resolved.task_type,
            rule_mode: resolved.rule_mode,
            rounds: resolved.rounds,
            seed: resolved.seed,
            groups: resolved.groups.clone(),
            trial_ids: state.trial_ids,
            trends: state.trends,
            thresholds,
            rule_versions,
            stats,
            tests,
            conclusion,
            errors: state.errors,
            result_path: Some(paths.result.display().to_string()),
            conclusion_path: Some(paths.conclusion.display().to_string()),
        };

        let written = write_reports(&self.output_dir, run, &result).and_then(|paths| {
            self.store.set_run_outputs(
                run.id,
                &paths.result.display().to_string(),
                &paths.conclusion.display().to_string(),
            )
        });
        if let Err(e) = written {
            warn!(run_id = run.id, error = %e, "Writing run reports failed");
            result.errors.push(format!("run={} report failed: {}", run.id, e));
            result.result_path = None;
            result.conclusion_path = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::llm::fake::{PendingBackend, ScriptedBackend};
    use crate::llm::{BackendRequest, BackendResponse, ReasoningBackend};
    use crate::memory::{RuleQuery, RuleStore, SqliteStore, TrialLedger};
    use crate::experiment::ConclusionVerdict;
    use pretty_assertions::assert_eq;
    use regex::Regex;

    /// Answers task prompts with the threshold of the first listed rule
    /// (100 when none), and reflection prompts with the threshold named in
    /// the feedback.
    fn threshold_follower() -> ScriptedBackend {
        let rule_line = Regex::new(r"(?m)^1\. \[[^\d\]]*(\d+)").unwrap();
        let feedback = Regex::new(r"threshold=(\d+)").unwrap();
        let points = Regex::new(r#""points":\s*(\d+)"#).unwrap();
        ScriptedBackend::new(move |request: &BackendRequest| {
            let prompt = &request.prompt;
            if prompt.contains("\"lesson\"") {
                let threshold = feedback
                    .captures(prompt)
                    .map(|c| c[1].to_string())
                    .unwrap_or_else(|| "100".to_string());
                return Ok(BackendResponse {
                    answer: format!(
                        r#"{{"trigger": "points<{t}", "lesson": "deny when points are below {t}", "confidence": 0.9}}"#,
                        t = threshold
                    ),
                    tokens: 20,
                });
            }
            let threshold: i64 = rule_line
                .captures(prompt)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(100);
            let value: i64 = points
                .captures(prompt)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0);
            Ok(BackendResponse {
                answer: format!(r#"{{"allow": {}, "reason": "threshold {}"}}"#, value >= threshold, threshold),
                tokens: 10,
            })
        })
    }

    fn runner(
        store: &Arc<SqliteStore>,
        backend: Arc<dyn ReasoningBackend>,
        output_dir: &std::path::Path,
    ) -> ExperimentRunner {
        let lifecycle = LifecycleConfig::default();
        let agent = Arc::new(Agent::new(store.clone(), backend.clone(), lifecycle.clone()));
        let evolver = Arc::new(MemoryEvolver::new(store.clone(), backend, lifecycle));
        ExperimentRunner::new(store.clone(), agent, evolver).with_output_dir(output_dir)
    }

    fn fixed_inputs(n: usize) -> Vec<String> {
        vec![r#"{"points":110}"#.to_string(); n]
    }

    #[tokio::test]
    async fn test_group_c_recovers_after_threshold_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = runner(&store, Arc::new(threshold_follower()), dir.path());

        let request = ExperimentRequest::new(TaskKind::Lottery)
            .with_rounds(20)
            .with_groups(&[Group::A, Group::C])
            .with_rule_mode(RuleMode::Low)
            .with_seed(1)
            .with_inputs(fixed_inputs(20));
        let result = runner.run(&request, &CancellationToken::new()).await.unwrap();

        let mut expected_c = vec![0u8; 20];
        expected_c[10] = 1;
        let mut expected_a = vec![0u8; 10];
        expected_a.extend(vec![1u8; 10]);
        assert_eq!(result.trends[&Group::C], expected_c);
        assert_eq!(result.trends[&Group::A], expected_a);
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        assert_eq!(result.thresholds[9], 100);
        assert_eq!(result.thresholds[10], 120);
        assert_eq!(result.rule_versions[19], 2);
        assert_eq!(result.trial_ids[&Group::C].len(), 20);

        let c = &result.stats[&Group::C];
        assert_eq!((c.n, c.correct, c.incorrect), (20, 19, 1));
        assert_eq!(result.stats[&Group::A].incorrect, 10);
        assert!(result.tests.contains_key("C_vs_A"));
        assert!(result.tests.contains_key("A_trend"));
        // C never failed before the change, so its second half is not better.
        assert_eq!(result.conclusion.verdict, ConclusionVerdict::LearningNotObserved);

        let rules = store.list_rules(&RuleQuery::new().for_run(result.run_id)).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].trigger, "points<120");
        assert!(rules[0].use_count >= 9);
        assert!(rules[0].last_verified_at.is_some());

        let run = store.get_run(result.run_id).unwrap().unwrap();
        let result_path = run.result_path.unwrap();
        assert!(result_path.ends_with(&format!("experiment_run_{}.json", result.run_id)));
        assert!(std::path::Path::new(&result_path).exists());
        let md = std::fs::read_to_string(run.conclusion_path.unwrap()).unwrap();
        assert!(md.contains("| C | 20 | 1 |"));
    }

    #[tokio::test]
    async fn test_backend_failures_keep_rounds_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = runner(&store, Arc::new(ScriptedBackend::failing()), dir.path());

        let request = ExperimentRequest::new(TaskKind::Lottery)
            .with_rounds(4)
            .with_groups(&[Group::A, Group::C])
            .with_seed(9);
        let result = runner.run(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.trends[&Group::A], vec![1, 1, 1, 1]);
        assert_eq!(result.trends[&Group::C], vec![1, 1, 1, 1]);
        assert_eq!(result.errors.len(), 8);
        assert!(result.errors[0].starts_with(&format!("run={} group=A round=0 execute failed", result.run_id)));

        let c = &result.stats[&Group::C];
        assert_eq!((c.n, c.unknown, c.incorrect), (4, 4, 0));
        assert_eq!(c.error_rate, 0.0);
    }

    #[tokio::test]
    async fn test_cancelled_run_records_every_round() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = runner(&store, Arc::new(PendingBackend), dir.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = ExperimentRequest::new(TaskKind::Lottery)
            .with_rounds(3)
            .with_groups(&[Group::B])
            .with_seed(2);
        let result = runner.run(&request, &cancel).await.unwrap();

        assert_eq!(result.trends[&Group::B], vec![1, 1, 1]);
        assert!(result.errors.iter().all(|e| e.ends_with("Operation cancelled")));
        let trials = store.run_trials(result.run_id, Some(Group::B)).unwrap();
        assert_eq!(trials.len(), 3);
        assert!(trials.iter().all(|t| t.is_correct.is_none()));
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let runner = runner(&store, Arc::new(ScriptedBackend::failing()), dir.path());

        let request = ExperimentRequest {
            groups: Some(vec!["Q".to_string()]),
            ..ExperimentRequest::default()
        };
        assert!(runner.run(&request, &CancellationToken::new()).await.is_err());
        assert!(store.latest_run(RuleMode::None).unwrap().is_none());
    }
}
