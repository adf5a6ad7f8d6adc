//! Library facade: every operation the CLI exposes, over one shared store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{Agent, TrialPlan};
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::experiment::analysis::{self, RunSelector, RunTrend};
use crate::experiment::{ExperimentRequest, ExperimentRunner, GroupStats, ModeCurve, RuleMode, RunResult};
use crate::external::{ExternalMemory, MemosClient};
use crate::groups::{EvolutionTier, Group};
use crate::llm::{DifyClient, ReasoningBackend};
use crate::memory::{
    EvolutionOutcome, Judgment, JudgmentKind, MemoryEvolver, ResetSummary, Rule, RuleId, RuleQuery,
    SqliteStore, Store, Trial, TrialId,
};
use crate::task::{judge, TaskKind};

/// What an automatic judgment led to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoJudgeOutcome {
    pub judgment: Judgment,
    /// Evolution result when the answer was incorrect
    pub evolution: Option<EvolutionOutcome>,
    /// Rules verified when the answer was correct
    pub verified: usize,
}

/// Shared entry point for ad hoc trials, memory management and experiments.
pub struct Harness {
    store: Arc<dyn Store>,
    agent: Arc<Agent>,
    evolver: Arc<MemoryEvolver>,
    runner: ExperimentRunner,
    config: HarnessConfig,
}

impl Harness {
    /// Open the SQLite store and connect the configured backend and external memory.
    pub fn from_config(config: HarnessConfig) -> Result<Self> {
        let db_path = config.database_path();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path)?);
        let backend: Arc<dyn ReasoningBackend> = Arc::new(DifyClient::new(config.backend.clone())?);
        let external = MemosClient::from_config(&config.external_memory)?
            .map(|client| Arc::new(client) as Arc<dyn ExternalMemory>);
        info!(
            database = %db_path.display(),
            backend = backend.name(),
            external_memory = external.is_some(),
            "Harness ready"
        );
        Ok(Self::new(store, backend, external, config))
    }

    /// Assemble from explicit collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn ReasoningBackend>,
        external: Option<Arc<dyn ExternalMemory>>,
        config: HarnessConfig,
    ) -> Self {
        let lifecycle = config.lifecycle.clone();
        let prefix = config.external_memory.user_prefix.clone();

        let mut agent = Agent::new(store.clone(), backend.clone(), lifecycle.clone());
        let mut evolver = MemoryEvolver::new(store.clone(), backend, lifecycle);
        if let Some(external) = external {
            agent = agent.with_external(external.clone(), prefix.clone());
            evolver = evolver.with_external(external, prefix);
        }
        let agent = Arc::new(agent);
        let evolver = Arc::new(evolver);

        let runner = ExperimentRunner::new(store.clone(), agent.clone(), evolver.clone())
            .with_thresholds(config.conclusion.clone())
            .with_output_dir(config.output_dir());

        Self {
            store,
            agent,
            evolver,
            runner,
            config,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run one trial outside any experiment.
    pub async fn execute_task(
        &self,
        task_type: TaskKind,
        input: &str,
        group: Group,
        use_memory: bool,
        cancel: &CancellationToken,
    ) -> Result<Trial> {
        let plan = TrialPlan::ad_hoc(task_type, input, group, use_memory);
        self.agent.execute(&plan, None, cancel).await
    }

    fn trial(&self, id: TrialId) -> Result<Trial> {
        self.store.get_trial(id)?.ok_or_else(|| Error::not_found("trial", id))
    }

    /// Record external feedback on a trial.
    pub fn submit_judgment(&self, trial_id: TrialId, kind: JudgmentKind, explanation: &str) -> Result<Judgment> {
        let trial = self.trial(trial_id)?;
        self.store.set_trial_verdict(trial.id, kind == JudgmentKind::Correct)?;
        self.store.insert_judgment(&trial, kind, explanation)
    }

    /// Judge a trial against a threshold (its scheduled one by default), then
    /// evolve on an incorrect answer or verify on a correct one.
    pub async fn auto_judge(&self, trial_id: TrialId, threshold: Option<i64>) -> Result<AutoJudgeOutcome> {
        let mut trial = self.trial(trial_id)?;
        let threshold = threshold.unwrap_or(trial.rule_threshold);
        let verdict = judge(trial.task_type, &trial.input, &trial.output, threshold);
        self.store.set_trial_verdict(trial.id, verdict.is_correct)?;
        trial.is_correct = Some(verdict.is_correct);
        let judgment = self.store.insert_judgment(&trial, verdict.kind(), &verdict.explanation)?;

        if verdict.is_correct {
            let verified = self.evolver.verify(&trial)?;
            return Ok(AutoJudgeOutcome {
                judgment,
                evolution: None,
                verified,
            });
        }

        let tier = trial.group.evolution_tier().unwrap_or(EvolutionTier::Reflect);
        let evolution = self.evolver.evolve(&trial, &judgment, tier).await?;
        Ok(AutoJudgeOutcome {
            judgment,
            evolution: Some(evolution),
            verified: 0,
        })
    }

    /// Reflect on the latest judgment of a trial.
    pub async fn reflect(&self, trial_id: TrialId) -> Result<Rule> {
        let trial = self.trial(trial_id)?;
        let judgment = self
            .store
            .latest_judgment(trial.id)?
            .ok_or_else(|| Error::InvalidRequest(format!("trial {} has no judgment", trial.id)))?;
        self.evolver.reflect(&trial, &judgment, false).await
    }

    pub fn list_rules(&self, query: &RuleQuery) -> Result<Vec<Rule>> {
        self.store.list_rules(query)
    }

    pub fn get_rule(&self, id: RuleId) -> Result<Rule> {
        self.store.get_rule(id)?.ok_or_else(|| Error::not_found("rule", id))
    }

    /// Soft-deprecate a rule.
    pub fn retire_rule(&self, id: RuleId) -> Result<Rule> {
        if !self.store.retire_rule(id, chrono::Utc::now())? {
            return Err(Error::not_found("rule", id));
        }
        self.get_rule(id)
    }

    /// Stats over all stored trials, optionally for one group.
    pub fn stats(&self, group: Option<Group>) -> Result<GroupStats> {
        analysis::overall_stats(self.store.as_ref(), group, self.config.conclusion.z)
    }

    pub fn trend(&self, selector: RunSelector) -> Result<RunTrend> {
        analysis::run_trend(self.store.as_ref(), selector)
    }

    pub fn compare_modes(&self) -> Result<BTreeMap<RuleMode, ModeCurve>> {
        analysis::compare_modes(self.store.as_ref(), self.config.conclusion.z)
    }

    /// Delete every trial, judgment, rule, case log and run.
    pub fn reset_all(&self) -> Result<ResetSummary> {
        self.store.reset_all()
    }

    pub async fn run_experiment(&self, request: &ExperimentRequest, cancel: &CancellationToken) -> Result<RunResult> {
        self.runner.run(request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::fake::RecordingMemory;
    use crate::llm::fake::ScriptedBackend;
    use crate::llm::{BackendRequest, BackendResponse};
    use pretty_assertions::assert_eq;

    const REFLECTION: &str = r#"{"trigger": "points<120", "lesson": "deny below 120 points", "confidence": 0.7}"#;

    /// Allows every task; answers reflection prompts with a fixed rule.
    fn backend() -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend::new(|request: &BackendRequest| {
            let answer = if request.prompt.contains("\"lesson\"") {
                REFLECTION
            } else {
                r#"{"allow": true, "reason": "enough points"}"#
            };
            Ok(BackendResponse {
                answer: answer.to_string(),
                tokens: 12,
            })
        }))
    }

    fn harness(external: Option<Arc<dyn ExternalMemory>>) -> (Harness, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            output_dir: dir.path().display().to_string(),
            ..HarnessConfig::default()
        };
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        (Harness::new(store, backend(), external, config), dir)
    }

    #[tokio::test]
    async fn test_ad_hoc_trial_and_auto_judge() {
        let (harness, _dir) = harness(None);
        let cancel = CancellationToken::new();
        let trial = harness
            .execute_task(TaskKind::Lottery, r#"{"points": 110}"#, Group::C, true, &cancel)
            .await
            .unwrap();
        assert_eq!(trial.run_id, 0);
        assert_eq!(trial.is_correct, None);

        let outcome = harness.auto_judge(trial.id, Some(120)).await.unwrap();
        assert_eq!(outcome.judgment.kind, JudgmentKind::Incorrect);
        let rule = outcome.evolution.unwrap().rule;
        assert_eq!(rule.trigger, "points<120");
        assert_eq!(rule.run_id, 0);

        let again = harness
            .execute_task(TaskKind::Lottery, r#"{"points": 130}"#, Group::C, true, &cancel)
            .await
            .unwrap();
        assert_eq!(again.memory_ids, vec![rule.id]);
        let outcome = harness.auto_judge(again.id, None).await.unwrap();
        assert_eq!(outcome.judgment.kind, JudgmentKind::Correct);
        assert_eq!(outcome.verified, 1);
        assert!(harness.get_rule(rule.id).unwrap().last_verified_at.is_some());
    }

    #[tokio::test]
    async fn test_ad_hoc_reflection_reaches_external_memory() {
        let external = Arc::new(RecordingMemory::default());
        let (harness, _dir) = harness(Some(external.clone()));
        let cancel = CancellationToken::new();
        let trial = harness
            .execute_task(TaskKind::Lottery, r#"{"points": 90}"#, Group::C, true, &cancel)
            .await
            .unwrap();
        harness.auto_judge(trial.id, None).await.unwrap();

        let added = external.added();
        assert_eq!(added.len(), 1);
        assert!(added[0].2.contains("group=C"));
    }

    #[tokio::test]
    async fn test_manual_judgment_then_reflect() {
        let (harness, _dir) = harness(None);
        let trial = harness
            .execute_task(TaskKind::Lottery, r#"{"points": 110}"#, Group::A, false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(harness.reflect(trial.id).await, Err(Error::InvalidRequest(_))));

        let judgment = harness
            .submit_judgment(trial.id, JudgmentKind::Incorrect, "threshold is 120 now")
            .unwrap();
        assert_eq!(judgment.trial_id, trial.id);
        let rule = harness.reflect(trial.id).await.unwrap();
        assert_eq!(rule.derived_from, "threshold is 120 now");
        assert_eq!(harness.stats(Some(Group::A)).unwrap().incorrect, 1);
    }

    #[tokio::test]
    async fn test_rule_management_and_reset() {
        let (harness, _dir) = harness(None);
        let trial = harness
            .execute_task(TaskKind::Lottery, r#"{"points": 110}"#, Group::C, true, &CancellationToken::new())
            .await
            .unwrap();
        let rule = harness.auto_judge(trial.id, Some(120)).await.unwrap().evolution.unwrap().rule;

        let retired = harness.retire_rule(rule.id).unwrap();
        assert!(retired.deprecated);
        assert!(harness.list_rules(&RuleQuery::new()).unwrap().is_empty());
        assert_eq!(harness.list_rules(&RuleQuery::new().include_deprecated()).unwrap().len(), 1);
        assert!(matches!(harness.get_rule(999), Err(Error::NotFound { .. })));
        assert!(matches!(harness.submit_judgment(999, JudgmentKind::Correct, ""), Err(Error::NotFound { .. })));

        let summary = harness.reset_all().unwrap();
        assert_eq!(summary.rules, 1);
        assert_eq!(summary.trials, 1);
        assert_eq!(harness.stats(None).unwrap().n, 0);
    }

    #[tokio::test]
    async fn test_experiment_then_views() {
        let (harness, dir) = harness(None);
        let request = ExperimentRequest::new(TaskKind::Lottery)
            .with_rounds(6)
            .with_groups(&[Group::A, Group::C])
            .with_rule_mode(RuleMode::Low)
            .with_seed(5);
        let result = harness.run_experiment(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.trends[&Group::A].len(), 6);
        assert!(dir.path().join(format!("experiment_run_{}.json", result.run_id)).exists());

        let trend = harness.trend(RunSelector::LatestOf(RuleMode::Low)).unwrap();
        assert_eq!(trend.run_id, result.run_id);
        assert_eq!(trend.thresholds, vec![100, 100, 100, 120, 120, 120]);

        let modes = harness.compare_modes().unwrap();
        assert_eq!(modes[&RuleMode::Low].trial_and_error.change_points, vec![3]);
        assert!(!modes.contains_key(&RuleMode::High));
    }
}
