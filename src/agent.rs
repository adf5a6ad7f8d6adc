//! The decision-making agent: gathers memory per group policy, renders the
//! prompt, calls the backend and records the trial.

use std::fmt::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::change_aware::ChangeDetector;
use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::experiment::RuleMode;
use crate::external::{build_search_query, external_user_id, ExternalHit, ExternalMemory};
use crate::groups::Group;
use crate::llm::{BackendRequest, BackendResponse, ReasoningBackend};
use crate::memory::retrieval::{commit_selection, retrieve};
use crate::memory::{
    Judgment, NewCaseLog, NewTrial, RoundStamp, Rule, RuleId, RunId, Store, Trial, AD_HOC_RUN,
};
use crate::task::TaskKind;

const ANSWER_FORMAT: &str = "Reply with strict JSON only (no Markdown, no extra text):\n{\"allow\": true, \"reason\": \"...\"}\n";

/// One trial to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialPlan {
    pub run_id: RunId,
    pub task_type: TaskKind,
    pub input: String,
    pub group: Group,
    pub use_memory: bool,
    pub stamp: RoundStamp,
    pub rule_mode: RuleMode,
}

impl TrialPlan {
    /// A trial outside any run.
    pub fn ad_hoc(task_type: TaskKind, input: impl Into<String>, group: Group, use_memory: bool) -> Self {
        Self {
            run_id: AD_HOC_RUN,
            task_type,
            input: input.into(),
            group,
            use_memory,
            stamp: RoundStamp::default(),
            rule_mode: RuleMode::None,
        }
    }

    /// A scheduled round of a run. Memory follows the group policy.
    pub fn in_run(
        run_id: RunId,
        task_type: TaskKind,
        input: impl Into<String>,
        group: Group,
        stamp: RoundStamp,
        rule_mode: RuleMode,
    ) -> Self {
        Self {
            run_id,
            task_type,
            input: input.into(),
            group,
            use_memory: group != Group::A,
            stamp,
            rule_mode,
        }
    }
}

/// Everything recalled for one trial.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub rules: Vec<Rule>,
    pub cases: Vec<Trial>,
    pub external: Vec<ExternalHit>,
    pub recent_incorrect: Vec<Judgment>,
}

impl MemoryContext {
    pub fn memory_ids(&self) -> Vec<RuleId> {
        self.rules.iter().map(|r| r.id).collect()
    }
}

/// Whether local recall is weak enough to ask the external service.
pub fn needs_external_fallback(rules: &[Rule], lifecycle: &LifecycleConfig) -> bool {
    if rules.is_empty() {
        return true;
    }
    if rules.len() >= lifecycle.external_fallback_min_hits {
        return false;
    }
    let best = rules.iter().map(|r| r.confidence).fold(0.0, f64::max);
    best < lifecycle.external_fallback_confidence
}

fn write_header(prompt: &mut String, task_type: TaskKind, input: &str) {
    let _ = writeln!(prompt, "Task type: {}", task_type);
    let _ = writeln!(prompt, "Input: {}\n", input);
}

fn write_recent_incorrect(prompt: &mut String, title: &str, judgments: &[Judgment]) {
    if judgments.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "{}", title);
    for (i, j) in judgments.iter().enumerate() {
        let _ = writeln!(prompt, "{}) {}", i + 1, j.explanation.trim());
    }
    prompt.push('\n');
}

fn write_rules(prompt: &mut String, title: &str, rules: &[Rule]) {
    if rules.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "{}", title);
    for (i, r) in rules.iter().enumerate() {
        let _ = writeln!(prompt, "{}. [{}] {}", i + 1, r.trigger, r.lesson);
    }
    prompt.push('\n');
}

fn write_external(prompt: &mut String, title: &str, hits: &[ExternalHit]) {
    if hits.is_empty() {
        return;
    }
    let _ = writeln!(prompt, "{}", title);
    for (i, hit) in hits.iter().enumerate() {
        if hit.score > 0.0 {
            let _ = writeln!(prompt, "{}. (score={:.4}) {}", i + 1, hit.score, hit.content);
        } else {
            let _ = writeln!(prompt, "{}. {}", i + 1, hit.content);
        }
    }
    prompt.push('\n');
}

/// Render the answering prompt.
pub fn build_prompt(task_type: TaskKind, input: &str, memory: &MemoryContext) -> String {
    let mut prompt = String::new();
    write_header(&mut prompt, task_type, input);
    write_recent_incorrect(
        &mut prompt,
        "Short-term memory (recent mistakes and corrections; avoid repeating them):",
        &memory.recent_incorrect,
    );
    if !memory.cases.is_empty() {
        prompt.push_str("Past cases (all judged correct; use them as reference):\n");
        for (i, case) in memory.cases.iter().enumerate() {
            let judge = match case.is_correct {
                Some(true) => "correct",
                Some(false) => "incorrect",
                None => "unknown",
            };
            let _ = writeln!(
                prompt,
                "{}) input={}\n   output={}\n   judge={}",
                i + 1,
                case.input,
                case.output,
                judge
            );
        }
        prompt.push('\n');
    }
    write_rules(&mut prompt, "Important rules (follow them):", &memory.rules);
    write_external(
        &mut prompt,
        "External long-term memory (reference only; may disagree with the current rules):",
        &memory.external,
    );
    prompt.push_str(task_type.instructions());
    prompt.push_str(ANSWER_FORMAT);
    prompt
}

/// Render the second-stage review prompt for a draft answer.
pub fn build_check_prompt(task_type: TaskKind, input: &str, memory: &MemoryContext, draft: &str) -> String {
    let mut prompt = String::from(
        "You are a strict reviewer. You will see the input, verified rules (must be followed), \
         recent mistakes, candidate external memories and a draft answer.\n\
         Check whether the draft contradicts the verified rules and correct it if so. \
         Output strict JSON only, no explanation.\n\n",
    );
    write_header(&mut prompt, task_type, input);
    write_recent_incorrect(&mut prompt, "Recent mistakes (do not repeat them):", &memory.recent_incorrect);
    write_rules(&mut prompt, "Verified rules (must be followed):", &memory.rules);
    write_external(
        &mut prompt,
        "Candidate external memories (may be noisy; use only where they agree with the verified rules):",
        &memory.external,
    );
    let _ = writeln!(prompt, "Draft answer (to review):\n{}\n", draft.trim());
    prompt.push_str("Give the final answer.\n");
    prompt.push_str(ANSWER_FORMAT);
    prompt
}

/// Executes trials against a backend and records them in the store.
pub struct Agent {
    store: Arc<dyn Store>,
    backend: Arc<dyn ReasoningBackend>,
    external: Option<Arc<dyn ExternalMemory>>,
    user_prefix: String,
    lifecycle: LifecycleConfig,
}

impl Agent {
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn ReasoningBackend>, lifecycle: LifecycleConfig) -> Self {
        Self {
            store,
            backend,
            external: None,
            user_prefix: "memlab".to_string(),
            lifecycle,
        }
    }

    pub fn with_external(mut self, external: Arc<dyn ExternalMemory>, user_prefix: impl Into<String>) -> Self {
        self.external = Some(external);
        self.user_prefix = user_prefix.into();
        self
    }

    async fn call(&self, request: BackendRequest, cancel: &CancellationToken) -> Result<BackendResponse> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            response = self.backend.invoke(request) => response,
        }
    }

    fn select_rules(&self, plan: &TrialPlan, detector: Option<&ChangeDetector>) -> Result<Vec<Rule>> {
        let scope = plan.group.scope(plan.run_id);
        let task_type = plan.task_type.as_str();
        let limit = self.lifecycle.retrieval_limit;

        match detector {
            Some(detector) if plan.group.competes() => {
                let candidates = self.store.candidate_rules(scope, task_type, limit * 2)?;
                let selected = detector.select(plan.stamp.round, candidates, limit);
                commit_selection(self.store.as_ref(), &selected)?;
                Ok(selected)
            }
            _ => {
                let feature = if plan.group.reranks_by_input() {
                    plan.task_type.feature(&plan.input)
                } else {
                    None
                };
                retrieve(self.store.as_ref(), scope, task_type, limit, feature)
            }
        }
    }

    async fn recall(&self, plan: &TrialPlan, detector: Option<&ChangeDetector>) -> MemoryContext {
        let mut memory = MemoryContext::default();
        if !plan.use_memory {
            return memory;
        }

        if plan.group.uses_case_logs() {
            match self.store.recent_correct_trials(
                plan.run_id,
                plan.task_type,
                Group::B,
                self.lifecycle.case_log_limit,
            ) {
                Ok(cases) => memory.cases = cases,
                Err(e) => warn!(run_id = plan.run_id, error = %e, "Case log recall failed"),
            }
            return memory;
        }

        let recent_limit = plan.group.recent_incorrect_limit();
        if recent_limit > 0 {
            match self
                .store
                .recent_incorrect_judgments(plan.run_id, plan.task_type, recent_limit)
            {
                Ok(judgments) => memory.recent_incorrect = judgments,
                Err(e) => warn!(run_id = plan.run_id, error = %e, "Recent mistake recall failed"),
            }
        }

        match self.select_rules(plan, detector) {
            Ok(rules) => memory.rules = rules,
            Err(e) => warn!(run_id = plan.run_id, group = %plan.group, error = %e, "Rule retrieval failed"),
        }

        let external_allowed = plan.run_id == AD_HOC_RUN || plan.group.uses_external_memory();
        if let Some(external) = self.external.as_ref().filter(|_| external_allowed) {
            if needs_external_fallback(&memory.rules, &self.lifecycle) {
                let user_id = external_user_id(&self.user_prefix, plan.task_type);
                if let Err(e) = external.register(&user_id).await {
                    debug!(user_id = %user_id, error = %e, "External register failed");
                }
                match external
                    .search(&user_id, &build_search_query(plan.task_type, &plan.input))
                    .await
                {
                    Ok(hits) => memory.external = hits,
                    Err(e) => warn!(user_id = %user_id, error = %e, "External search failed"),
                }
            }
        }
        memory
    }

    /// Run one trial and record it. Backend failures and cancellation are
    /// recorded as failed, unjudged trials rather than returned as errors;
    /// only storage failures are.
    pub async fn execute(
        &self,
        plan: &TrialPlan,
        detector: Option<&ChangeDetector>,
        cancel: &CancellationToken,
    ) -> Result<Trial> {
        let memory = self.recall(plan, detector).await;
        let memory_ids = memory.memory_ids();
        let mut prompt = build_prompt(plan.task_type, &plan.input, &memory);

        let record = NewTrial::new(plan.run_id, plan.task_type, plan.input.clone(), plan.group)
            .with_stamp(plan.stamp, plan.rule_mode)
            .with_memory_ids(memory_ids.clone());

        let record = match self
            .call(BackendRequest::new(prompt.clone(), plan.input.clone(), plan.task_type), cancel)
            .await
        {
            Ok(first) => {
                let mut answer = first.answer;
                let mut tokens = first.tokens;
                if plan.group.self_checks() {
                    let check_prompt = build_check_prompt(plan.task_type, &plan.input, &memory, &answer);
                    match self
                        .call(
                            BackendRequest::new(check_prompt.clone(), plan.input.clone(), plan.task_type),
                            cancel,
                        )
                        .await
                    {
                        Ok(review) if !review.answer.trim().is_empty() => {
                            answer = review.answer;
                            tokens += review.tokens;
                            prompt = check_prompt;
                        }
                        Ok(_) => {}
                        Err(e) => debug!(run_id = plan.run_id, error = %e, "Self-check failed; keeping draft"),
                    }
                }
                record.with_output(answer, tokens)
            }
            Err(e) => {
                warn!(
                    run_id = plan.run_id,
                    group = %plan.group,
                    round = plan.stamp.round,
                    error = %e,
                    "Trial execution failed"
                );
                record.failed(e.to_string())
            }
        };

        let trial = self.store.insert_trial(&record)?;
        if let Err(e) = self.store.insert_case_log(&NewCaseLog {
            trial_id: trial.id,
            run_id: trial.run_id,
            task_type: trial.task_type,
            group: trial.group,
            prompt,
            input: trial.input.clone(),
            memory_ids,
        }) {
            warn!(trial_id = trial.id, error = %e, "Case log write failed");
        }
        Ok(trial)
    }
}
