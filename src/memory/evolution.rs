//! Turning judgments into rules, and rules into long-lived knowledge.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::external::{external_user_id, source_tag, ExternalMemory};
use crate::groups::EvolutionTier;
use crate::llm::{BackendRequest, ReasoningBackend};
use crate::memory::reflection::{
    build_global_reflection_prompt, build_reflection_prompt, parse_reflection, ReflectionContext,
};
use crate::memory::store::Store;
use crate::memory::types::{Judgment, JudgmentKind, NewRule, Rule, RuleId, Trial, AD_HOC_RUN};
use crate::normalize::{normalize_lesson_text, normalize_trigger_key, GLOBAL_PROVENANCE_PREFIX};
use crate::task::{expected_allow, predict_with_threshold};

/// Result of promoting a rule into the global pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsolidationOutcome {
    /// Nothing promoted (ad hoc trial, or validation rejected the rule)
    Skipped,
    /// Same lesson already pooled; its confidence was bumped
    Reinforced { memory_id: RuleId },
    /// New global version created
    Inserted { memory_id: RuleId, version: i64 },
}

/// Replay of a candidate rule against recent scheduled trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub threshold: Option<i64>,
    pub checked: usize,
    pub conflicts: usize,
    pub passed: bool,
}

impl ValidationReport {
    pub fn disagreement(&self) -> f64 {
        if self.checked == 0 {
            return 1.0;
        }
        self.conflicts as f64 / self.checked as f64
    }
}

/// What one evolution step produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionOutcome {
    pub rule: Rule,
    pub penalized: usize,
    pub validation: Option<ValidationReport>,
    pub consolidation: ConsolidationOutcome,
}

/// Applies the rule lifecycle for one trial at a time.
pub struct MemoryEvolver {
    store: Arc<dyn Store>,
    backend: Arc<dyn ReasoningBackend>,
    external: Option<Arc<dyn ExternalMemory>>,
    user_prefix: String,
    lifecycle: LifecycleConfig,
}

impl MemoryEvolver {
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

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    /// Count a failure against every rule the trial consulted.
    pub fn penalize(&self, trial: &Trial) -> Result<usize> {
        if trial.memory_ids.is_empty() {
            return Ok(0);
        }
        let changed = self.store.record_failure(
            &trial.memory_ids,
            self.lifecycle.penalty_step,
            self.lifecycle.deprecation_failures,
            Utc::now(),
        )?;
        debug!(trial_id = trial.id, ids = ?trial.memory_ids, "Penalized consulted rules");
        Ok(changed)
    }

    /// Credit every rule the trial consulted after a correct outcome.
    pub fn verify(&self, trial: &Trial) -> Result<usize> {
        if trial.memory_ids.is_empty() {
            return Ok(0);
        }
        self.store
            .record_verification(&trial.memory_ids, self.lifecycle.verify_step, Utc::now())
    }

    /// Ask the backend for a rule explaining the judgment and store it as the
    /// next version of its family. `applies_to` is always the trial's task type.
    pub async fn reflect(&self, trial: &Trial, judgment: &Judgment, global_prompt: bool) -> Result<Rule> {
        let ctx = ReflectionContext {
            task_type: trial.task_type,
            input: &trial.input,
            output: &trial.output,
            explanation: &judgment.explanation,
            rule_mode: trial.rule_mode,
            stamp: trial.stamp(),
        };
        let prompt = if global_prompt {
            build_global_reflection_prompt(&ctx)
        } else {
            build_reflection_prompt(&ctx)
        };

        let response = self
            .backend
            .invoke(BackendRequest::new(prompt, judgment.explanation.clone(), trial.task_type))
            .await?;
        let parsed = parse_reflection(
            &response.answer,
            &judgment.explanation,
            self.lifecycle.default_confidence,
        );
        if let Some(scope) = parsed.claimed_scope.as_deref() {
            if scope != trial.task_type.as_str() {
                debug!(trial_id = trial.id, claimed = scope, "Ignoring model-supplied scope");
            }
        }

        let rule = self.store.insert_rule(
            &NewRule::new(trial.run_id, parsed.trigger, parsed.lesson, trial.task_type.as_str())
                .with_provenance(judgment.explanation.clone())
                .with_confidence(parsed.confidence),
        )?;
        self.store.mark_judgment_consumed(judgment.id, Some(rule.id))?;

        info!(
            run_id = trial.run_id,
            trial_id = trial.id,
            memory_id = rule.id,
            version = rule.version,
            source = ?parsed.source,
            "Reflected new rule"
        );
        Ok(rule)
    }

    /// Replay the rule's threshold against recent scheduled trials of the run.
    pub fn validate(&self, trial: &Trial, rule: &Rule) -> Result<ValidationReport> {
        let mut report = ValidationReport {
            threshold: rule.threshold(),
            ..ValidationReport::default()
        };
        let Some(threshold) = report.threshold else {
            return Ok(report);
        };
        if !trial.task_type.supports_validation() || self.lifecycle.validation_window == 0 {
            return Ok(report);
        }

        let recent = self.store.recent_scheduled_trials(
            trial.run_id,
            trial.task_type,
            self.lifecycle.validation_window,
        )?;
        if recent.len() < self.lifecycle.validation_min_comparable {
            return Ok(report);
        }

        for past in &recent {
            let Some(predicted) = predict_with_threshold(past.task_type, &past.input, threshold) else {
                continue;
            };
            let actual = expected_allow(past.task_type, &past.input, past.rule_threshold);
            report.checked += 1;
            if predicted != actual {
                report.conflicts += 1;
            }
        }
        report.passed = report.checked >= self.lifecycle.validation_min_comparable
            && report.disagreement() <= self.lifecycle.validation_max_disagreement;
        Ok(report)
    }

    /// Promote a run-scoped rule into the global pool. An identical lesson
    /// already pooled counts as repeated evidence instead of a new version.
    pub fn consolidate(&self, trial: &Trial, rule: &Rule) -> Result<ConsolidationOutcome> {
        if trial.run_id == AD_HOC_RUN {
            return Ok(ConsolidationOutcome::Skipped);
        }
        let apply_to = trial.task_type.as_str();
        let key = normalize_trigger_key(&rule.trigger);

        if let Some(existing) = self.store.latest_global_rule(&key, apply_to)? {
            let same_lesson = normalize_lesson_text(&existing.lesson) == normalize_lesson_text(&rule.lesson);
            let same_trigger = normalize_lesson_text(&existing.trigger) == normalize_lesson_text(&rule.trigger);
            if same_lesson && same_trigger {
                self.store
                    .reinforce_rule(existing.id, self.lifecycle.consolidation_step, Utc::now())?;
                debug!(memory_id = existing.id, "Reinforced global rule");
                return Ok(ConsolidationOutcome::Reinforced {
                    memory_id: existing.id,
                });
            }
        }

        let provenance = format!(
            "{}src_run_id={}|task_id={}|src_memory_id={}",
            GLOBAL_PROVENANCE_PREFIX, trial.run_id, trial.id, rule.id
        );
        let global = self.store.insert_rule(
            &NewRule::new(AD_HOC_RUN, rule.trigger.trim(), rule.lesson.trim(), apply_to)
                .with_provenance(provenance)
                .with_confidence(rule.confidence),
        )?;
        info!(
            src_memory_id = rule.id,
            memory_id = global.id,
            version = global.version,
            "Consolidated rule into global pool"
        );
        Ok(ConsolidationOutcome::Inserted {
            memory_id: global.id,
            version: global.version,
        })
    }

    /// Full reaction to a judgment at the given tier: penalize on incorrect,
    /// reflect, then validate and consolidate when the tier asks for it.
    /// Ad hoc trials only reflect.
    pub async fn evolve(&self, trial: &Trial, judgment: &Judgment, tier: EvolutionTier) -> Result<EvolutionOutcome> {
        let penalized = if judgment.kind == JudgmentKind::Incorrect {
            self.penalize(trial)?
        } else {
            0
        };

        let governed = trial.run_id != AD_HOC_RUN;
        let consolidates = governed && tier.consolidates();
        let rule = self.reflect(trial, judgment, consolidates).await?;

        let mut validation = None;
        let mut consolidation = ConsolidationOutcome::Skipped;
        if consolidates {
            let allowed = if tier.validates() {
                let report = self.validate(trial, &rule)?;
                let passed = report.passed;
                if !passed {
                    info!(
                        run_id = trial.run_id,
                        trial_id = trial.id,
                        checked = report.checked,
                        conflicts = report.conflicts,
                        "Validation rejected rule; not consolidating"
                    );
                }
                validation = Some(report);
                passed
            } else {
                true
            };
            if allowed {
                // Pool failures never undo the run-scoped rule.
                consolidation = match self.consolidate(trial, &rule) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(run_id = trial.run_id, trial_id = trial.id, error = %e, "Consolidation failed");
                        ConsolidationOutcome::Skipped
                    }
                };
            }
        }

        if !governed || consolidates {
            self.push_external(trial, &rule).await;
        }

        Ok(EvolutionOutcome {
            rule,
            penalized,
            validation,
            consolidation,
        })
    }

    async fn push_external(&self, trial: &Trial, rule: &Rule) {
        let Some(external) = &self.external else {
            return;
        };
        let user_id = external_user_id(&self.user_prefix, trial.task_type);
        if let Err(e) = external.register(&user_id).await {
            debug!(user_id = %user_id, error = %e, "External register failed");
        }
        let content = format!(
            "apply_to={} trigger={} lesson={} confidence={:.4}",
            rule.apply_to, rule.trigger, rule.lesson, rule.confidence
        );
        let source = source_tag(trial.group.as_str(), trial.run_id, trial.id, rule.id);
        if let Err(e) = external.add(&user_id, &content, &source).await {
            warn!(user_id = %user_id, memory_id = rule.id, error = %e, "External add failed");
        }
    }
}
