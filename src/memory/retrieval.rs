//! Rule retrieval and ranking.
//!
//! The store returns candidates in primary order (recent verification,
//! version, confidence, use count, recency of update). Callers may then
//! re-rank by closeness of each rule's embedded threshold to the input's
//! numeric feature before committing the selection, which stamps usage.

use chrono::Utc;
use std::cmp::Ordering;
use tracing::debug;

use crate::error::Result;
use crate::memory::store::RuleStore;
use crate::memory::types::{RetrievalScope, Rule, RuleId};

/// Relevance of a rule to an input feature: `1 / (1 + |threshold - feature|)`,
/// or 0 when the rule carries no threshold.
pub fn relevance(rule: &Rule, feature: f64) -> f64 {
    match rule.threshold() {
        Some(t) => 1.0 / (1.0 + (t as f64 - feature).abs()),
        None => 0.0,
    }
}

/// Stable re-sort by descending relevance to `feature`.
pub fn rerank_by_feature(rules: Vec<Rule>, feature: f64) -> Vec<Rule> {
    if rules.len() <= 1 {
        return rules;
    }
    let mut scored: Vec<(f64, Rule)> = rules.into_iter().map(|r| (relevance(&r, feature), r)).collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    scored.into_iter().map(|(_, r)| r).collect()
}

/// Stamp usage on a final selection.
pub fn commit_selection<S: RuleStore + ?Sized>(store: &S, rules: &[Rule]) -> Result<Vec<RuleId>> {
    let ids: Vec<RuleId> = rules.iter().map(|r| r.id).collect();
    if !ids.is_empty() {
        store.record_usage(&ids, Utc::now())?;
    }
    Ok(ids)
}

/// Retrieve up to `limit` rules for a task, optionally re-ranked by an input
/// feature, and record their use.
pub fn retrieve<S: RuleStore + ?Sized>(
    store: &S,
    scope: RetrievalScope,
    task_type: &str,
    limit: usize,
    feature: Option<f64>,
) -> Result<Vec<Rule>> {
    let candidates = store.candidate_rules(scope, task_type, limit)?;
    let selected = match feature {
        Some(f) => rerank_by_feature(candidates, f),
        None => candidates,
    };
    let ids = commit_selection(store, &selected)?;
    debug!(?scope, task_type, ?ids, "Retrieved rules");
    Ok(selected)
}
