//! Change-aware rule competition.
//!
//! A run-local detector watches the group's outcomes. Consecutive failures
//! declare a ground-truth change and open a new epoch; during the first rounds
//! of an epoch, rules that predate it and have not been verified since are
//! held back. Candidates compete on an epoch-local posterior of success.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::info;

use crate::memory::{Rule, RuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeAwareConfig {
    /// Consecutive incorrect outcomes that declare a change
    pub failure_streak: usize,
    /// Rounds after a change during which stale rules are excluded
    pub exploration_rounds: usize,
}

impl Default for ChangeAwareConfig {
    fn default() -> Self {
        Self {
            failure_streak: 2,
            exploration_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Arm {
    uses: u32,
    wins: u32,
}

#[derive(Debug, Clone)]
struct Epoch {
    first_round: i64,
    started_at: DateTime<Utc>,
}

/// Per-run detector state.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    config: ChangeAwareConfig,
    streak: usize,
    epoch: Option<Epoch>,
    arms: HashMap<RuleId, Arm>,
    changes: Vec<i64>,
}

impl ChangeDetector {
    pub fn new(config: ChangeAwareConfig) -> Self {
        Self {
            config,
            streak: 0,
            epoch: None,
            arms: HashMap::new(),
            changes: Vec::new(),
        }
    }

    /// Rounds at which a change was declared.
    pub fn changes(&self) -> &[i64] {
        &self.changes
    }

    /// `(wins + 1) / (uses + 2)` over the current epoch.
    pub fn posterior(&self, id: RuleId) -> f64 {
        let arm = self.arms.get(&id).copied().unwrap_or_default();
        (arm.wins as f64 + 1.0) / (arm.uses as f64 + 2.0)
    }

    pub fn in_exploration(&self, round: i64) -> bool {
        self.epoch.as_ref().is_some_and(|epoch| {
            round >= epoch.first_round && round < epoch.first_round + self.config.exploration_rounds as i64
        })
    }

    /// Record a judged outcome. Returns true when it declares a change; the
    /// new epoch starts at the next round.
    pub fn observe(&mut self, round: i64, memory_ids: &[RuleId], correct: bool) -> bool {
        for id in memory_ids {
            let arm = self.arms.entry(*id).or_default();
            arm.uses += 1;
            if correct {
                arm.wins += 1;
            }
        }

        if correct {
            self.streak = 0;
            return false;
        }
        self.streak += 1;
        if self.config.failure_streak == 0 || self.streak < self.config.failure_streak {
            return false;
        }

        self.streak = 0;
        self.arms.clear();
        self.epoch = Some(Epoch {
            first_round: round + 1,
            started_at: Utc::now().trunc_subsecs(6),
        });
        self.changes.push(round);
        info!(round, "Change detected; starting new epoch");
        true
    }

    fn is_stale(&self, rule: &Rule) -> bool {
        match &self.epoch {
            Some(epoch) => rule.created_at < epoch.started_at && !rule.verified_since(epoch.started_at),
            None => false,
        }
    }

    /// Pick up to `limit` candidates for `round`. Input order is the store's
    /// ranking and breaks posterior ties.
    pub fn select(&self, round: i64, candidates: Vec<Rule>, limit: usize) -> Vec<Rule> {
        let pool = if self.in_exploration(round) {
            let fresh: Vec<Rule> = candidates.iter().filter(|r| !self.is_stale(r)).cloned().collect();
            if fresh.is_empty() {
                candidates
            } else {
                fresh
            }
        } else {
            candidates
        };

        let mut scored: Vec<(f64, Rule)> = pool.into_iter().map(|r| (self.posterior(r.id), r)).collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, r)| r).collect()
    }
}
