//! Treatment groups and their memory policies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::memory::{RetrievalScope, RunId};

/// How far the evolution step goes after an incorrect judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionTier {
    /// Penalize consulted rules and write a new run-scoped version
    Reflect,
    /// ...then promote the lesson into the global pool
    ReflectConsolidate,
    /// ...promoting only if the lesson agrees with recent ground truth
    ReflectValidateConsolidate,
}

impl EvolutionTier {
    pub fn consolidates(&self) -> bool {
        !matches!(self, EvolutionTier::Reflect)
    }

    pub fn validates(&self) -> bool {
        matches!(self, EvolutionTier::ReflectValidateConsolidate)
    }
}

/// Treatment group label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Group {
    /// No memory
    A,
    /// Raw case logs of earlier correct trials
    B,
    /// Abstracted run-scoped rules
    C,
    /// Rules plus the cross-session pool and recent mistakes
    D,
    /// Relevance-ranked rules, validated consolidation and a self-check stage
    E,
    /// Change-aware competition between rules
    F,
}

impl Group {
    pub const ALL: [Group; 6] = [Group::A, Group::B, Group::C, Group::D, Group::E, Group::F];

    /// Groups treated as controls in pairwise tests.
    pub const CONTROLS: [Group; 2] = [Group::A, Group::B];

    /// Groups whose memory effect is tested against the controls.
    pub const TREATMENTS: [Group; 4] = [Group::C, Group::D, Group::E, Group::F];

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::A => "A",
            Group::B => "B",
            Group::C => "C",
            Group::D => "D",
            Group::E => "E",
            Group::F => "F",
        }
    }

    /// Whether the group consults abstracted rules.
    pub fn uses_rules(&self) -> bool {
        matches!(self, Group::C | Group::D | Group::E | Group::F)
    }

    /// Whether the group consults raw case logs.
    pub fn uses_case_logs(&self) -> bool {
        matches!(self, Group::B)
    }

    /// Retrieval scope for a trial of this group in the given run.
    pub fn scope(&self, run_id: RunId) -> RetrievalScope {
        RetrievalScope::for_run(run_id, matches!(self, Group::D | Group::E | Group::F))
    }

    /// How many recent incorrect judgments are shown as short-term memory.
    pub fn recent_incorrect_limit(&self) -> usize {
        match self {
            Group::D => 2,
            Group::E | Group::F => 3,
            _ => 0,
        }
    }

    /// Whether candidates are re-ranked by closeness to the input feature.
    pub fn reranks_by_input(&self) -> bool {
        matches!(self, Group::E)
    }

    /// Whether rules compete on epoch-local evidence after a detected change.
    pub fn competes(&self) -> bool {
        matches!(self, Group::F)
    }

    /// Whether the external memory service may supplement weak local recall in a run.
    pub fn uses_external_memory(&self) -> bool {
        matches!(self, Group::D | Group::E | Group::F)
    }

    /// Whether a second self-check stage revises the first answer.
    pub fn self_checks(&self) -> bool {
        matches!(self, Group::E)
    }

    /// Evolution applied after an incorrect judgment, if any.
    pub fn evolution_tier(&self) -> Option<EvolutionTier> {
        match self {
            Group::A | Group::B => None,
            Group::C => Some(EvolutionTier::Reflect),
            Group::D => Some(EvolutionTier::ReflectConsolidate),
            Group::E | Group::F => Some(EvolutionTier::ReflectValidateConsolidate),
        }
    }

    /// Whether consulted rules are verified after a correct judgment.
    pub fn verifies(&self) -> bool {
        self.uses_rules()
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Group::A),
            "B" => Ok(Group::B),
            "C" => Ok(Group::C),
            "D" => Ok(Group::D),
            "E" => Ok(Group::E),
            "F" => Ok(Group::F),
            other => Err(Error::InvalidRequest(format!("unknown group: {}", other))),
        }
    }
}
