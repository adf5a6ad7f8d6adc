//! Experiment request and its resolved, immutable form.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::schedule::{RuleMode, ThresholdSchedule};
use crate::error::{Error, Result};
use crate::groups::Group;
use crate::task::{generate_inputs, TaskKind};

/// Rounds per group when the request leaves it unset.
pub const DEFAULT_ROUNDS: usize = 30;

/// Request to start a run. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentRequest {
    /// Task kind (default `lottery`)
    pub task_type: Option<String>,
    /// Action name embedded in generated payloads (default `lottery`)
    pub action: Option<String>,
    /// Rounds per group (default 30)
    pub runs_per_group: Option<usize>,
    /// Input generator seed (default: current time)
    pub seed: Option<u64>,
    /// Groups in execution order (default A through F)
    pub groups: Option<Vec<String>>,
    /// Rule-change schedule (default `none`)
    pub rule_mode: Option<String>,
    /// Explicit inputs replacing the generated ones; needs at least one per round
    pub inputs: Option<Vec<String>>,
}

impl ExperimentRequest {
    pub fn new(task_type: TaskKind) -> Self {
        Self {
            task_type: Some(task_type.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.runs_per_group = Some(rounds);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_groups(mut self, groups: &[Group]) -> Self {
        self.groups = Some(groups.iter().map(|g| g.as_str().to_string()).collect());
        self
    }

    pub fn with_rule_mode(mut self, mode: RuleMode) -> Self {
        self.rule_mode = Some(mode.as_str().to_string());
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Apply defaults and validate.
    pub fn resolve(&self) -> Result<ResolvedRequest> {
        let task_type = match self.task_type.as_deref().map(str::trim) {
            None | Some("") => TaskKind::Lottery,
            Some(raw) => raw.parse()?,
        };
        let action = self
            .action
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or("lottery")
            .to_string();
        let rounds = match self.runs_per_group {
            None | Some(0) => DEFAULT_ROUNDS,
            Some(n) => n,
        };
        let seed = self.seed.unwrap_or_else(|| {
            Utc::now()
                .timestamp_nanos_opt()
                .map(|n| n as u64)
                .unwrap_or_default()
        });
        let rule_mode = match self.rule_mode.as_deref() {
            None => RuleMode::None,
            Some(raw) => raw.parse()?,
        };

        let mut groups = Vec::new();
        match &self.groups {
            Some(raw) if !raw.is_empty() => {
                for label in raw {
                    let group: Group = label.parse()?;
                    if !groups.contains(&group) {
                        groups.push(group);
                    }
                }
            }
            _ => groups.extend(Group::ALL),
        }

        let inputs = match &self.inputs {
            Some(given) if given.len() < rounds => {
                return Err(Error::InvalidRequest(format!(
                    "{} inputs given for {} rounds",
                    given.len(),
                    rounds
                )))
            }
            Some(given) => given[..rounds].to_vec(),
            None => generate_inputs(task_type, rounds, seed, &action),
        };

        Ok(ResolvedRequest {
            task_type,
            action,
            rounds,
            seed,
            groups,
            rule_mode,
            inputs,
        })
    }
}

/// A validated request with every default applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub task_type: TaskKind,
    pub action: String,
    pub rounds: usize,
    pub seed: u64,
    pub groups: Vec<Group>,
    pub rule_mode: RuleMode,
    /// One input per round, shared by every group
    pub inputs: Vec<String>,
}

impl ResolvedRequest {
    pub fn schedule(&self) -> ThresholdSchedule {
        ThresholdSchedule::for_task(self.task_type, self.rounds, self.rule_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let resolved = ExperimentRequest::default().with_seed(7).resolve().unwrap();
        assert_eq!(resolved.task_type, TaskKind::Lottery);
        assert_eq!(resolved.action, "lottery");
        assert_eq!(resolved.rounds, DEFAULT_ROUNDS);
        assert_eq!(resolved.groups, Group::ALL.to_vec());
        assert_eq!(resolved.rule_mode, RuleMode::None);
        assert_eq!(resolved.inputs.len(), DEFAULT_ROUNDS);
    }

    #[test]
    fn test_same_seed_same_inputs() {
        let a = ExperimentRequest::new(TaskKind::LotteryMulti).with_seed(42).resolve().unwrap();
        let b = ExperimentRequest::new(TaskKind::LotteryMulti).with_seed(42).resolve().unwrap();
        assert_eq!(a.inputs, b.inputs);
    }

    #[test]
    fn test_groups_parsed_in_order_without_duplicates() {
        let request = ExperimentRequest {
            groups: Some(vec!["c".into(), "A".into(), "C".into()]),
            ..ExperimentRequest::default()
        };
        assert_eq!(request.resolve().unwrap().groups, vec![Group::C, Group::A]);
    }

    #[test]
    fn test_unknown_values_rejected() {
        let bad_group = ExperimentRequest {
            groups: Some(vec!["Z".into()]),
            ..ExperimentRequest::default()
        };
        assert!(matches!(bad_group.resolve(), Err(Error::InvalidRequest(_))));

        let bad_task = ExperimentRequest {
            task_type: Some("roulette".into()),
            ..ExperimentRequest::default()
        };
        assert!(matches!(bad_task.resolve(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_inputs_override() {
        let inputs: Vec<String> = (0..5).map(|i| format!(r#"{{"points":{}}}"#, 100 + i)).collect();
        let resolved = ExperimentRequest::default()
            .with_rounds(3)
            .with_inputs(inputs.clone())
            .resolve()
            .unwrap();
        assert_eq!(resolved.inputs, inputs[..3].to_vec());

        let short = ExperimentRequest::default().with_rounds(10).with_inputs(inputs);
        assert!(matches!(short.resolve(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_schedule_follows_task() {
        let resolved = ExperimentRequest::new(TaskKind::Lottery)
            .with_rounds(20)
            .with_rule_mode(RuleMode::Low)
            .with_seed(1)
            .resolve()
            .unwrap();
        assert_eq!(resolved.schedule().change_points(), vec![10]);
    }
}
