//! Read-side views over stored runs: overall stats, trends and mode comparison.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::curves::{
    build_cumulative_curves, compute_trial_and_error, extract_round_flags, first_error_round, Curves,
    ModeCurve,
};
use super::schedule::RuleMode;
use super::stats::{compute_group_stats, GroupStats};
use crate::error::{Error, Result};
use crate::groups::Group;
use crate::memory::{Run, RunId, TrialLedger};

/// Which run a trend refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSelector {
    Id(RunId),
    /// Most recent run of a rule mode
    LatestOf(RuleMode),
}

/// Cumulative curves of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTrend {
    pub run_id: RunId,
    pub rule_mode: RuleMode,
    pub rounds: usize,
    pub thresholds: Vec<i64>,
    pub curves: BTreeMap<Group, Curves>,
}

/// Stats over every stored trial, optionally restricted to one group.
pub fn overall_stats<S: TrialLedger + ?Sized>(store: &S, group: Option<Group>, z: f64) -> Result<GroupStats> {
    Ok(compute_group_stats(&store.all_trials(group)?, z))
}

fn resolve_run<S: TrialLedger + ?Sized>(store: &S, selector: RunSelector) -> Result<Run> {
    match selector {
        RunSelector::Id(id) => store.get_run(id)?.ok_or_else(|| Error::not_found("run", id)),
        RunSelector::LatestOf(mode) => store
            .latest_run(mode)?
            .ok_or_else(|| Error::InvalidRequest(format!("no run with rule mode {}", mode))),
    }
}

/// Thresholds and cumulative curves of every group of a run.
pub fn run_trend<S: TrialLedger + ?Sized>(store: &S, selector: RunSelector) -> Result<RunTrend> {
    let run = resolve_run(store, selector)?;
    let rounds = run.runs_per_group;
    let thresholds = extract_round_flags(&store.run_trials(run.id, None)?, rounds).thresholds;

    let mut curves = BTreeMap::new();
    for &group in &run.groups {
        let flags = extract_round_flags(&store.run_trials(run.id, Some(group))?, rounds).flags;
        curves.insert(group, build_cumulative_curves(&flags, rounds));
    }

    Ok(RunTrend {
        run_id: run.id,
        rule_mode: run.rule_mode,
        rounds,
        thresholds,
        curves,
    })
}

/// Comparison view of one run. Adaptation metrics follow group C; they are
/// empty (and -1) when the run had no group C.
pub fn mode_curve<S: TrialLedger + ?Sized>(store: &S, run: &Run, z: f64) -> Result<ModeCurve> {
    let rounds = run.runs_per_group;
    let schedule = extract_round_flags(&store.run_trials(run.id, None)?, rounds);

    let mut overall = BTreeMap::new();
    let mut curves = BTreeMap::new();
    let mut first_errors = BTreeMap::new();
    let mut c_flags = None;
    for &group in &run.groups {
        let trials = store.run_trials(run.id, Some(group))?;
        let flags = extract_round_flags(&trials, rounds).flags;
        overall.insert(group, compute_group_stats(&trials, z));
        curves.insert(group, build_cumulative_curves(&flags, rounds));
        first_errors.insert(group, first_error_round(&flags));
        if group == Group::C {
            c_flags = Some(flags);
        }
    }

    let c_flags = c_flags.unwrap_or_default();
    Ok(ModeCurve {
        run_id: run.id,
        rule_mode: run.rule_mode,
        rounds,
        thresholds: schedule.thresholds,
        groups: run.groups.clone(),
        overall,
        curves,
        trial_and_error: compute_trial_and_error(&schedule.versions, &c_flags),
        first_error_round: first_errors,
        memory_change_start_round: first_error_round(&c_flags),
        memory_changes_per_round: c_flags,
    })
}

/// Mode curves of the latest `low` and `high` runs; modes never run are absent.
pub fn compare_modes<S: TrialLedger + ?Sized>(store: &S, z: f64) -> Result<BTreeMap<RuleMode, ModeCurve>> {
    let mut modes = BTreeMap::new();
    for mode in [RuleMode::Low, RuleMode::High] {
        if let Some(run) = store.latest_run(mode)? {
            modes.insert(mode, mode_curve(store, &run, z)?);
        }
    }
    Ok(modes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{NewRun, NewTrial, RoundStamp, SqliteStore};
    use crate::task::TaskKind;
    use pretty_assertions::assert_eq;

    fn seed_run(store: &SqliteStore, mode: RuleMode, c_flags: &[u8], versions: &[i64]) -> Run {
        let run = store
            .create_run(&NewRun {
                task_type: TaskKind::Lottery,
                action: "lottery".to_string(),
                runs_per_group: c_flags.len(),
                seed: 1,
                rule_mode: mode,
                groups: vec![Group::A, Group::C],
            })
            .unwrap();
        for (round, (&flag, &version)) in c_flags.iter().zip(versions).enumerate() {
            let stamp = RoundStamp {
                round: round as i64,
                rule_version: version,
                rule_threshold: if version % 2 == 1 { 100 } else { 120 },
            };
            for (group, incorrect) in [(Group::A, round % 2 == 0), (Group::C, flag == 1)] {
                let trial = store
                    .insert_trial(
                        &NewTrial::new(run.id, TaskKind::Lottery, r#"{"points":110}"#, group)
                            .with_stamp(stamp, mode)
                            .with_output(r#"{"allow": true}"#, 4),
                    )
                    .unwrap();
                store.set_trial_verdict(trial.id, !incorrect).unwrap();
            }
        }
        run
    }

    #[test]
    fn test_mode_curve() {
        let store = SqliteStore::in_memory().unwrap();
        let run = seed_run(&store, RuleMode::Low, &[0, 0, 1, 0, 1], &[1, 1, 2, 2, 2]);
        let curve = mode_curve(&store, &run, 1.96).unwrap();

        assert_eq!(curve.thresholds, vec![100, 100, 120, 120, 120]);
        assert_eq!(curve.trial_and_error.change_points, vec![2]);
        assert_eq!(curve.trial_and_error.attempts, vec![1]);
        assert_eq!(curve.first_error_round[&Group::A], 0);
        assert_eq!(curve.first_error_round[&Group::C], 2);
        assert_eq!(curve.memory_change_start_round, 2);
        assert_eq!(curve.memory_changes_per_round, vec![0, 0, 1, 0, 1]);
        assert_eq!(curve.overall[&Group::C].incorrect, 2);
        assert_eq!(curve.curves[&Group::C].cumulative_accuracy[1], 1.0);
    }

    #[test]
    fn test_compare_modes_uses_latest_runs() {
        let store = SqliteStore::in_memory().unwrap();
        seed_run(&store, RuleMode::Low, &[1, 1], &[1, 1]);
        let latest_low = seed_run(&store, RuleMode::Low, &[0, 0], &[1, 1]);
        let modes = compare_modes(&store, 1.96).unwrap();

        assert_eq!(modes.len(), 1);
        assert_eq!(modes[&RuleMode::Low].run_id, latest_low.id);
        assert_eq!(modes[&RuleMode::Low].memory_change_start_round, -1);
    }

    #[test]
    fn test_run_trend_by_mode_and_id() {
        let store = SqliteStore::in_memory().unwrap();
        let run = seed_run(&store, RuleMode::High, &[0, 1, 0], &[1, 2, 3]);

        let by_mode = run_trend(&store, RunSelector::LatestOf(RuleMode::High)).unwrap();
        let by_id = run_trend(&store, RunSelector::Id(run.id)).unwrap();
        assert_eq!(by_mode, by_id);
        assert_eq!(by_id.thresholds, vec![100, 120, 100]);
        assert_eq!(by_id.curves[&Group::C].cumulative_accuracy[1], 0.5);

        assert!(matches!(
            run_trend(&store, RunSelector::Id(999)),
            Err(Error::NotFound { entity: "run", .. })
        ));
        assert!(run_trend(&store, RunSelector::LatestOf(RuleMode::None)).is_err());
    }

    #[test]
    fn test_overall_stats() {
        let store = SqliteStore::in_memory().unwrap();
        seed_run(&store, RuleMode::Low, &[0, 1, 1, 1], &[1, 1, 2, 2]);
        let c = overall_stats(&store, Some(Group::C), 1.96).unwrap();
        assert_eq!((c.n, c.incorrect), (4, 3));
        assert_eq!(c.total_tokens, 16);
        let all = overall_stats(&store, None, 1.96).unwrap();
        assert_eq!(all.n, 8);
    }
}
