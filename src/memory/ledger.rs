//! Runs, trials, judgments and case logs.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::info;

use crate::error::{Error, Result};
use crate::experiment::RuleMode;
use crate::groups::Group;
use crate::memory::store::{decode_parsed, decode_ts, encode_ts, SqliteStore};
use crate::memory::types::*;
use crate::normalize::{format_memory_ids, parse_memory_ids};
use crate::task::TaskKind;

/// Storage interface for experiment bookkeeping.
pub trait TrialLedger: Send + Sync {
    fn create_run(&self, run: &NewRun) -> Result<Run>;

    fn get_run(&self, id: RunId) -> Result<Option<Run>>;

    /// Most recent run with the given rule-change mode.
    fn latest_run(&self, mode: RuleMode) -> Result<Option<Run>>;

    fn set_run_outputs(&self, id: RunId, result_path: &str, conclusion_path: &str) -> Result<()>;

    fn insert_trial(&self, trial: &NewTrial) -> Result<Trial>;

    fn get_trial(&self, id: TrialId) -> Result<Option<Trial>>;

    /// Set (or explicitly re-set) a trial's correctness.
    fn set_trial_verdict(&self, id: TrialId, is_correct: bool) -> Result<()>;

    /// Trials of a run, optionally for one group, ordered by round.
    fn run_trials(&self, run_id: RunId, group: Option<Group>) -> Result<Vec<Trial>>;

    /// Trials across all runs, optionally for one group.
    fn all_trials(&self, group: Option<Group>) -> Result<Vec<Trial>>;

    /// Newest correct trials of a group; the run filter applies only to real runs.
    fn recent_correct_trials(
        &self,
        run_id: RunId,
        task_type: TaskKind,
        group: Group,
        limit: usize,
    ) -> Result<Vec<Trial>>;

    /// Newest trials of a run that carry a scheduled threshold.
    fn recent_scheduled_trials(&self, run_id: RunId, task_type: TaskKind, limit: usize) -> Result<Vec<Trial>>;

    fn insert_judgment(&self, trial: &Trial, kind: JudgmentKind, explanation: &str) -> Result<Judgment>;

    fn latest_judgment(&self, trial_id: TrialId) -> Result<Option<Judgment>>;

    /// Mark a judgment consumed by evolution, linking the rule it produced.
    fn mark_judgment_consumed(&self, id: JudgmentId, memory_id: Option<RuleId>) -> Result<()>;

    /// Newest incorrect judgments of a run for a task type, returned oldest first.
    fn recent_incorrect_judgments(&self, run_id: RunId, task_type: TaskKind, limit: usize) -> Result<Vec<Judgment>>;

    fn insert_case_log(&self, log: &NewCaseLog) -> Result<i64>;

    /// Delete all experiment data in a single transaction.
    fn reset_all(&self) -> Result<ResetSummary>;
}

const RUN_COLUMNS: &str = "id, task_type, action, runs_per_group, seed, rule_mode, groups,
    result_path, conclusion_path, created_at";

const TRIAL_COLUMNS: &str = "id, run_id, task_type, input, output, is_correct, memory_ids,
    token_count, group_label, round, rule_mode, rule_version, rule_threshold, error, created_at";

const JUDGMENT_COLUMNS: &str = "id, run_id, trial_id, kind, explanation, consumed, memory_id, created_at";

fn encode_groups(groups: &[Group]) -> String {
    groups.iter().map(|g| g.as_str()).collect::<Vec<_>>().join(",")
}

fn decode_groups(raw: &str) -> Result<Vec<Group>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let groups_raw: String = row.get(6)?;
    let groups = decode_groups(&groups_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Run {
        id: row.get(0)?,
        task_type: decode_parsed(row, 1)?,
        action: row.get(2)?,
        runs_per_group: row.get::<_, i64>(3)?.max(0) as usize,
        seed: row.get::<_, i64>(4)? as u64,
        rule_mode: decode_parsed(row, 5)?,
        groups,
        result_path: row.get(7)?,
        conclusion_path: row.get(8)?,
        created_at: decode_ts(row, 9)?,
    })
}

fn row_to_trial(row: &Row<'_>) -> rusqlite::Result<Trial> {
    let memory_ids: String = row.get(6)?;
    Ok(Trial {
        id: row.get(0)?,
        run_id: row.get(1)?,
        task_type: decode_parsed(row, 2)?,
        input: row.get(3)?,
        output: row.get(4)?,
        is_correct: row.get::<_, Option<i64>>(5)?.map(|v| v != 0),
        memory_ids: parse_memory_ids(&memory_ids),
        token_count: row.get(7)?,
        group: decode_parsed(row, 8)?,
        round: row.get(9)?,
        rule_mode: decode_parsed(row, 10)?,
        rule_version: row.get(11)?,
        rule_threshold: row.get(12)?,
        error: row.get(13)?,
        created_at: decode_ts(row, 14)?,
    })
}

fn row_to_judgment(row: &Row<'_>) -> rusqlite::Result<Judgment> {
    Ok(Judgment {
        id: row.get(0)?,
        run_id: row.get(1)?,
        trial_id: row.get(2)?,
        kind: decode_parsed(row, 3)?,
        explanation: row.get(4)?,
        consumed: row.get::<_, i64>(5)? != 0,
        memory_id: row.get(6)?,
        created_at: decode_ts(row, 7)?,
    })
}

fn query_trials(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> rusqlite::Result<Vec<Trial>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_trial)?;
    rows.collect()
}

impl TrialLedger for SqliteStore {
    fn create_run(&self, run: &NewRun) -> Result<Run> {
        let now = encode_ts(Utc::now());
        let created = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (task_type, action, runs_per_group, seed, rule_mode, groups, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.task_type.as_str(),
                    run.action,
                    run.runs_per_group as i64,
                    run.seed as i64,
                    run.rule_mode.as_str(),
                    encode_groups(&run.groups),
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                row_to_run,
            )
        })?;
        info!(run_id = created.id, task_type = %created.task_type, mode = %created.rule_mode, "Created run");
        Ok(created)
    }

    fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                row_to_run,
            )
            .optional()
        })
    }

    fn latest_run(&self, mode: RuleMode) -> Result<Option<Run>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM runs WHERE rule_mode = ?1 ORDER BY id DESC LIMIT 1",
                    RUN_COLUMNS
                ),
                params![mode.as_str()],
                row_to_run,
            )
            .optional()
        })
    }

    fn set_run_outputs(&self, id: RunId, result_path: &str, conclusion_path: &str) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE runs SET result_path = ?2, conclusion_path = ?3 WHERE id = ?1",
                params![id, result_path, conclusion_path],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("run", id));
        }
        Ok(())
    }

    fn insert_trial(&self, trial: &NewTrial) -> Result<Trial> {
        let now = encode_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO trials (
                    run_id, task_type, input, output, is_correct, memory_ids, token_count,
                    group_label, round, rule_mode, rule_version, rule_threshold, error, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    trial.run_id,
                    trial.task_type.as_str(),
                    trial.input,
                    trial.output,
                    trial.is_correct.map(i64::from),
                    format_memory_ids(&trial.memory_ids),
                    trial.token_count,
                    trial.group.as_str(),
                    trial.stamp.round,
                    trial.rule_mode.as_str(),
                    trial.stamp.rule_version,
                    trial.stamp.rule_threshold,
                    trial.error,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM trials WHERE id = ?1", TRIAL_COLUMNS),
                params![id],
                row_to_trial,
            )
        })
    }

    fn get_trial(&self, id: TrialId) -> Result<Option<Trial>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM trials WHERE id = ?1", TRIAL_COLUMNS),
                params![id],
                row_to_trial,
            )
            .optional()
        })
    }

    fn set_trial_verdict(&self, id: TrialId, is_correct: bool) -> Result<()> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "UPDATE trials SET is_correct = ?2 WHERE id = ?1",
                params![id, is_correct as i64],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("trial", id));
        }
        Ok(())
    }

    fn run_trials(&self, run_id: RunId, group: Option<Group>) -> Result<Vec<Trial>> {
        self.with_conn(|conn| match group {
            Some(g) => query_trials(
                conn,
                &format!(
                    "SELECT {} FROM trials WHERE run_id = ?1 AND group_label = ?2 ORDER BY round, id",
                    TRIAL_COLUMNS
                ),
                params![run_id, g.as_str()],
            ),
            None => query_trials(
                conn,
                &format!(
                    "SELECT {} FROM trials WHERE run_id = ?1 ORDER BY round, id",
                    TRIAL_COLUMNS
                ),
                params![run_id],
            ),
        })
    }

    fn all_trials(&self, group: Option<Group>) -> Result<Vec<Trial>> {
        self.with_conn(|conn| match group {
            Some(g) => query_trials(
                conn,
                &format!("SELECT {} FROM trials WHERE group_label = ?1 ORDER BY id", TRIAL_COLUMNS),
                params![g.as_str()],
            ),
            None => query_trials(
                conn,
                &format!("SELECT {} FROM trials ORDER BY id", TRIAL_COLUMNS),
                params![],
            ),
        })
    }

    fn recent_correct_trials(
        &self,
        run_id: RunId,
        task_type: TaskKind,
        group: Group,
        limit: usize,
    ) -> Result<Vec<Trial>> {
        let limit = limit as i64;
        self.with_conn(|conn| {
            if run_id > AD_HOC_RUN {
                query_trials(
                    conn,
                    &format!(
                        "SELECT {} FROM trials
                         WHERE task_type = ?1 AND group_label = ?2 AND is_correct = 1 AND run_id = ?3
                         ORDER BY id DESC LIMIT ?4",
                        TRIAL_COLUMNS
                    ),
                    params![task_type.as_str(), group.as_str(), run_id, limit],
                )
            } else {
                query_trials(
                    conn,
                    &format!(
                        "SELECT {} FROM trials
                         WHERE task_type = ?1 AND group_label = ?2 AND is_correct = 1
                         ORDER BY id DESC LIMIT ?3",
                        TRIAL_COLUMNS
                    ),
                    params![task_type.as_str(), group.as_str(), limit],
                )
            }
        })
    }

    fn recent_scheduled_trials(&self, run_id: RunId, task_type: TaskKind, limit: usize) -> Result<Vec<Trial>> {
        let limit = limit as i64;
        self.with_conn(|conn| {
            query_trials(
                conn,
                &format!(
                    "SELECT {} FROM trials
                     WHERE run_id = ?1 AND task_type = ?2 AND rule_threshold > 0
                     ORDER BY id DESC LIMIT ?3",
                    TRIAL_COLUMNS
                ),
                params![run_id, task_type.as_str(), limit],
            )
        })
    }

    fn insert_judgment(&self, trial: &Trial, kind: JudgmentKind, explanation: &str) -> Result<Judgment> {
        let now = encode_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO judgments (run_id, trial_id, kind, explanation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![trial.run_id, trial.id, kind.as_str(), explanation, now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {} FROM judgments WHERE id = ?1", JUDGMENT_COLUMNS),
                params![id],
                row_to_judgment,
            )
        })
    }

    fn latest_judgment(&self, trial_id: TrialId) -> Result<Option<Judgment>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM judgments WHERE trial_id = ?1 ORDER BY id DESC LIMIT 1",
                    JUDGMENT_COLUMNS
                ),
                params![trial_id],
                row_to_judgment,
            )
            .optional()
        })
    }

    fn mark_judgment_consumed(&self, id: JudgmentId, memory_id: Option<RuleId>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE judgments SET consumed = 1, memory_id = COALESCE(?2, memory_id) WHERE id = ?1",
                params![id, memory_id],
            )
        })?;
        Ok(())
    }

    fn recent_incorrect_judgments(&self, run_id: RunId, task_type: TaskKind, limit: usize) -> Result<Vec<Judgment>> {
        if run_id == AD_HOC_RUN || limit == 0 {
            return Ok(Vec::new());
        }
        let mut judgments = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT j.id, j.run_id, j.trial_id, j.kind, j.explanation, j.consumed, j.memory_id, j.created_at
                 FROM judgments j JOIN trials t ON t.id = j.trial_id
                 WHERE j.run_id = ?1 AND t.task_type = ?2 AND j.kind = 'incorrect'
                 ORDER BY j.id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![run_id, task_type.as_str(), limit as i64],
                row_to_judgment,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        judgments.reverse();
        Ok(judgments)
    }

    fn insert_case_log(&self, log: &NewCaseLog) -> Result<i64> {
        let now = encode_ts(Utc::now());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO case_logs (trial_id, run_id, task_type, group_label, prompt, input, memory_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    log.trial_id,
                    log.run_id,
                    log.task_type.as_str(),
                    log.group.as_str(),
                    log.prompt,
                    log.input,
                    format_memory_ids(&log.memory_ids),
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn reset_all(&self) -> Result<ResetSummary> {
        let summary = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let summary = ResetSummary {
                case_logs: tx.execute("DELETE FROM case_logs", [])?,
                judgments: tx.execute("DELETE FROM judgments", [])?,
                trials: tx.execute("DELETE FROM trials", [])?,
                rules: tx.execute("DELETE FROM rules", [])?,
                runs: tx.execute("DELETE FROM runs", [])?,
            };
            tx.commit()?;
            Ok(summary)
        })?;
        info!(
            trials = summary.trials,
            rules = summary.rules,
            runs = summary.runs,
            "Reset all experiment data"
        );
        Ok(summary)
    }
}
