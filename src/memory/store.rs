//! SQLite-backed rule store.
//!
//! Counter-style mutations (use count, failures, confidence deltas,
//! deprecation) are single UPDATE statements evaluated by SQLite, so two
//! requests touching the same rule through separate connections cannot lose
//! an update.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::ledger::TrialLedger;
use crate::memory::schema::{initialize_schema, is_initialized};
use crate::memory::types::*;
use crate::normalize::{normalize_trigger_key, WILDCARD_SCOPE};

/// Storage interface for rules.
///
/// Every counter mutation is atomic on the storage side; implementations must
/// not read-modify-write.
pub trait RuleStore: Send + Sync {
    /// Insert a rule as the next version of its family
    /// (merge key + applies-to + run).
    fn insert_rule(&self, rule: &NewRule) -> Result<Rule>;

    fn get_rule(&self, id: RuleId) -> Result<Option<Rule>>;

    /// Highest version in a family, 0 when the family is empty.
    fn max_family_version(&self, trigger_key: &str, apply_to: &str, run_id: RunId) -> Result<i64>;

    /// Newest global-pool entry of a family.
    fn latest_global_rule(&self, trigger_key: &str, apply_to: &str) -> Result<Option<Rule>>;

    /// Non-deprecated rules visible in `scope` that apply to `task_type`,
    /// in primary ranking order.
    fn candidate_rules(&self, scope: RetrievalScope, task_type: &str, limit: usize) -> Result<Vec<Rule>>;

    /// Increment use counters and stamp last use.
    fn record_usage(&self, ids: &[RuleId], at: DateTime<Utc>) -> Result<usize>;

    /// Nudge confidence up and stamp last verification.
    fn record_verification(&self, ids: &[RuleId], step: f64, at: DateTime<Utc>) -> Result<usize>;

    /// Count a failure, nudge confidence down and deprecate once the failure
    /// count reaches `deprecate_after`.
    fn record_failure(
        &self,
        ids: &[RuleId],
        step: f64,
        deprecate_after: i64,
        at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Add repeated evidence to an existing rule.
    fn reinforce_rule(&self, id: RuleId, step: f64, at: DateTime<Utc>) -> Result<bool>;

    fn list_rules(&self, query: &RuleQuery) -> Result<Vec<Rule>>;

    /// Soft-deprecate a rule. Returns false if it does not exist.
    fn retire_rule(&self, id: RuleId, at: DateTime<Utc>) -> Result<bool>;
}

/// Combined storage interface used by the harness.
pub trait Store: RuleStore + TrialLedger {}

impl<T: RuleStore + TrialLedger> Store for T {}

/// How long a connection waits for another writer before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store for rules, runs, trials, judgments and case logs.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

pub(crate) const RULE_COLUMNS: &str = "id, run_id, trigger_text, trigger_key, lesson, apply_to, derived_from,
    confidence, version, use_count, failure_count, deprecated, created_at, updated_at,
    last_used_at, last_verified_at, last_failed_at, deprecated_at";

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that text order
/// equals time order.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts_text(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn decode_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_ts_text(idx, &raw)
}

pub(crate) fn decode_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| decode_ts_text(idx, &s)).transpose()
}

/// Parse a text column through the domain `FromStr`.
pub(crate) fn decode_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        } else {
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(|e| Error::Storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    pub(crate) fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&mut conn).map_err(|e| Error::Storage(e.to_string()))
    }

    fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
        Ok(Rule {
            id: row.get(0)?,
            run_id: row.get(1)?,
            trigger: row.get(2)?,
            trigger_key: row.get(3)?,
            lesson: row.get(4)?,
            apply_to: row.get(5)?,
            derived_from: row.get(6)?,
            confidence: row.get(7)?,
            version: row.get(8)?,
            use_count: row.get(9)?,
            failure_count: row.get(10)?,
            deprecated: row.get::<_, i64>(11)? != 0,
            created_at: decode_ts(row, 12)?,
            updated_at: decode_ts(row, 13)?,
            last_used_at: decode_opt_ts(row, 14)?,
            last_verified_at: decode_opt_ts(row, 15)?,
            last_failed_at: decode_opt_ts(row, 16)?,
            deprecated_at: decode_opt_ts(row, 17)?,
        })
    }

    fn query_rule(conn: &Connection, id: RuleId) -> rusqlite::Result<Option<Rule>> {
        conn.query_row(
            &format!("SELECT {} FROM rules WHERE id = ?1", RULE_COLUMNS),
            params![id],
            Self::row_to_rule,
        )
        .optional()
    }

    fn update_each(
        &self,
        sql: &str,
        ids: &[RuleId],
        bind: impl Fn(RuleId) -> Vec<SqlValue>,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute(params_from_iter(bind(*id)))?;
            }
            Ok(changed)
        })
    }
}

impl RuleStore for SqliteStore {
    fn insert_rule(&self, rule: &NewRule) -> Result<Rule> {
        let trigger_key = normalize_trigger_key(&rule.trigger);
        let now = encode_ts(Utc::now());
        let confidence = clamp_confidence(rule.confidence);

        let inserted = self.with_conn(|conn| {
            // Version assignment and insert happen in one statement.
            conn.execute(
                "INSERT INTO rules (
                    run_id, trigger_text, trigger_key, lesson, apply_to, derived_from,
                    confidence, version, use_count, failure_count, deprecated, created_at, updated_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(MAX(version), 0) + 1, 0, 0, 0, ?8, ?8
                FROM rules
                WHERE trigger_key = ?3 AND apply_to = ?5 AND run_id = ?1",
                params![
                    rule.run_id,
                    rule.trigger,
                    trigger_key,
                    rule.lesson,
                    rule.apply_to,
                    rule.derived_from,
                    confidence,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            Self::query_rule(conn, id)
        })?;

        let inserted =
            inserted.ok_or_else(|| Error::Internal("inserted rule vanished".to_string()))?;
        debug!(
            memory_id = inserted.id,
            run_id = inserted.run_id,
            version = inserted.version,
            key = %inserted.trigger_key,
            "Inserted rule"
        );
        Ok(inserted)
    }

    fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        self.with_conn(|conn| Self::query_rule(conn, id))
    }

    fn max_family_version(&self, trigger_key: &str, apply_to: &str, run_id: RunId) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM rules
                 WHERE trigger_key = ?1 AND apply_to = ?2 AND run_id = ?3",
                params![trigger_key, apply_to, run_id],
                |row| row.get(0),
            )
        })
    }

    fn latest_global_rule(&self, trigger_key: &str, apply_to: &str) -> Result<Option<Rule>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM rules
                     WHERE run_id = 0 AND apply_to = ?1 AND trigger_key = ?2
                       AND derived_from LIKE 'global|%'
                     ORDER BY version DESC, id DESC LIMIT 1",
                    RULE_COLUMNS
                ),
                params![apply_to, trigger_key],
                Self::row_to_rule,
            )
            .optional()
        })
    }

    fn candidate_rules(&self, scope: RetrievalScope, task_type: &str, limit: usize) -> Result<Vec<Rule>> {
        let mut sql = format!(
            "SELECT {} FROM rules WHERE deprecated = 0 AND (apply_to = ?1 OR apply_to = ?2)",
            RULE_COLUMNS
        );
        let mut args: Vec<SqlValue> = vec![
            SqlValue::Text(task_type.to_string()),
            SqlValue::Text(WILDCARD_SCOPE.to_string()),
        ];

        match scope {
            RetrievalScope::Unscoped => {}
            RetrievalScope::RunIsolated(run_id) => {
                sql.push_str(" AND run_id = ?3");
                args.push(SqlValue::Integer(run_id));
            }
            RetrievalScope::RunPlusGlobal(run_id) => {
                sql.push_str(" AND (run_id = ?3 OR (run_id = 0 AND derived_from LIKE 'global|%'))");
                args.push(SqlValue::Integer(run_id));
            }
        }

        // NULL timestamps sort last under DESC
        sql.push_str(
            " ORDER BY last_verified_at DESC, version DESC, confidence DESC,
                       use_count DESC, updated_at DESC, id DESC",
        );
        sql.push_str(&format!(" LIMIT {}", limit));

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), Self::row_to_rule)?;
            rows.collect()
        })
    }

    fn record_usage(&self, ids: &[RuleId], at: DateTime<Utc>) -> Result<usize> {
        let at = encode_ts(at);
        self.update_each(
            "UPDATE rules SET use_count = use_count + 1, last_used_at = ?2 WHERE id = ?1",
            ids,
            |id| vec![SqlValue::Integer(id), SqlValue::Text(at.clone())],
        )
    }

    fn record_verification(&self, ids: &[RuleId], step: f64, at: DateTime<Utc>) -> Result<usize> {
        let at = encode_ts(at);
        self.update_each(
            "UPDATE rules SET
                last_verified_at = ?2,
                confidence = MIN(MAX(confidence + ?3, 0.0), 1.0),
                updated_at = ?2
             WHERE id = ?1",
            ids,
            |id| {
                vec![
                    SqlValue::Integer(id),
                    SqlValue::Text(at.clone()),
                    SqlValue::Real(step),
                ]
            },
        )
    }

    fn record_failure(
        &self,
        ids: &[RuleId],
        step: f64,
        deprecate_after: i64,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let at = encode_ts(at);
        // Right-hand sides see pre-update values, so deprecated_at is only
        // stamped on the transition.
        self.update_each(
            "UPDATE rules SET
                failure_count = failure_count + 1,
                last_failed_at = ?2,
                confidence = MIN(MAX(confidence - ?3, 0.0), 1.0),
                deprecated = CASE WHEN failure_count + 1 >= ?4 THEN 1 ELSE deprecated END,
                deprecated_at = CASE
                    WHEN deprecated = 0 AND failure_count + 1 >= ?4 THEN ?2
                    ELSE deprecated_at
                END,
                updated_at = ?2
             WHERE id = ?1",
            ids,
            |id| {
                vec![
                    SqlValue::Integer(id),
                    SqlValue::Text(at.clone()),
                    SqlValue::Real(step),
                    SqlValue::Integer(deprecate_after),
                ]
            },
        )
    }

    fn reinforce_rule(&self, id: RuleId, step: f64, at: DateTime<Utc>) -> Result<bool> {
        let at = encode_ts(at);
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE rules SET confidence = MIN(MAX(confidence + ?2, 0.0), 1.0), updated_at = ?3
                 WHERE id = ?1",
                params![id, step, at],
            )?;
            Ok(changed > 0)
        })
    }

    fn list_rules(&self, query: &RuleQuery) -> Result<Vec<Rule>> {
        let mut sql = format!("SELECT {} FROM rules WHERE 1 = 1", RULE_COLUMNS);
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(run_id) = query.run_id {
            args.push(SqlValue::Integer(run_id));
            sql.push_str(&format!(" AND run_id = ?{}", args.len()));
        }
        if let Some(apply_to) = &query.apply_to {
            args.push(SqlValue::Text(apply_to.clone()));
            sql.push_str(&format!(" AND apply_to = ?{}", args.len()));
        }
        if !query.include_deprecated {
            sql.push_str(" AND deprecated = 0");
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), Self::row_to_rule)?;
            rows.collect()
        })
    }

    fn retire_rule(&self, id: RuleId, at: DateTime<Utc>) -> Result<bool> {
        let at = encode_ts(at);
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE rules SET
                    deprecated = 1,
                    deprecated_at = CASE WHEN deprecated = 0 THEN ?2 ELSE deprecated_at END,
                    updated_at = ?2
                 WHERE id = ?1",
                params![id, at],
            )?;
            Ok(changed > 0)
        })
    }
}
