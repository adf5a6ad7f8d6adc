//! SQLite schema and migrations for the harness store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL lets ad hoc requests read while an experiment writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_type TEXT NOT NULL,
            action TEXT NOT NULL,
            runs_per_group INTEGER NOT NULL,
            seed INTEGER NOT NULL,
            rule_mode TEXT NOT NULL,
            groups TEXT NOT NULL,
            result_path TEXT,
            conclusion_path TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL DEFAULT 0,
            trigger_text TEXT NOT NULL,
            trigger_key TEXT NOT NULL,
            lesson TEXT NOT NULL,
            apply_to TEXT NOT NULL,
            derived_from TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL DEFAULT 0.8 CHECK (confidence >= 0.0 AND confidence <= 1.0),
            version INTEGER NOT NULL DEFAULT 1,
            use_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            deprecated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_used_at TEXT,
            last_verified_at TEXT,
            last_failed_at TEXT,
            deprecated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS trials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL DEFAULT 0,
            task_type TEXT NOT NULL,
            input TEXT NOT NULL,
            output TEXT NOT NULL DEFAULT '',
            is_correct INTEGER,
            memory_ids TEXT NOT NULL DEFAULT '',
            token_count INTEGER NOT NULL DEFAULT 0,
            group_label TEXT NOT NULL,
            round INTEGER NOT NULL DEFAULT 0,
            rule_mode TEXT NOT NULL DEFAULT 'none',
            rule_version INTEGER NOT NULL DEFAULT 0,
            rule_threshold INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS judgments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL DEFAULT 0,
            trial_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            explanation TEXT NOT NULL,
            consumed INTEGER NOT NULL DEFAULT 0,
            memory_id INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY (trial_id) REFERENCES trials(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS case_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trial_id INTEGER NOT NULL,
            run_id INTEGER NOT NULL DEFAULT 0,
            task_type TEXT NOT NULL,
            group_label TEXT NOT NULL,
            prompt TEXT NOT NULL,
            input TEXT NOT NULL,
            memory_ids TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            FOREIGN KEY (trial_id) REFERENCES trials(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_rules_scope ON rules(run_id, apply_to, deprecated);
        CREATE INDEX IF NOT EXISTS idx_rules_family ON rules(trigger_key, apply_to, run_id);
        CREATE INDEX IF NOT EXISTS idx_trials_run_group ON trials(run_id, group_label, round);
        CREATE INDEX IF NOT EXISTS idx_judgments_run_kind ON judgments(run_id, kind);
        CREATE INDEX IF NOT EXISTS idx_case_logs_trial ON case_logs(trial_id);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;",
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='rules'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}
