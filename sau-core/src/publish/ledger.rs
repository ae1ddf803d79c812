use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PublisherConfig;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one publish run as persisted for `sauctl history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub platform: String,
    pub account: String,
    pub content_type: String,
    pub title: String,
    pub success: bool,
    pub category: Option<String>,
    pub message: Option<String>,
    pub publish_attempts: u32,
    pub duration_ms: i64,
    pub trace: String,
    pub diagnostics: Option<PathBuf>,
}

/// Run history in SQLite plus an append-only JSONL log of failures.
#[derive(Debug)]
pub struct RunLedger {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl RunLedger {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let log_path = log_path.as_ref();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let ledger = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        ledger.initialize_db()?;
        Ok(ledger)
    }

    pub fn from_config(config: &PublisherConfig) -> Result<Self, LedgerError> {
        Self::new(config.failure_log(), config.ledger_db())
    }

    fn initialize_db(&self) -> Result<(), LedgerError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS publish_runs (
                ts TEXT NOT NULL,
                run_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                account TEXT NOT NULL,
                content_type TEXT NOT NULL,
                title TEXT NOT NULL,
                success INTEGER NOT NULL,
                category TEXT,
                message TEXT,
                publish_attempts INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                trace TEXT NOT NULL,
                diagnostics TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_runs_ts ON publish_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open_with_flags(&self.db_path, self.flags)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn record(&self, run: &RunRecord) -> Result<(), LedgerError> {
        if !run.success {
            let json = serde_json::to_string(run)?;
            if let Ok(mut guard) = self.log.lock() {
                writeln!(guard, "{json}")?;
                guard.flush()?;
            }
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO publish_runs (
                ts, run_id, platform, account, content_type, title, success, category,
                message, publish_attempts, duration_ms, trace, diagnostics
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.timestamp.to_rfc3339(),
                run.run_id,
                run.platform,
                run.account,
                run.content_type,
                run.title,
                if run.success { 1 } else { 0 },
                run.category,
                run.message,
                run.publish_attempts as i64,
                run.duration_ms,
                run.trace,
                run.diagnostics
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string()),
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn recent(&self, limit: usize) -> Result<Vec<RunRecord>, LedgerError> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT ts, run_id, platform, account, content_type, title, success, category,
                    message, publish_attempts, duration_ms, trace, diagnostics
             FROM publish_runs ORDER BY ts DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let ts: String = row.get(0)?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map(|value| value.with_timezone(&Utc))
                .map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
                })?;
            let diagnostics: Option<String> = row.get(12)?;
            Ok(RunRecord {
                timestamp,
                run_id: row.get(1)?,
                platform: row.get(2)?,
                account: row.get(3)?,
                content_type: row.get(4)?,
                title: row.get(5)?,
                success: row.get::<_, i64>(6)? != 0,
                category: row.get(7)?,
                message: row.get(8)?,
                publish_attempts: row.get::<_, i64>(9)? as u32,
                duration_ms: row.get(10)?,
                trace: row.get(11)?,
                diagnostics: diagnostics.map(PathBuf::from),
            })
        })?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(run_id: &str, success: bool, at: DateTime<Utc>) -> RunRecord {
        RunRecord {
            timestamp: at,
            run_id: run_id.into(),
            platform: "douyin".into(),
            account: "main".into(),
            content_type: "video".into(),
            title: "晚霞".into(),
            success,
            category: (!success).then(|| "publish_timeout".to_string()),
            message: (!success).then(|| "publish not confirmed".to_string()),
            publish_attempts: 2,
            duration_ms: 4_200,
            trace: "session_check -> navigate_entry".into(),
            diagnostics: (!success).then(|| PathBuf::from("logs/diagnostics/x")),
        }
    }

    #[test]
    fn ledger_persists_runs_and_logs_failures() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("logs/failures.jsonl");
        let ledger = RunLedger::new(&log_path, dir.path().join("data/runs.sqlite")).unwrap();
        let first = Utc::now() - chrono::Duration::minutes(1);
        ledger.record(&record("a", true, first)).unwrap();
        ledger.record(&record("b", false, Utc::now())).unwrap();

        let recent = ledger.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id, "b");
        assert_eq!(recent[0].category.as_deref(), Some("publish_timeout"));
        assert!(recent[1].success);
        assert_eq!(ledger.recent(1).unwrap().len(), 1);

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("\"run_id\":\"b\""));
    }
}
