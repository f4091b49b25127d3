use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use super::models::*;
use crate::errors::ReasonCode;

const ACTIVE_RUN_STATUSES: &str = "('queued', 'running')";

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads. The mutex also serializes writers, which is what
/// makes run admission a single check-and-set.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(db: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Result of the atomic admission check.
#[derive(Debug, Clone)]
pub enum Admission {
    Admitted(Run),
    Conflict { run_id: i64 },
    TargetNotFound,
    TargetInactive(TargetStatus),
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS targets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    url TEXT,
                    ip_address TEXT,
                    repo_url TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    last_run_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_id INTEGER NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'queued',
                    current_phase TEXT,
                    reason_code TEXT,
                    error TEXT,
                    remediation TEXT,
                    pr_url TEXT,
                    report_ref TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS phase_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    phase TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    output_ref TEXT,
                    summary TEXT NOT NULL DEFAULT '{}',
                    notes TEXT NOT NULL DEFAULT '[]',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    UNIQUE(run_id, seq),
                    UNIQUE(run_id, phase)
                );

                CREATE TABLE IF NOT EXISTS findings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    category TEXT NOT NULL,
                    severity TEXT NOT NULL DEFAULT 'medium',
                    title TEXT NOT NULL DEFAULT '',
                    endpoint TEXT,
                    param TEXT,
                    file_path TEXT,
                    description TEXT NOT NULL DEFAULT '',
                    evidence_ref TEXT,
                    exploited INTEGER NOT NULL DEFAULT 0,
                    exploit_output_ref TEXT,
                    patched INTEGER NOT NULL DEFAULT 0,
                    proof_ref TEXT,
                    triage TEXT NOT NULL DEFAULT 'open',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id);
                CREATE INDEX IF NOT EXISTS idx_phase_records_run ON phase_records(run_id);
                CREATE INDEX IF NOT EXISTS idx_findings_run ON findings(run_id);

                CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active_per_target
                    ON runs(target_id) WHERE status IN ('queued', 'running');
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Database ping failed")?;
        Ok(())
    }

    // ── Targets ──────────────────────────────────────────────────────

    pub fn create_target(&self, new: &NewTarget) -> Result<Target> {
        self.conn
            .execute(
                "INSERT INTO targets (name, url, ip_address, repo_url, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
                params![new.name, new.url, new.ip_address, new.repo_url, now()],
            )
            .context("Failed to insert target")?;
        let id = self.conn.last_insert_rowid();
        self.get_target(id)?.context("Target not found after insert")
    }

    pub fn get_target(&self, id: i64) -> Result<Option<Target>> {
        self.conn
            .query_row(
                "SELECT id, name, url, ip_address, repo_url, status, last_run_at, created_at
                 FROM targets WHERE id = ?1",
                params![id],
                target_from_row,
            )
            .optional()
            .context("Failed to query target")
    }

    pub fn list_targets(&self) -> Result<Vec<Target>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, url, ip_address, repo_url, status, last_run_at, created_at
                 FROM targets ORDER BY id",
            )
            .context("Failed to prepare list_targets")?;
        let rows = stmt
            .query_map([], target_from_row)
            .context("Failed to query targets")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read target rows")
    }

    pub fn update_target(&self, id: i64, update: &TargetUpdate) -> Result<Option<Target>> {
        let Some(existing) = self.get_target(id)? else {
            return Ok(None);
        };
        let name = update.name.clone().unwrap_or(existing.name);
        let url = update.url.clone().or(existing.url);
        let ip_address = update.ip_address.clone().or(existing.ip_address);
        let repo_url = update.repo_url.clone().or(existing.repo_url);
        let status = update.status.unwrap_or(existing.status);
        self.conn
            .execute(
                "UPDATE targets SET name = ?1, url = ?2, ip_address = ?3, repo_url = ?4, status = ?5
                 WHERE id = ?6",
                params![name, url, ip_address, repo_url, status.as_str(), id],
            )
            .context("Failed to update target")?;
        self.get_target(id)
    }

    /// Delete a target and its history. Returns false if it did not exist.
    pub fn delete_target(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM targets WHERE id = ?1", params![id])
            .context("Failed to delete target")?;
        Ok(affected > 0)
    }

    // ── Runs ─────────────────────────────────────────────────────────

    /// Admit a new run for `target_id` in one transaction: the target must be
    /// active and have no queued or running run. The partial unique index on
    /// `runs` backs the same invariant at the storage level.
    pub fn admit_run(&self, target_id: i64) -> Result<Admission> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin admission transaction")?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM targets WHERE id = ?1",
                params![target_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read target status")?;
        let Some(status) = status else {
            return Ok(Admission::TargetNotFound);
        };
        let status = TargetStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))?;
        if status != TargetStatus::Active {
            return Ok(Admission::TargetInactive(status));
        }

        let active: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT id FROM runs WHERE target_id = ?1 AND status IN {} LIMIT 1",
                    ACTIVE_RUN_STATUSES
                ),
                params![target_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check for active run")?;
        if let Some(run_id) = active {
            return Ok(Admission::Conflict { run_id });
        }

        let ts = now();
        let inserted = tx.execute(
            "INSERT INTO runs (target_id, status, created_at) VALUES (?1, 'queued', ?2)",
            params![target_id, ts],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let run_id: i64 = tx
                    .query_row(
                        &format!(
                            "SELECT id FROM runs WHERE target_id = ?1 AND status IN {} LIMIT 1",
                            ACTIVE_RUN_STATUSES
                        ),
                        params![target_id],
                        |row| row.get(0),
                    )
                    .context("Failed to read conflicting run")?;
                return Ok(Admission::Conflict { run_id });
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to insert run: {}", e)),
        }
        let run_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE targets SET last_run_at = ?1 WHERE id = ?2",
            params![ts, target_id],
        )
        .context("Failed to update target last_run_at")?;
        tx.commit().context("Failed to commit admission")?;

        let run = self.get_run(run_id)?.context("Run not found after insert")?;
        Ok(Admission::Admitted(run))
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, target_id, status, current_phase, reason_code, error, remediation,
                        pr_url, report_ref, created_at, started_at, finished_at
                 FROM runs WHERE id = ?1",
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?;
        row.map(RunRow::into_run).transpose()
    }

    pub fn list_runs_for_target(&self, target_id: i64) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, status, current_phase, reason_code, error, remediation,
                        pr_url, report_ref, created_at, started_at, finished_at
                 FROM runs WHERE target_id = ?1 ORDER BY id DESC",
            )
            .context("Failed to prepare list_runs_for_target")?;
        let rows = stmt
            .query_map(params![target_id], RunRow::from_row)
            .context("Failed to query runs")?;
        rows.map(|r| r.context("Failed to read run row")?.into_run())
            .collect()
    }

    pub fn active_run_for_target(&self, target_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT id FROM runs WHERE target_id = ?1 AND status IN {} LIMIT 1",
                    ACTIVE_RUN_STATUSES
                ),
                params![target_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to check for active run")
    }

    pub fn count_runs(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .context("Failed to count runs")
    }

    pub fn mark_run_running(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![now(), id],
            )
            .context("Failed to mark run running")?;
        Ok(())
    }

    pub fn set_run_phase(&self, id: i64, phase: Phase) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "UPDATE runs SET current_phase = ?1 WHERE id = ?2 AND status IN {}",
                    ACTIVE_RUN_STATUSES
                ),
                params![phase.as_str(), id],
            )
            .context("Failed to update run phase")?;
        Ok(())
    }

    pub fn set_run_artifacts(&self, id: i64, report_ref: Option<&str>, pr_url: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "UPDATE runs SET report_ref = COALESCE(?1, report_ref), pr_url = COALESCE(?2, pr_url)
                     WHERE id = ?3 AND status IN {}",
                    ACTIVE_RUN_STATUSES
                ),
                params![report_ref, pr_url, id],
            )
            .context("Failed to update run artifacts")?;
        Ok(())
    }

    /// Move a run to a terminal status. A run that is already terminal is left
    /// untouched and `None` is returned.
    pub fn finish_run(&self, id: i64, outcome: &RunOutcome) -> Result<Option<Run>> {
        let remediation = outcome.reason_code.map(|r| r.remediation());
        let affected = self
            .conn
            .execute(
                &format!(
                    "UPDATE runs SET status = ?1, reason_code = ?2, error = ?3, remediation = ?4, finished_at = ?5
                     WHERE id = ?6 AND status IN {}",
                    ACTIVE_RUN_STATUSES
                ),
                params![
                    outcome.status.as_str(),
                    outcome.reason_code.map(|r| r.as_str()),
                    outcome.error,
                    remediation,
                    now(),
                    id
                ],
            )
            .context("Failed to finish run")?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_run(id)
    }

    /// Fail every non-terminal run with reason `interrupted`. Only the
    /// serving process calls this, at startup; in-flight runs are not resumed.
    pub fn mark_interrupted_runs(&self) -> Result<Vec<i64>> {
        let tx = self.write_transaction()?;
        let ids = {
            let mut stmt = tx
                .prepare(&format!("SELECT id FROM runs WHERE status IN {}", ACTIVE_RUN_STATUSES))
                .context("Failed to prepare interrupted query")?;
            stmt.query_map([], |row| row.get::<_, i64>(0))
                .context("Failed to query interrupted runs")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read interrupted run ids")?
        };
        let ts = now();
        for id in &ids {
            self.conn
                .execute(
                    "UPDATE phase_records SET status = 'failed', finished_at = ?1, error = 'interrupted'
                     WHERE run_id = ?2 AND status = 'running'",
                    params![ts, id],
                )
                .context("Failed to close interrupted phase records")?;
            self.finish_run(
                *id,
                &RunOutcome::failed(ReasonCode::Interrupted, "Process restarted while the run was in flight"),
            )?;
        }
        tx.commit().context("Failed to commit interrupted runs")?;
        Ok(ids)
    }

    /// A transaction that takes SQLite's write lock up front, so a check
    /// made inside it still holds when the write lands, even against
    /// another process sharing the database file.
    fn write_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin write transaction")
    }

    fn ensure_running(&self, run_id: i64) -> Result<()> {
        let status: Option<String> = self
            .conn
            .query_row("SELECT status FROM runs WHERE id = ?1", params![run_id], |row| row.get(0))
            .optional()
            .context("Failed to read run status")?;
        match status.as_deref() {
            Some("running") => Ok(()),
            Some(other) => anyhow::bail!("Run {} is {}, not running", run_id, other),
            None => anyhow::bail!("Run {} not found", run_id),
        }
    }

    // ── Phase records ────────────────────────────────────────────────

    /// Append the record for `phase`. The run must be running, records must
    /// follow the fixed phase order with no gaps, and the previous one must
    /// have succeeded.
    pub fn begin_phase(&self, run_id: i64, phase: Phase) -> Result<PhaseRecord> {
        let tx = self.write_transaction()?;
        self.ensure_running(run_id)?;
        let last = self.list_phase_records(run_id)?.pop();
        let expected = match &last {
            None => Some(Phase::first()),
            Some(record) if record.status == PhaseStatus::Succeeded => record.phase.next(),
            Some(record) => anyhow::bail!(
                "Cannot start {} for run {}: previous phase {} is {}",
                phase,
                run_id,
                record.phase,
                record.status.as_str()
            ),
        };
        if expected != Some(phase) {
            anyhow::bail!(
                "Out-of-order phase for run {}: expected {:?}, got {}",
                run_id,
                expected.map(|p| p.as_str()),
                phase
            );
        }
        let seq = last.map(|r| r.seq + 1).unwrap_or(1);
        tx.execute(
            "INSERT INTO phase_records (run_id, seq, phase, status, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![run_id, seq, phase.as_str(), now()],
        )
        .context("Failed to insert phase record")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit phase record")?;
        self.get_phase_record(id)?
            .context("Phase record not found after insert")
    }

    /// Finalize a running phase record. Finalized records are never mutated.
    pub fn finish_phase(
        &self,
        record_id: i64,
        status: PhaseStatus,
        completion: &PhaseCompletion,
    ) -> Result<PhaseRecord> {
        if status == PhaseStatus::Running {
            anyhow::bail!("Cannot finish a phase record with status running");
        }
        let summary = serde_json::to_string(&completion.summary).context("Failed to encode summary")?;
        let notes = serde_json::to_string(&completion.notes).context("Failed to encode notes")?;
        let affected = self
            .conn
            .execute(
                "UPDATE phase_records
                 SET status = ?1, finished_at = ?2, output_ref = ?3, summary = ?4, notes = ?5,
                     retry_count = ?6, error = ?7
                 WHERE id = ?8 AND status = 'running'",
                params![
                    status.as_str(),
                    now(),
                    completion.output_ref,
                    summary,
                    notes,
                    completion.retry_count,
                    completion.error,
                    record_id
                ],
            )
            .context("Failed to finish phase record")?;
        if affected == 0 {
            anyhow::bail!("Phase record {} is already finalized", record_id);
        }
        self.get_phase_record(record_id)?
            .context("Phase record not found after update")
    }

    pub fn get_phase_record(&self, id: i64) -> Result<Option<PhaseRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, run_id, seq, phase, status, started_at, finished_at, output_ref,
                        summary, notes, retry_count, error
                 FROM phase_records WHERE id = ?1",
                params![id],
                PhaseRow::from_row,
            )
            .optional()
            .context("Failed to query phase record")?;
        row.map(PhaseRow::into_record).transpose()
    }

    pub fn list_phase_records(&self, run_id: i64) -> Result<Vec<PhaseRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, seq, phase, status, started_at, finished_at, output_ref,
                        summary, notes, retry_count, error
                 FROM phase_records WHERE run_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare list_phase_records")?;
        let rows = stmt
            .query_map(params![run_id], PhaseRow::from_row)
            .context("Failed to query phase records")?;
        rows.map(|r| r.context("Failed to read phase record row")?.into_record())
            .collect()
    }

    // ── Findings ─────────────────────────────────────────────────────

    pub fn insert_finding(&self, run_id: i64, new: &NewFinding) -> Result<Finding> {
        let severity = new.severity.unwrap_or(Severity::Medium);
        self.conn
            .execute(
                "INSERT INTO findings (run_id, category, severity, title, endpoint, param, file_path,
                                       description, evidence_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    new.category,
                    severity.as_str(),
                    new.title,
                    new.endpoint,
                    new.param,
                    new.file_path,
                    new.description,
                    new.evidence_ref,
                    now()
                ],
            )
            .context("Failed to insert finding")?;
        let id = self.conn.last_insert_rowid();
        self.get_finding(id)?.context("Finding not found after insert")
    }

    /// Replace the run's findings with `new` in one transaction. A retried
    /// analysis therefore never leaves duplicates behind.
    pub fn replace_findings(&self, run_id: i64, new: &[NewFinding]) -> Result<Vec<Finding>> {
        let tx = self.write_transaction()?;
        self.ensure_running(run_id)?;
        let removed = tx
            .execute("DELETE FROM findings WHERE run_id = ?1", params![run_id])
            .context("Failed to clear previous findings")?;
        if removed > 0 {
            tracing::debug!(run_id, removed, "Replacing findings from an earlier analysis attempt");
        }
        let findings = new
            .iter()
            .map(|f| self.insert_finding(run_id, f))
            .collect::<Result<Vec<_>>>()?;
        tx.commit().context("Failed to commit findings")?;
        Ok(findings)
    }

    pub fn get_finding(&self, id: i64) -> Result<Option<Finding>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, run_id, category, severity, title, endpoint, param, file_path, description,
                        evidence_ref, exploited, exploit_output_ref, patched, proof_ref, triage, created_at
                 FROM findings WHERE id = ?1",
                params![id],
                FindingRow::from_row,
            )
            .optional()
            .context("Failed to query finding")?;
        row.map(FindingRow::into_finding).transpose()
    }

    pub fn list_findings(&self, run_id: i64) -> Result<Vec<Finding>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, category, severity, title, endpoint, param, file_path, description,
                        evidence_ref, exploited, exploit_output_ref, patched, proof_ref, triage, created_at
                 FROM findings WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_findings")?;
        let rows = stmt
            .query_map(params![run_id], FindingRow::from_row)
            .context("Failed to query findings")?;
        rows.map(|r| r.context("Failed to read finding row")?.into_finding())
            .collect()
    }

    /// Record a successful exploit. Refused once the owning run is terminal.
    pub fn mark_finding_exploited(&self, id: i64, output_ref: Option<&str>) -> Result<bool> {
        self.update_open_finding(
            "UPDATE findings SET exploited = 1, exploit_output_ref = ?1 WHERE id = ?2",
            params![output_ref, id],
        )
    }

    pub fn mark_finding_patched(&self, id: i64) -> Result<bool> {
        self.update_open_finding(
            "UPDATE findings SET patched = 1 WHERE id = ?1",
            params![id],
        )
    }

    pub fn set_finding_proof(&self, id: i64, proof_ref: &str) -> Result<bool> {
        self.update_open_finding(
            "UPDATE findings SET proof_ref = ?1 WHERE id = ?2",
            params![proof_ref, id],
        )
    }

    fn update_open_finding(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<bool> {
        let guarded = format!(
            "{} AND run_id IN (SELECT id FROM runs WHERE status IN {})",
            sql, ACTIVE_RUN_STATUSES
        );
        let affected = self
            .conn
            .execute(&guarded, params)
            .context("Failed to update finding")?;
        Ok(affected > 0)
    }

    /// Triage is an operator annotation and stays editable after the run ends.
    pub fn update_finding_triage(&self, id: i64, triage: TriageStatus) -> Result<Option<Finding>> {
        let affected = self
            .conn
            .execute(
                "UPDATE findings SET triage = ?1 WHERE id = ?2",
                params![triage.as_str(), id],
            )
            .context("Failed to update finding triage")?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_finding(id)
    }

    /// Findings from every run, newest first.
    pub fn list_all_findings(&self) -> Result<Vec<Finding>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, category, severity, title, endpoint, param, file_path, description,
                        evidence_ref, exploited, exploit_output_ref, patched, proof_ref, triage, created_at
                 FROM findings ORDER BY id DESC",
            )
            .context("Failed to prepare list_all_findings")?;
        let rows = stmt
            .query_map([], FindingRow::from_row)
            .context("Failed to query findings")?;
        rows.map(|r| r.context("Failed to read finding row")?.into_finding())
            .collect()
    }

    // ── Aggregates ───────────────────────────────────────────────────

    pub fn list_recent_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, target_id, status, current_phase, reason_code, error, remediation,
                        pr_url, report_ref, created_at, started_at, finished_at
                 FROM runs ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare list_recent_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], RunRow::from_row)
            .context("Failed to query recent runs")?;
        rows.map(|r| r.context("Failed to read run row")?.into_run())
            .collect()
    }

    pub fn overview_stats(&self, recent: usize) -> Result<OverviewStats> {
        let mut stats = self
            .conn
            .query_row(
                &format!(
                    "SELECT
                        (SELECT COUNT(*) FROM targets),
                        (SELECT COUNT(*) FROM runs),
                        (SELECT COUNT(*) FROM runs WHERE status IN {}),
                        (SELECT COUNT(*) FROM findings),
                        (SELECT COUNT(*) FROM findings WHERE severity = 'critical'),
                        (SELECT COUNT(*) FROM findings WHERE severity = 'high'),
                        (SELECT COUNT(*) FROM findings WHERE exploited = 1),
                        (SELECT COUNT(*) FROM findings WHERE patched = 1),
                        (SELECT COUNT(*) FROM runs WHERE pr_url IS NOT NULL)",
                    ACTIVE_RUN_STATUSES
                ),
                [],
                |row| {
                    Ok(OverviewStats {
                        total_targets: row.get(0)?,
                        total_runs: row.get(1)?,
                        active_runs: row.get(2)?,
                        total_findings: row.get(3)?,
                        critical_findings: row.get(4)?,
                        high_findings: row.get(5)?,
                        exploited_findings: row.get(6)?,
                        patched_findings: row.get(7)?,
                        published_runs: row.get(8)?,
                        recent_runs: Vec::new(),
                    })
                },
            )
            .context("Failed to compute overview stats")?;
        stats.recent_runs = self.list_recent_runs(recent)?;
        Ok(stats)
    }

    pub fn run_detail(&self, run_id: i64) -> Result<Option<RunDetail>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };
        Ok(Some(RunDetail {
            phases: self.list_phase_records(run_id)?,
            findings: self.list_findings(run_id)?,
            run,
        }))
    }
}

fn target_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Target> {
    let status: String = row.get(5)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        ip_address: row.get(3)?,
        repo_url: row.get(4)?,
        status: TargetStatus::from_str(&status).unwrap_or(TargetStatus::Archived),
        last_run_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

struct RunRow {
    id: i64,
    target_id: i64,
    status: String,
    current_phase: Option<String>,
    reason_code: Option<String>,
    error: Option<String>,
    remediation: Option<String>,
    pr_url: Option<String>,
    report_ref: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            target_id: row.get(1)?,
            status: row.get(2)?,
            current_phase: row.get(3)?,
            reason_code: row.get(4)?,
            error: row.get(5)?,
            remediation: row.get(6)?,
            pr_url: row.get(7)?,
            report_ref: row.get(8)?,
            created_at: row.get(9)?,
            started_at: row.get(10)?,
            finished_at: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            target_id: self.target_id,
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            current_phase: self
                .current_phase
                .as_deref()
                .map(Phase::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?,
            reason_code: self
                .reason_code
                .as_deref()
                .map(ReasonCode::from_str)
                .transpose()
                .map_err(|e| anyhow::anyhow!(e))?,
            error: self.error,
            remediation: self.remediation,
            pr_url: self.pr_url,
            report_ref: self.report_ref,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

struct PhaseRow {
    id: i64,
    run_id: i64,
    seq: i64,
    phase: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    output_ref: Option<String>,
    summary: String,
    notes: String,
    retry_count: u32,
    error: Option<String>,
}

impl PhaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            seq: row.get(2)?,
            phase: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
            output_ref: row.get(7)?,
            summary: row.get(8)?,
            notes: row.get(9)?,
            retry_count: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<PhaseRecord> {
        Ok(PhaseRecord {
            id: self.id,
            run_id: self.run_id,
            seq: self.seq,
            phase: Phase::from_str(&self.phase).map_err(|e| anyhow::anyhow!(e))?,
            status: PhaseStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            started_at: self.started_at,
            finished_at: self.finished_at,
            output_ref: self.output_ref,
            summary: serde_json::from_str(&self.summary).context("Invalid phase summary JSON")?,
            notes: serde_json::from_str(&self.notes).context("Invalid phase notes JSON")?,
            retry_count: self.retry_count,
            error: self.error,
        })
    }
}

struct FindingRow {
    id: i64,
    run_id: i64,
    category: String,
    severity: String,
    title: String,
    endpoint: Option<String>,
    param: Option<String>,
    file_path: Option<String>,
    description: String,
    evidence_ref: Option<String>,
    exploited: bool,
    exploit_output_ref: Option<String>,
    patched: bool,
    proof_ref: Option<String>,
    triage: String,
    created_at: String,
}

impl FindingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            category: row.get(2)?,
            severity: row.get(3)?,
            title: row.get(4)?,
            endpoint: row.get(5)?,
            param: row.get(6)?,
            file_path: row.get(7)?,
            description: row.get(8)?,
            evidence_ref: row.get(9)?,
            exploited: row.get(10)?,
            exploit_output_ref: row.get(11)?,
            patched: row.get(12)?,
            proof_ref: row.get(13)?,
            triage: row.get(14)?,
            created_at: row.get(15)?,
        })
    }

    fn into_finding(self) -> Result<Finding> {
        Ok(Finding {
            id: self.id,
            run_id: self.run_id,
            category: self.category,
            severity: Severity::from_str(&self.severity).map_err(|e| anyhow::anyhow!(e))?,
            title: self.title,
            endpoint: self.endpoint,
            param: self.param,
            file_path: self.file_path,
            description: self.description,
            evidence_ref: self.evidence_ref,
            exploited: self.exploited,
            exploit_output_ref: self.exploit_output_ref,
            patched: self.patched,
            proof_ref: self.proof_ref,
            triage: TriageStatus::from_str(&self.triage).map_err(|e| anyhow::anyhow!(e))?,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_target(db: &Store) -> Target {
        db.create_target(&NewTarget {
            name: "shop".into(),
            url: Some("http://shop.test".into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn admitted(db: &Store, target_id: i64) -> Run {
        match db.admit_run(target_id).unwrap() {
            Admission::Admitted(run) => run,
            other => panic!("Expected admission, got {:?}", other),
        }
    }

    fn running(db: &Store, target_id: i64) -> Run {
        let run = admitted(db, target_id);
        db.mark_run_running(run.id).unwrap();
        run
    }

    fn sqli(endpoint: &str) -> NewFinding {
        NewFinding {
            category: "SQLi".into(),
            title: format!("SQLi on {}", endpoint),
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let db = Store::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('targets', 'runs', 'phase_records', 'findings')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 4);
        // Re-running migrations is harmless.
        db.run_migrations()?;
        db.ping()?;
        Ok(())
    }

    #[test]
    fn test_target_crud() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        assert_eq!(target.status, TargetStatus::Active);
        assert!(target.last_run_at.is_none());

        let updated = db
            .update_target(
                target.id,
                &TargetUpdate {
                    name: Some("shop-prod".into()),
                    status: Some(TargetStatus::Archived),
                    ..Default::default()
                },
            )?
            .expect("target exists");
        assert_eq!(updated.name, "shop-prod");
        assert_eq!(updated.url.as_deref(), Some("http://shop.test"));
        assert_eq!(updated.status, TargetStatus::Archived);

        assert_eq!(db.list_targets()?.len(), 1);
        assert!(db.delete_target(target.id)?);
        assert!(!db.delete_target(target.id)?);
        assert!(db.get_target(target.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_admission_rejects_second_active_run() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = admitted(&db, target.id);
        assert_eq!(run.status, RunStatus::Queued);
        assert!(db.get_target(target.id)?.unwrap().last_run_at.is_some());

        match db.admit_run(target.id)? {
            Admission::Conflict { run_id } => assert_eq!(run_id, run.id),
            other => panic!("Expected conflict, got {:?}", other),
        }

        // Once the first run is terminal a new one is admitted.
        db.finish_run(run.id, &RunOutcome::completed())?;
        let second = admitted(&db, target.id);
        assert_ne!(second.id, run.id);
        Ok(())
    }

    #[test]
    fn test_admission_rejects_missing_and_archived_targets() -> Result<()> {
        let db = Store::new_in_memory()?;
        assert!(matches!(db.admit_run(999)?, Admission::TargetNotFound));
        let target = live_target(&db);
        db.update_target(
            target.id,
            &TargetUpdate {
                status: Some(TargetStatus::Archived),
                ..Default::default()
            },
        )?;
        assert!(matches!(
            db.admit_run(target.id)?,
            Admission::TargetInactive(TargetStatus::Archived)
        ));
        assert_eq!(db.count_runs()?, 0);
        Ok(())
    }

    #[test]
    fn test_unique_index_blocks_direct_duplicate_insert() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        admitted(&db, target.id);
        let dup = db.conn.execute(
            "INSERT INTO runs (target_id, status, created_at) VALUES (?1, 'running', 'now')",
            params![target.id],
        );
        assert!(dup.is_err());
        Ok(())
    }

    #[test]
    fn test_phase_records_follow_fixed_order() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = running(&db, target.id);

        assert!(db.begin_phase(run.id, Phase::Analyze).is_err());

        for phase in Phase::ALL {
            let record = db.begin_phase(run.id, phase)?;
            assert_eq!(record.seq, phase.ordinal());
            assert!(db.begin_phase(run.id, phase).is_err(), "repeat must fail");
            db.finish_phase(record.id, PhaseStatus::Succeeded, &PhaseCompletion::default())?;
        }

        let records = db.list_phase_records(run.id)?;
        let phases: Vec<Phase> = records.iter().map(|r| r.phase).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
        Ok(())
    }

    #[test]
    fn test_no_phase_after_failed_phase() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = running(&db, target.id);
        let record = db.begin_phase(run.id, Phase::Recon)?;
        db.finish_phase(
            record.id,
            PhaseStatus::Failed,
            &PhaseCompletion {
                error: Some("boom".into()),
                ..Default::default()
            },
        )?;
        assert!(db.begin_phase(run.id, Phase::Analyze).is_err());
        Ok(())
    }

    #[test]
    fn test_finalized_phase_record_is_immutable() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = running(&db, target.id);
        let record = db.begin_phase(run.id, Phase::Recon)?;
        let done = db.finish_phase(
            record.id,
            PhaseStatus::Succeeded,
            &PhaseCompletion {
                output_ref: Some("recon.txt".into()),
                summary: serde_json::json!({"commands": 3}),
                notes: vec!["tool nikto unavailable".into()],
                retry_count: 1,
                error: None,
            },
        )?;
        assert_eq!(done.summary["commands"], 3);
        assert_eq!(done.notes.len(), 1);
        assert_eq!(done.retry_count, 1);
        assert!(
            db.finish_phase(record.id, PhaseStatus::Failed, &PhaseCompletion::default())
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_terminal_run_is_immutable() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = admitted(&db, target.id);
        let finding = db.insert_finding(
            run.id,
            &NewFinding {
                category: "SQLi".into(),
                endpoint: Some("/login.php".into()),
                ..Default::default()
            },
        )?;
        let failed = db
            .finish_run(run.id, &RunOutcome::failed(ReasonCode::Cancelled, "stop"))?
            .expect("first finish applies");
        assert_eq!(failed.reason_code, Some(ReasonCode::Cancelled));
        assert!(failed.remediation.is_some());

        assert!(db.finish_run(run.id, &RunOutcome::completed())?.is_none());
        assert_eq!(db.get_run(run.id)?.unwrap().status, RunStatus::Failed);

        assert!(!db.mark_finding_exploited(finding.id, Some("x"))?);
        assert!(!db.mark_finding_patched(finding.id)?);
        assert!(!db.get_finding(finding.id)?.unwrap().exploited);

        let triaged = db
            .update_finding_triage(finding.id, TriageStatus::FalsePositive)?
            .expect("finding exists");
        assert_eq!(triaged.triage, TriageStatus::FalsePositive);
        Ok(())
    }

    #[test]
    fn test_mark_interrupted_runs() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = running(&db, target.id);
        db.begin_phase(run.id, Phase::Recon)?;

        let interrupted = db.mark_interrupted_runs()?;
        assert_eq!(interrupted, vec![run.id]);

        let run = db.get_run(run.id)?.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.reason_code, Some(ReasonCode::Interrupted));
        let records = db.list_phase_records(run.id)?;
        assert_eq!(records[0].status, PhaseStatus::Failed);
        assert!(db.mark_interrupted_runs()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_phases_only_begin_on_running_runs() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = admitted(&db, target.id);
        let err = db.begin_phase(run.id, Phase::Recon).unwrap_err();
        assert!(err.to_string().contains("queued"));
        assert!(db.begin_phase(run.id + 100, Phase::Recon).is_err());

        db.mark_run_running(run.id)?;
        let recon = db.begin_phase(run.id, Phase::Recon)?;
        db.finish_phase(recon.id, PhaseStatus::Succeeded, &PhaseCompletion::default())?;

        // Another process failed the run as interrupted; the task that still
        // owns it cannot record further phases or findings.
        assert_eq!(db.mark_interrupted_runs()?, vec![run.id]);
        assert!(db.begin_phase(run.id, Phase::Analyze).is_err());
        assert!(db.replace_findings(run.id, &[sqli("/login.php")]).is_err());
        assert_eq!(db.list_phase_records(run.id)?.len(), 1);
        assert!(db.list_findings(run.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_replace_findings_discards_earlier_attempt() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = running(&db, target.id);

        let first = db.replace_findings(run.id, &[sqli("/login.php"), sqli("/search.php")])?;
        assert_eq!(first.len(), 2);
        let second = db.replace_findings(run.id, &[sqli("/login.php"), sqli("/search.php")])?;
        assert_eq!(second.len(), 2);

        let stored = db.list_findings(run.id)?;
        assert_eq!(stored.len(), 2);
        let ids: Vec<i64> = stored.iter().map(|f| f.id).collect();
        assert_eq!(ids, second.iter().map(|f| f.id).collect::<Vec<_>>());
        assert!(db.get_finding(first[0].id)?.is_none());

        assert!(db.replace_findings(run.id, &[])?.is_empty());
        assert!(db.list_findings(run.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_run_detail_includes_history() -> Result<()> {
        let db = Store::new_in_memory()?;
        let target = live_target(&db);
        let run = running(&db, target.id);
        let record = db.begin_phase(run.id, Phase::Recon)?;
        db.finish_phase(record.id, PhaseStatus::Succeeded, &PhaseCompletion::default())?;
        db.insert_finding(
            run.id,
            &NewFinding {
                category: "XSS".into(),
                severity: Some(Severity::High),
                ..Default::default()
            },
        )?;
        let detail = db.run_detail(run.id)?.expect("run exists");
        assert_eq!(detail.phases.len(), 1);
        assert_eq!(detail.findings.len(), 1);
        assert_eq!(detail.findings[0].severity, Severity::High);
        assert!(db.run_detail(run.id + 100)?.is_none());
        Ok(())
    }

    #[test]
    fn test_overview_stats_and_cross_run_findings() -> Result<()> {
        let db = Store::new_in_memory()?;
        let empty = db.overview_stats(5)?;
        assert_eq!(empty.total_targets, 0);
        assert!(empty.recent_runs.is_empty());

        let target = live_target(&db);
        let first = running(&db, target.id);
        let login = db.replace_findings(
            first.id,
            &[
                NewFinding {
                    severity: Some(Severity::Critical),
                    ..sqli("/login.php")
                },
                sqli("/search.php"),
            ],
        )?;
        db.mark_finding_exploited(login[0].id, Some("exploit-1.txt"))?;
        db.mark_finding_patched(login[0].id)?;
        db.set_run_artifacts(first.id, Some("report.md"), Some("https://github.com/acme/webapp/pull/7"))?;
        db.finish_run(first.id, &RunOutcome::completed())?;

        let second = running(&db, target.id);
        db.replace_findings(second.id, &[sqli("/admin.php")])?;

        let stats = db.overview_stats(5)?;
        assert_eq!(stats.total_targets, 1);
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.active_runs, 1);
        assert_eq!(stats.total_findings, 3);
        assert_eq!(stats.critical_findings, 1);
        assert_eq!(stats.exploited_findings, 1);
        assert_eq!(stats.patched_findings, 1);
        assert_eq!(stats.published_runs, 1);
        let recent: Vec<i64> = stats.recent_runs.iter().map(|r| r.id).collect();
        assert_eq!(recent, vec![second.id, first.id]);
        assert_eq!(db.overview_stats(1)?.recent_runs.len(), 1);

        let all = db.list_all_findings()?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].endpoint.as_deref(), Some("/admin.php"));
        assert_eq!(all[0].run_id, second.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_runs_closure_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(Store::new_in_memory()?);
        let target = handle
            .call(|db| {
                db.create_target(&NewTarget {
                    name: "api".into(),
                    url: Some("https://api.test".into()),
                    ..Default::default()
                })
            })
            .await?;
        let fetched = handle.call(move |db| db.get_target(target.id)).await?;
        assert_eq!(fetched.unwrap().name, "api");
        Ok(())
    }
}
