// Reconciliation runs in a SQLite database

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use closure_recon::engine::RunOutput;
use closure_recon::error::{PersistenceError, ReconError};
use closure_recon::model::{
    IntercompanyTransaction, Match, MatchStatus, Period, ReconciliationReport, UnmatchedTransaction,
};
use closure_recon::store::{ReconStore, RunRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    period TEXT NOT NULL,           -- YYYY-MM or YYYY-MM-DD..YYYY-MM-DD
    created_at TEXT NOT NULL,       -- RFC 3339
    superseded_by TEXT,             -- NULL = current run for (tenant, period)
    report TEXT NOT NULL            -- JSON
);

CREATE INDEX IF NOT EXISTS runs_by_key ON runs (tenant_id, period);

CREATE TABLE IF NOT EXISTS matches (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs (run_id),
    status TEXT NOT NULL,           -- matched, unmatched, disputed
    record TEXT NOT NULL            -- JSON
);

CREATE INDEX IF NOT EXISTS matches_by_run ON matches (run_id);

CREATE TABLE IF NOT EXISTS intercompany (
    match_id TEXT PRIMARY KEY REFERENCES matches (id),
    run_id TEXT NOT NULL REFERENCES runs (run_id),
    record TEXT NOT NULL            -- JSON, mirrors the match status
);

CREATE INDEX IF NOT EXISTS intercompany_by_run ON intercompany (run_id);

CREATE TABLE IF NOT EXISTS unmatched (
    run_id TEXT NOT NULL REFERENCES runs (run_id),
    transaction_id TEXT NOT NULL,
    reason TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS unmatched_by_run ON unmatched (run_id);
"#;

fn backend(e: rusqlite::Error) -> PersistenceError {
    PersistenceError::Backend(e.to_string())
}

fn encode(e: serde_json::Error) -> PersistenceError {
    PersistenceError::Encode(e.to_string())
}

/// [`ReconStore`] over a single SQLite connection. Each run is written in
/// one SQL transaction.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    fn load_match(&self, match_id: &str) -> Result<Option<Match>, PersistenceError> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT status, record FROM matches WHERE id = ?1",
                params![match_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;

        let Some((status, record)) = row else {
            return Ok(None);
        };
        let mut m: Match = serde_json::from_str(&record).map_err(encode)?;
        m.status = MatchStatus::parse(&status)
            .ok_or_else(|| PersistenceError::Encode(format!("match {match_id}: unknown status '{status}'")))?;
        Ok(Some(m))
    }

    /// JSON `record` column of every row `sql` selects for `run_id`.
    fn records<T: serde::de::DeserializeOwned>(&self, sql: &str, run_id: &str) -> Result<Vec<T>, PersistenceError> {
        let mut stmt = self.conn.prepare(sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .map_err(backend)?;

        let mut out = Vec::new();
        for row in rows {
            let record = row.map_err(backend)?;
            out.push(serde_json::from_str(&record).map_err(encode)?);
        }
        Ok(out)
    }
}

impl ReconStore for SqliteStore {
    fn persist_run(&mut self, output: &RunOutput) -> Result<(), PersistenceError> {
        let report = &output.report;
        let period = report.period.to_string();

        let tx = self.conn.transaction().map_err(backend)?;

        let exists: bool = tx
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM runs WHERE run_id = ?1)",
                params![report.run_id],
                |row| row.get(0),
            )
            .map_err(backend)?;
        if exists {
            return Err(PersistenceError::DuplicateRun(report.run_id.clone()));
        }

        let superseded = tx
            .execute(
                "UPDATE runs SET superseded_by = ?1
                 WHERE tenant_id = ?2 AND period = ?3 AND superseded_by IS NULL",
                params![report.run_id, report.tenant_id, period],
            )
            .map_err(backend)?;

        tx.execute(
            "INSERT INTO runs (run_id, tenant_id, period, created_at, superseded_by, report)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![
                report.run_id,
                report.tenant_id,
                period,
                report.timestamp.to_rfc3339(),
                serde_json::to_string(report).map_err(encode)?,
            ],
        )
        .map_err(backend)?;

        {
            let mut stmt = tx
                .prepare("INSERT INTO matches (id, run_id, status, record) VALUES (?1, ?2, ?3, ?4)")
                .map_err(backend)?;
            for m in &output.matches {
                stmt.execute(params![
                    m.id,
                    m.run_id,
                    m.status.to_string(),
                    serde_json::to_string(m).map_err(encode)?,
                ])
                .map_err(backend)?;
            }
        }

        {
            let mut stmt = tx
                .prepare("INSERT INTO intercompany (match_id, run_id, record) VALUES (?1, ?2, ?3)")
                .map_err(backend)?;
            for ic in &output.intercompany {
                stmt.execute(params![ic.match_id, ic.run_id, serde_json::to_string(ic).map_err(encode)?])
                    .map_err(backend)?;
            }
        }

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO unmatched (run_id, transaction_id, reason, record) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(backend)?;
            for u in &output.unmatched {
                stmt.execute(params![
                    report.run_id,
                    u.transaction_id,
                    u.reason.to_string(),
                    serde_json::to_string(u).map_err(encode)?,
                ])
                .map_err(backend)?;
            }
        }

        tx.commit().map_err(backend)?;
        log::info!(
            "sqlite store: persisted run {} ({} matches, {} earlier runs superseded)",
            report.run_id,
            output.matches.len(),
            superseded
        );
        Ok(())
    }

    fn latest_report(
        &self,
        tenant_id: &str,
        period: &Period,
    ) -> Result<Option<ReconciliationReport>, PersistenceError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT report FROM runs
                 WHERE tenant_id = ?1 AND period = ?2 AND superseded_by IS NULL
                 ORDER BY rowid DESC LIMIT 1",
                params![tenant_id, period.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;

        json.map(|j| serde_json::from_str(&j).map_err(encode)).transpose()
    }

    fn matches_for_run(&self, run_id: &str) -> Result<Vec<Match>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, record FROM matches WHERE run_id = ?1 ORDER BY id")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                let status: String = row.get(0)?;
                let record: String = row.get(1)?;
                Ok((status, record))
            })
            .map_err(backend)?;

        let mut matches = Vec::new();
        for row in rows {
            let (status, record) = row.map_err(backend)?;
            let mut m: Match = serde_json::from_str(&record).map_err(encode)?;
            m.status = MatchStatus::parse(&status)
                .ok_or_else(|| PersistenceError::Encode(format!("match {}: unknown status '{status}'", m.id)))?;
            matches.push(m);
        }
        Ok(matches)
    }

    fn intercompany_for_run(&self, run_id: &str) -> Result<Vec<IntercompanyTransaction>, PersistenceError> {
        self.records("SELECT record FROM intercompany WHERE run_id = ?1 ORDER BY match_id", run_id)
    }

    fn unmatched_for_run(&self, run_id: &str) -> Result<Vec<UnmatchedTransaction>, PersistenceError> {
        self.records(
            "SELECT record FROM unmatched WHERE run_id = ?1 ORDER BY transaction_id, rowid",
            run_id,
        )
    }

    fn run_history(&self, tenant_id: &str, period: &Period) -> Result<Vec<RunRecord>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, created_at, superseded_by FROM runs
                 WHERE tenant_id = ?1 AND period = ?2 ORDER BY rowid",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![tenant_id, period.to_string()], |row| {
                let run_id: String = row.get(0)?;
                let created_at: String = row.get(1)?;
                let superseded_by: Option<String> = row.get(2)?;
                Ok((run_id, created_at, superseded_by))
            })
            .map_err(backend)?;

        let mut history = Vec::new();
        for row in rows {
            let (run_id, created_at, superseded_by) = row.map_err(backend)?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| PersistenceError::Encode(format!("run {run_id}: created_at: {e}")))?
                .with_timezone(&Utc);
            history.push(RunRecord {
                run_id,
                tenant_id: tenant_id.to_string(),
                period: *period,
                created_at,
                superseded_by,
            });
        }
        Ok(history)
    }

    fn set_match_status(&mut self, match_id: &str, to: MatchStatus) -> Result<Match, ReconError> {
        let mut m = self
            .load_match(match_id)?
            .ok_or_else(|| PersistenceError::MatchNotFound(match_id.to_string()))?;
        let from = m.status;
        m.apply_status(to)?;

        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute(
            "UPDATE matches SET status = ?1, record = ?2 WHERE id = ?3",
            params![m.status.to_string(), serde_json::to_string(&m).map_err(encode)?, m.id],
        )
        .map_err(backend)?;

        let linked: Option<String> = tx
            .query_row(
                "SELECT record FROM intercompany WHERE match_id = ?1",
                params![m.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        if let Some(record) = linked {
            let mut ic: IntercompanyTransaction = serde_json::from_str(&record).map_err(encode)?;
            ic.mirror(m.status);
            tx.execute(
                "UPDATE intercompany SET record = ?1 WHERE match_id = ?2",
                params![serde_json::to_string(&ic).map_err(encode)?, m.id],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)?;

        log::info!("match {match_id}: {from} -> {}", m.status);
        Ok(m)
    }
}
