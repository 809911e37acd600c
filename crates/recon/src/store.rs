//! Persistence seam for run outputs.
//!
//! A store appends whole runs. Persisting a run for a (tenant, period) marks
//! every earlier run for the same key as superseded; nothing is patched in
//! place except match status, which carries its intercompany record along.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::RunOutput;
use crate::error::{PersistenceError, ReconError};
use crate::model::{
    IntercompanyTransaction, Match, MatchStatus, Period, ReconciliationReport, UnmatchedTransaction,
};

/// One persisted run as listed by [`ReconStore::run_history`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub tenant_id: String,
    pub period: Period,
    pub created_at: DateTime<Utc>,
    pub superseded_by: Option<String>,
}

pub trait ReconStore {
    /// Write matches, intercompany records, unmatched residue and the report
    /// of one run atomically. On error nothing of the run is kept.
    fn persist_run(&mut self, output: &RunOutput) -> Result<(), PersistenceError>;

    /// Report of the newest run for (tenant, period) that has not been
    /// superseded.
    fn latest_report(
        &self,
        tenant_id: &str,
        period: &Period,
    ) -> Result<Option<ReconciliationReport>, PersistenceError>;

    /// Matches of a run, ordered by match id.
    fn matches_for_run(&self, run_id: &str) -> Result<Vec<Match>, PersistenceError>;

    /// Intercompany records of a run, ordered by match id.
    fn intercompany_for_run(&self, run_id: &str) -> Result<Vec<IntercompanyTransaction>, PersistenceError>;

    /// Unmatched residue of a run, ordered by transaction id.
    fn unmatched_for_run(&self, run_id: &str) -> Result<Vec<UnmatchedTransaction>, PersistenceError>;

    /// Runs for (tenant, period), oldest first.
    fn run_history(&self, tenant_id: &str, period: &Period) -> Result<Vec<RunRecord>, PersistenceError>;

    /// Apply a lifecycle transition to a stored match and return it. The
    /// match's intercompany record, if any, mirrors the new status.
    fn set_match_status(&mut self, match_id: &str, to: MatchStatus) -> Result<Match, ReconError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRun {
    record: RunRecord,
    report: ReconciliationReport,
    matches: Vec<Match>,
    intercompany: Vec<IntercompanyTransaction>,
    unmatched: Vec<UnmatchedTransaction>,
}

impl StoredRun {
    fn is(&self, run_id: &str) -> bool {
        self.record.run_id == run_id
    }
}

/// Process-local store, used by tests and embedders without a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    runs: Vec<StoredRun>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

impl ReconStore for MemoryStore {
    fn persist_run(&mut self, output: &RunOutput) -> Result<(), PersistenceError> {
        let report = &output.report;
        if self.runs.iter().any(|r| r.record.run_id == report.run_id) {
            return Err(PersistenceError::DuplicateRun(report.run_id.clone()));
        }

        for run in &mut self.runs {
            let rec = &mut run.record;
            if rec.tenant_id == report.tenant_id && rec.period == report.period && rec.superseded_by.is_none() {
                rec.superseded_by = Some(report.run_id.clone());
            }
        }

        self.runs.push(StoredRun {
            record: RunRecord {
                run_id: report.run_id.clone(),
                tenant_id: report.tenant_id.clone(),
                period: report.period,
                created_at: report.timestamp,
                superseded_by: None,
            },
            report: report.clone(),
            matches: output.matches.clone(),
            intercompany: output.intercompany.clone(),
            unmatched: output.unmatched.clone(),
        });
        log::debug!("memory store: persisted run {}", report.run_id);
        Ok(())
    }

    fn latest_report(
        &self,
        tenant_id: &str,
        period: &Period,
    ) -> Result<Option<ReconciliationReport>, PersistenceError> {
        Ok(self
            .runs
            .iter()
            .rev()
            .find(|r| {
                r.record.tenant_id == tenant_id
                    && r.record.period == *period
                    && r.record.superseded_by.is_none()
            })
            .map(|r| r.report.clone()))
    }

    fn matches_for_run(&self, run_id: &str) -> Result<Vec<Match>, PersistenceError> {
        let mut matches: Vec<Match> = self
            .runs
            .iter()
            .filter(|r| r.is(run_id))
            .flat_map(|r| r.matches.iter().cloned())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    fn intercompany_for_run(&self, run_id: &str) -> Result<Vec<IntercompanyTransaction>, PersistenceError> {
        let mut records: Vec<IntercompanyTransaction> = self
            .runs
            .iter()
            .filter(|r| r.is(run_id))
            .flat_map(|r| r.intercompany.iter().cloned())
            .collect();
        records.sort_by(|a, b| a.match_id.cmp(&b.match_id));
        Ok(records)
    }

    fn unmatched_for_run(&self, run_id: &str) -> Result<Vec<UnmatchedTransaction>, PersistenceError> {
        let mut residue: Vec<UnmatchedTransaction> = self
            .runs
            .iter()
            .filter(|r| r.is(run_id))
            .flat_map(|r| r.unmatched.iter().cloned())
            .collect();
        residue.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));
        Ok(residue)
    }

    fn run_history(&self, tenant_id: &str, period: &Period) -> Result<Vec<RunRecord>, PersistenceError> {
        Ok(self
            .runs
            .iter()
            .filter(|r| r.record.tenant_id == tenant_id && r.record.period == *period)
            .map(|r| r.record.clone())
            .collect())
    }

    fn set_match_status(&mut self, match_id: &str, to: MatchStatus) -> Result<Match, ReconError> {
        let run = self
            .runs
            .iter_mut()
            .find(|r| r.matches.iter().any(|m| m.id == match_id))
            .ok_or_else(|| PersistenceError::MatchNotFound(match_id.to_string()))?;
        let m = run
            .matches
            .iter_mut()
            .find(|m| m.id == match_id)
            .ok_or_else(|| PersistenceError::MatchNotFound(match_id.to_string()))?;
        m.apply_status(to)?;
        for ic in run.intercompany.iter_mut().filter(|ic| ic.match_id == match_id) {
            ic.mirror(m.status);
        }
        Ok(m.clone())
    }
}
