use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::config::ReconConfig;
use crate::error::{ReconError, ReconWarning};
use crate::index::{Partition, TransactionIndex};
use crate::intercompany;
use crate::matcher::{match_partition, CandidateMatch, PartitionOutcome, PassCounts};
use crate::model::{
    IntercompanyTransaction, Match, MatchStatus, ReconciliationReport, RunContext, Transaction,
    TransactionRecord, UnmatchedTransaction,
};
use crate::report;
use crate::store::ReconStore;

/// Cooperative cancellation flag shared with the caller. Workers check it
/// before taking each partition.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub partitions: usize,
    pub workers: usize,
    pub pass_counts: PassCounts,
    pub warnings: Vec<ReconWarning>,
}

impl RunDiagnostics {
    pub fn budget_exhausted(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| matches!(w, ReconWarning::SearchBudgetExhausted { .. }))
            .count()
    }
}

/// Everything one run produces. Matches are ordered by id, unmatched
/// transactions by transaction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub matches: Vec<Match>,
    pub unmatched: Vec<UnmatchedTransaction>,
    pub intercompany: Vec<IntercompanyTransaction>,
    pub report: ReconciliationReport,
    pub diagnostics: RunDiagnostics,
}

/// Run reconciliation for one (tenant, period).
///
/// Output depends only on `ctx`, `records` and `config`; the worker count
/// never changes it.
pub fn run(
    ctx: &RunContext,
    records: Vec<TransactionRecord>,
    config: &ReconConfig,
    cancel: &CancellationToken,
) -> Result<RunOutput, ReconError> {
    config.validate()?;
    log::info!(
        "run {}: tenant={} period={} records={} rules={}",
        ctx.run_id,
        ctx.tenant_id,
        ctx.period,
        records.len(),
        config.rules.len()
    );

    let index = TransactionIndex::build(records, &ctx.period);
    log::debug!(
        "run {}: {} partitions, {} indexed, {} unindexable",
        ctx.run_id,
        index.partitions.len(),
        index.indexed_count(),
        index.unindexable.len()
    );

    let workers = config.matching.effective_workers().clamp(1, index.partitions.len().max(1));
    let outcomes = match_partitions(&index.partitions, config, workers, cancel)
        .ok_or_else(|| ReconError::Cancelled { run_id: ctx.run_id.clone() })?;

    let mut diagnostics = RunDiagnostics {
        partitions: index.partitions.len(),
        workers,
        ..Default::default()
    };
    let mut candidates: Vec<CandidateMatch> = Vec::new();
    let mut unmatched: Vec<UnmatchedTransaction> = index.unindexable.clone();
    for outcome in outcomes {
        diagnostics.pass_counts.add(&outcome.pass_counts);
        diagnostics.warnings.extend(outcome.warnings);
        candidates.extend(outcome.candidates);
        unmatched.extend(outcome.residue);
    }

    let matches = assign_ids(ctx, candidates);
    unmatched.sort_by(|a, b| {
        a.transaction_id.cmp(&b.transaction_id).then_with(|| a.reason.cmp(&b.reason))
    });

    let lookup: BTreeMap<&str, &Transaction> = index
        .partitions
        .iter()
        .flat_map(|p| p.buckets.values().flatten())
        .map(|t| (t.id.as_str(), t))
        .collect();
    let intercompany = intercompany::classify(&matches, &config.hierarchy, &lookup);

    let report = report::build(ctx, &matches, &unmatched, &intercompany, &config.rules);
    log::info!(
        "run {}: {} matches, {}/{} transactions matched ({:.1}%), variance {}, {} warnings",
        ctx.run_id,
        matches.len(),
        report.matched_transactions,
        report.total_transactions,
        report.reconciliation_rate * 100.0,
        report.total_variance,
        diagnostics.warnings.len()
    );

    Ok(RunOutput { matches, unmatched, intercompany, report, diagnostics })
}

/// Run, then hand the complete output to `store` in one call. Nothing is
/// written when the run fails or is cancelled.
pub fn run_and_persist(
    store: &mut dyn ReconStore,
    ctx: &RunContext,
    records: Vec<TransactionRecord>,
    config: &ReconConfig,
    cancel: &CancellationToken,
) -> Result<RunOutput, ReconError> {
    let output = run(ctx, records, config, cancel)?;
    store.persist_run(&output).map_err(|e| {
        log::warn!("run {}: persisting failed: {e}", ctx.run_id);
        e
    })?;
    log::info!("run {}: persisted", ctx.run_id);
    Ok(output)
}

/// Match every partition on a scoped worker pool. `None` when cancelled.
fn match_partitions(
    partitions: &[Partition],
    config: &ReconConfig,
    workers: usize,
    cancel: &CancellationToken,
) -> Option<Vec<PartitionOutcome>> {
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, PartitionOutcome)>();

    thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            s.spawn(move || loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(partition) = partitions.get(i) else {
                    break;
                };
                let outcome = match_partition(partition, &config.rules, &config.matching);
                if tx.send((i, outcome)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    if cancel.is_cancelled() {
        log::info!("cancelled; discarding partial results");
        return None;
    }

    let mut outcomes: Vec<(usize, PartitionOutcome)> = rx.into_iter().collect();
    outcomes.sort_by_key(|(i, _)| *i);
    Some(outcomes.into_iter().map(|(_, o)| o).collect())
}

/// Order candidates by (entity pair, lowest transaction id) and number them.
fn assign_ids(ctx: &RunContext, mut candidates: Vec<CandidateMatch>) -> Vec<Match> {
    candidates.sort_by(|a, b| {
        a.pair
            .cmp(&b.pair)
            .then_with(|| a.transaction_ids.first().cmp(&b.transaction_ids.first()))
            .then_with(|| a.currency.cmp(&b.currency))
    });

    candidates
        .into_iter()
        .enumerate()
        .map(|(seq, c)| Match {
            id: format!("{}-{:06}", ctx.run_id, seq + 1),
            run_id: ctx.run_id.clone(),
            entity_a: c.pair.a,
            entity_b: c.pair.b,
            currency: c.currency,
            transaction_ids: c.transaction_ids,
            match_type: c.match_type,
            match_score: c.score,
            variance: c.variance,
            status: MatchStatus::Matched,
            rule_id: c.rule_id,
            pass: c.pass,
            requires_review: c.requires_review,
            created_at: ctx.created_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityPair, MatchPass, MatchType, Period};
    use chrono::{TimeZone, Utc};

    fn ctx() -> RunContext {
        RunContext::pinned(
            "run",
            "t",
            Period::parse("2026-01").unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    fn candidate(a: &str, b: &str, ids: &[&str]) -> CandidateMatch {
        CandidateMatch {
            pair: EntityPair::new(a, b),
            currency: "USD".into(),
            transaction_ids: ids.iter().map(|s| s.to_string()).collect(),
            match_type: MatchType::Exact,
            score: 1.0,
            variance: 0,
            rule_id: None,
            pass: MatchPass::Exact,
            requires_review: false,
        }
    }

    #[test]
    fn ids_follow_pair_then_lowest_id() {
        let matches = assign_ids(
            &ctx(),
            vec![
                candidate("UK", "US", &["t5", "t9"]),
                candidate("DE", "US", &["t7", "t8"]),
                candidate("UK", "US", &["t1", "t2"]),
            ],
        );
        let got: Vec<(&str, &str)> =
            matches.iter().map(|m| (m.id.as_str(), m.transaction_ids[0].as_str())).collect();
        assert_eq!(
            got,
            vec![("run-000001", "t7"), ("run-000002", "t1"), ("run-000003", "t5")]
        );
        assert!(matches.iter().all(|m| m.status == MatchStatus::Matched));
    }

    #[test]
    fn token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
