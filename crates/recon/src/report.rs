use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::model::{
    IntercompanyTransaction, Match, MatchStatus, MatchType, ReconciliationReport, RuleStats,
    RunContext, UnmatchedReason, UnmatchedTransaction,
};
use crate::rules::RuleSet;

/// Aggregate one run's matches and residue into its report.
///
/// Every configured rule appears in the per-rule maps, with zeros when it
/// produced nothing. The rate is 0 for an empty run.
pub fn build(
    ctx: &RunContext,
    matches: &[Match],
    unmatched: &[UnmatchedTransaction],
    intercompany: &[IntercompanyTransaction],
    rules: &RuleSet,
) -> ReconciliationReport {
    let mut per_rule_breakdown: BTreeMap<String, usize> = BTreeMap::new();
    let mut rule_statistics: BTreeMap<String, RuleStats> = BTreeMap::new();
    for rule in rules.rules() {
        per_rule_breakdown.insert(rule.id.clone(), 0);
        rule_statistics.insert(rule.id.clone(), RuleStats::default());
    }

    let mut match_type_counts: BTreeMap<MatchType, usize> =
        [MatchType::Exact, MatchType::Partial, MatchType::Suspected]
            .into_iter()
            .map(|t| (t, 0))
            .collect();

    let mut matched_transactions = 0;
    let mut total_variance: i64 = 0;
    let mut exact_unruled_matches = 0;
    let mut requires_review_count = 0;

    for m in matches {
        if m.status == MatchStatus::Unmatched {
            continue;
        }
        matched_transactions += m.leg_count();
        total_variance = total_variance.saturating_add(m.variance);
        *match_type_counts.entry(m.match_type).or_insert(0) += 1;
        if m.requires_review {
            requires_review_count += 1;
        }

        match &m.rule_id {
            None => exact_unruled_matches += 1,
            Some(id) => {
                *per_rule_breakdown.entry(id.clone()).or_insert(0) += 1;
                let stats = rule_statistics.entry(id.clone()).or_default();
                stats.match_count += 1;
                stats.transaction_count += m.leg_count();
                stats.total_variance = stats.total_variance.saturating_add(m.variance);
            }
        }
    }

    // Legs of rejected matches go back to the residue.
    let rejected_legs: usize = matches
        .iter()
        .filter(|m| m.status == MatchStatus::Unmatched)
        .map(Match::leg_count)
        .sum();
    let unmatched_transactions = unmatched.len() + rejected_legs;

    let mut unmatched_reasons: BTreeMap<UnmatchedReason, usize> = BTreeMap::new();
    for u in unmatched {
        *unmatched_reasons.entry(u.reason).or_insert(0) += 1;
    }
    if rejected_legs > 0 {
        *unmatched_reasons.entry(UnmatchedReason::NoCounterpart).or_insert(0) += rejected_legs;
    }

    let total_transactions = matched_transactions + unmatched_transactions;
    let reconciliation_rate = if total_transactions == 0 {
        0.0
    } else {
        matched_transactions as f64 / total_transactions as f64
    };

    ReconciliationReport {
        run_id: ctx.run_id.clone(),
        tenant_id: ctx.tenant_id.clone(),
        period: ctx.period,
        total_transactions,
        matched_transactions,
        unmatched_transactions,
        reconciliation_rate,
        total_variance,
        per_rule_breakdown,
        rule_statistics,
        exact_unruled_matches,
        match_type_counts,
        unmatched_reasons,
        intercompany_count: intercompany.len(),
        requires_review_count,
        matches_fingerprint: fingerprint(matches),
        engine_version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: ctx.created_at,
    }
}

/// Digest of the match content, independent of run id and timestamps, so two
/// runs over the same input can be compared directly.
pub fn fingerprint(matches: &[Match]) -> String {
    let mut hasher = Sha256::new();
    for m in matches {
        let line = format!(
            "{}|{}|{}|{}|{:.9}|{}|{}|{}\n",
            m.entity_a,
            m.entity_b,
            m.currency,
            m.transaction_ids.join(","),
            m.match_score,
            m.variance,
            m.match_type,
            m.rule_id.as_deref().unwrap_or("-"),
        );
        hasher.update(line.as_bytes());
    }
    format!("sha256:{:x}", hasher.finalize())
}
