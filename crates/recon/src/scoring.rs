//! Candidate scoring.
//!
//! A weighted sum of four normalized sub-scores:
//!
//! | Sub-score | Weight | Measure |
//! |-----------|--------|---------|
//! | amount    | 0.40   | `1 - min(1, variance / tolerance)` |
//! | date      | 0.25   | linear decay over `max_lag_days` |
//! | narration | 0.20   | Jaccard overlap of normalized tokens |
//! | agreement | 0.15   | 1 when account code and voucher type agree |
//!
//! Scores are rounded to 1e-9 so identical inputs always compare equal.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{MatchType, Transaction};
use crate::rules::ReconciliationRule;

pub const WEIGHT_AMOUNT: f64 = 0.4;
pub const WEIGHT_DATE: f64 = 0.25;
pub const WEIGHT_NARRATION: f64 = 0.2;
pub const WEIGHT_AGREEMENT: f64 = 0.15;

/// At or above: exact/partial territory.
pub const EXACT_THRESHOLD: f64 = 0.95;
/// Below: rejected outright.
pub const SUSPECTED_THRESHOLD: f64 = 0.6;

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// One side of a candidate: a single leg, or several for multi-leg matches.
#[derive(Debug, Clone)]
pub struct TransactionGroup<'a> {
    legs: Vec<&'a Transaction>,
}

impl<'a> TransactionGroup<'a> {
    pub fn new(legs: Vec<&'a Transaction>) -> Self {
        Self { legs }
    }

    pub fn single(t: &'a Transaction) -> Self {
        Self { legs: vec![t] }
    }

    pub fn legs(&self) -> &[&'a Transaction] {
        &self.legs
    }

    pub fn earliest_date(&self) -> Option<NaiveDate> {
        self.legs.iter().map(|t| t.date).min()
    }

    fn tokens(&self) -> BTreeSet<String> {
        self.legs.iter().flat_map(|t| narration_tokens(&t.narration)).collect()
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubScores {
    pub amount: f64,
    pub date: f64,
    pub narration: f64,
    pub agreement: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub score: f64,
    /// |sum of signed amounts| across both groups.
    pub variance: i64,
    /// Effective tolerance of the governing rule for this candidate.
    pub tolerance: i64,
    /// `None` when the candidate is rejected.
    pub classification: Option<MatchType>,
    pub parts: SubScores,
}

impl Score {
    pub fn within_tolerance(&self) -> bool {
        self.variance <= self.tolerance
    }
}

/// Arithmetic on a candidate overflowed; the pair is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreOverflow;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringModel {
    pub max_lag_days: u32,
}

impl Default for ScoringModel {
    fn default() -> Self {
        Self { max_lag_days: 30 }
    }
}

impl ScoringModel {
    pub fn new(max_lag_days: u32) -> Self {
        Self { max_lag_days }
    }

    pub fn score(
        &self,
        a: &TransactionGroup<'_>,
        b: &TransactionGroup<'_>,
        rule: &ReconciliationRule,
    ) -> Result<Score, ScoreOverflow> {
        let all = || a.legs.iter().chain(b.legs.iter());

        let mut net: i64 = 0;
        let mut debits: i64 = 0;
        let mut credits: i64 = 0;
        for t in all() {
            net = net.checked_add(t.amount).ok_or(ScoreOverflow)?;
            if t.amount >= 0 {
                debits = debits.checked_add(t.amount).ok_or(ScoreOverflow)?;
            } else {
                let magnitude = t.amount.checked_neg().ok_or(ScoreOverflow)?;
                credits = credits.checked_add(magnitude).ok_or(ScoreOverflow)?;
            }
        }
        let variance = net.checked_abs().ok_or(ScoreOverflow)?;
        let tolerance = rule.tolerance_for(debits, credits);

        let amount = amount_similarity(variance, tolerance);
        let date = match (a.earliest_date(), b.earliest_date()) {
            (Some(da), Some(db)) => self.date_proximity(lag_days(da, db)),
            _ => 0.0,
        };
        let narration = jaccard(&a.tokens(), &b.tokens());
        let agreement = if classification_agrees(all().copied()) { 1.0 } else { 0.0 };

        let raw = WEIGHT_AMOUNT * amount
            + WEIGHT_DATE * date
            + WEIGHT_NARRATION * narration
            + WEIGHT_AGREEMENT * agreement;
        let score = round9(raw.clamp(0.0, 1.0));

        Ok(Score {
            score,
            variance,
            tolerance,
            classification: classify(score, variance, tolerance),
            parts: SubScores { amount, date, narration, agreement },
        })
    }

    /// Linear decay: 1 at lag 0, 0 at and beyond `max_lag_days`.
    pub fn date_proximity(&self, lag: u32) -> f64 {
        if self.max_lag_days == 0 {
            return if lag == 0 { 1.0 } else { 0.0 };
        }
        if lag >= self.max_lag_days {
            return 0.0;
        }
        1.0 - f64::from(lag) / f64::from(self.max_lag_days)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Pure model classification; `None` means rejected.
pub fn classify(score: f64, variance: i64, tolerance: i64) -> Option<MatchType> {
    if variance > tolerance {
        return None;
    }
    if score >= EXACT_THRESHOLD {
        if variance == 0 {
            Some(MatchType::Exact)
        } else {
            Some(MatchType::Partial)
        }
    } else if score >= SUSPECTED_THRESHOLD {
        Some(MatchType::Suspected)
    } else {
        None
    }
}

/// Classification for passes that only admit in-tolerance candidates under a
/// governing rule: an accepted candidate is at least `partial`.
pub fn classify_within_tolerance(score: &Score) -> Option<MatchType> {
    match score.classification? {
        MatchType::Exact => Some(MatchType::Exact),
        MatchType::Partial | MatchType::Suspected => Some(MatchType::Partial),
    }
}

/// Best-first candidate order: score desc, variance asc, earliest date asc,
/// smallest transaction id asc.
pub fn candidate_order(
    a: (&Score, NaiveDate, &str),
    b: (&Score, NaiveDate, &str),
) -> Ordering {
    b.0.score
        .total_cmp(&a.0.score)
        .then_with(|| a.0.variance.cmp(&b.0.variance))
        .then_with(|| a.1.cmp(&b.1))
        .then_with(|| a.2.cmp(b.2))
}

// ---------------------------------------------------------------------------
// Sub-scores
// ---------------------------------------------------------------------------

pub fn amount_similarity(variance: i64, tolerance: i64) -> f64 {
    if tolerance <= 0 {
        return if variance == 0 { 1.0 } else { 0.0 };
    }
    1.0 - (variance as f64 / tolerance as f64).min(1.0)
}

pub fn lag_days(a: NaiveDate, b: NaiveDate) -> u32 {
    u32::try_from((a - b).num_days().unsigned_abs()).unwrap_or(u32::MAX)
}

/// Lowercased alphanumeric tokens.
pub fn narration_tokens(narration: &str) -> BTreeSet<String> {
    narration
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Token-set overlap; 0 when either side has no tokens.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn classification_agrees<'a>(mut legs: impl Iterator<Item = &'a Transaction>) -> bool {
    let Some(first) = legs.next() else {
        return false;
    };
    legs.all(|t| t.account_code == first.account_code && t.voucher_type == first.voucher_type)
}

fn round9(x: f64) -> f64 {
    (x * 1e9).round() / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use crate::rules::AccountScope;

    fn txn(id: &str, amount: i64, date: &str, narration: &str) -> Transaction {
        Transaction {
            id: id.into(),
            entity_id: "US".into(),
            counterparty_id: Some("UK".into()),
            account_code: "1400".into(),
            amount,
            currency: "USD".into(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            narration: narration.into(),
            source_document_id: None,
            side: Side::from_amount(amount),
            voucher_type: None,
        }
    }

    fn rule(tolerance_amount: i64, tolerance_percent: f64) -> ReconciliationRule {
        ReconciliationRule {
            id: "r".into(),
            name: "r".into(),
            priority: 1,
            accounts: AccountScope::Any,
            tolerance_percent,
            tolerance_amount,
            auto_reconcile: true,
            active: true,
        }
    }

    fn pair_score(a: &Transaction, b: &Transaction, r: &ReconciliationRule) -> Score {
        ScoringModel::default()
            .score(&TransactionGroup::single(a), &TransactionGroup::single(b), r)
            .unwrap()
    }

    #[test]
    fn perfect_pair_scores_one() {
        let a = txn("a", 100_000, "2026-01-05", "Loan drawdown Q1");
        let b = txn("b", -100_000, "2026-01-05", "loan DRAWDOWN q1");
        let s = pair_score(&a, &b, &rule(0, 0.0));
        assert_eq!(s.score, 1.0);
        assert_eq!(s.variance, 0);
        assert_eq!(s.classification, Some(MatchType::Exact));
    }

    #[test]
    fn partial_within_percent_tolerance() {
        let a = txn("a", 100_000, "2026-01-05", "mgmt fee");
        let b = txn("b", -99_950, "2026-01-05", "mgmt fee");
        let s = pair_score(&a, &b, &rule(0, 0.1));
        assert_eq!(s.variance, 50);
        assert_eq!(s.tolerance, 100);
        assert_eq!(s.parts.amount, 0.5);
        assert!(s.within_tolerance());
        // amount sub-score alone keeps this below the exact threshold
        assert_eq!(s.classification, Some(MatchType::Suspected));
        assert_eq!(classify_within_tolerance(&s), Some(MatchType::Partial));
    }

    #[test]
    fn variance_at_tolerance_still_clears() {
        let a = txn("a", 100_000, "2026-01-05", "mgmt fee");
        let b = txn("b", -99_900, "2026-01-05", "mgmt fee");
        let s = pair_score(&a, &b, &rule(0, 0.1));
        assert_eq!(s.variance, 100);
        assert_eq!(s.tolerance, 100);
        assert!(s.within_tolerance());
        assert_eq!(s.parts.amount, 0.0);
        // date 0.25 + narration 0.2 + agreement 0.15
        assert_eq!(s.score, 0.6);
        assert_eq!(s.classification, Some(MatchType::Suspected));
    }

    #[test]
    fn over_tolerance_rejected() {
        let a = txn("a", 100_000, "2026-01-05", "x");
        let b = txn("b", -99_000, "2026-01-05", "x");
        let s = pair_score(&a, &b, &rule(100, 0.0));
        assert_eq!(s.parts.amount, 0.0);
        assert_eq!(s.classification, None);
        assert_eq!(classify_within_tolerance(&s), None);
    }

    #[test]
    fn date_decay() {
        let m = ScoringModel::new(30);
        assert_eq!(m.date_proximity(0), 1.0);
        assert_eq!(m.date_proximity(15), 0.5);
        assert_eq!(m.date_proximity(30), 0.0);
        assert_eq!(m.date_proximity(45), 0.0);
        let z = ScoringModel::new(0);
        assert_eq!(z.date_proximity(0), 1.0);
        assert_eq!(z.date_proximity(1), 0.0);
    }

    #[test]
    fn narration_jaccard() {
        let a = narration_tokens("Invoice #INV-001, March");
        let b = narration_tokens("invoice inv 001");
        assert_eq!(a.len(), 4);
        // {invoice, inv, 001} / {invoice, inv, 001, march}
        assert_eq!(jaccard(&a, &b), 0.75);
        assert_eq!(jaccard(&a, &BTreeSet::new()), 0.0);
    }

    #[test]
    fn threshold_boundaries() {
        assert_eq!(classify(0.95, 0, 0), Some(MatchType::Exact));
        assert_eq!(classify(0.95, 5, 10), Some(MatchType::Partial));
        assert_eq!(classify(0.949_999_999, 0, 0), Some(MatchType::Suspected));
        assert_eq!(classify(0.6, 0, 0), Some(MatchType::Suspected));
        assert_eq!(classify(0.599_999_999, 0, 0), None);
        assert_eq!(classify(1.0, 11, 10), None);
    }

    #[test]
    fn agreement_needs_same_account_and_voucher() {
        let a = txn("a", 500, "2026-01-05", "");
        let mut b = txn("b", -500, "2026-01-05", "");
        let same = pair_score(&a, &b, &rule(0, 0.0));
        assert_eq!(same.parts.agreement, 1.0);
        b.account_code = "2400".into();
        let diff = pair_score(&a, &b, &rule(0, 0.0));
        assert_eq!(diff.parts.agreement, 0.0);
        // amount 0.4 + date 0.25, no narration, no agreement
        assert_eq!(diff.score, 0.65);
    }

    #[test]
    fn ordering_tie_breaks() {
        let hi = Score {
            score: 0.9,
            variance: 10,
            tolerance: 100,
            classification: Some(MatchType::Suspected),
            parts: SubScores { amount: 0.0, date: 0.0, narration: 0.0, agreement: 0.0 },
        };
        let lower_var = Score { variance: 5, ..hi };
        let d1 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        assert_eq!(candidate_order((&lower_var, d2, "z"), (&hi, d1, "a")), Ordering::Less);
        assert_eq!(candidate_order((&hi, d1, "z"), (&hi, d2, "a")), Ordering::Less);
        assert_eq!(candidate_order((&hi, d1, "a"), (&hi, d1, "b")), Ordering::Less);
    }

    #[test]
    fn overflow_is_reported() {
        let a = txn("a", i64::MAX, "2026-01-05", "");
        let b = txn("b", i64::MAX, "2026-01-05", "");
        let r = ScoringModel::default().score(
            &TransactionGroup::single(&a),
            &TransactionGroup::single(&b),
            &rule(0, 0.0),
        );
        assert_eq!(r.unwrap_err(), ScoreOverflow);
    }
}
