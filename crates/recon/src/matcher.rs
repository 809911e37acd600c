//! The four matching passes over one partition (scope group + currency).
//!
//! Each pass only sees what the previous passes left behind:
//!
//! 1. exact: same bucket, sign-flipped amount, same date; no rule needed
//! 2. tolerance: same bucket, best in-tolerance counterpart per leg
//! 3. fuzzy: whole partition, greedy over all scored pairs
//! 4. multi-leg: per account code, bounded subset-sum search

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::MatchingOptions;
use crate::error::ReconWarning;
use crate::index::{BucketKey, Partition, PartitionKey};
use crate::model::{
    EntityPair, MatchPass, MatchType, Transaction, UnmatchedReason, UnmatchedTransaction,
};
use crate::multileg::LegSearch;
use crate::rules::{ReconciliationRule, RuleSet};
use crate::scoring::{
    candidate_order, classify_within_tolerance, lag_days, Score, ScoringModel, TransactionGroup,
};

/// A match before the merge step assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateMatch {
    pub pair: EntityPair,
    pub currency: String,
    /// Sorted ascending.
    pub transaction_ids: Vec<String>,
    pub match_type: MatchType,
    pub score: f64,
    pub variance: i64,
    pub rule_id: Option<String>,
    pub pass: MatchPass,
    pub requires_review: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCounts {
    pub exact: usize,
    pub tolerance: usize,
    pub fuzzy: usize,
    pub multi_leg: usize,
}

impl PassCounts {
    fn bump(&mut self, pass: MatchPass) {
        match pass {
            MatchPass::Exact => self.exact += 1,
            MatchPass::Tolerance => self.tolerance += 1,
            MatchPass::Fuzzy => self.fuzzy += 1,
            MatchPass::MultiLeg => self.multi_leg += 1,
        }
    }

    pub fn add(&mut self, other: &PassCounts) {
        self.exact += other.exact;
        self.tolerance += other.tolerance;
        self.fuzzy += other.fuzzy;
        self.multi_leg += other.multi_leg;
    }
}

#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub key: PartitionKey,
    pub candidates: Vec<CandidateMatch>,
    pub residue: Vec<UnmatchedTransaction>,
    pub warnings: Vec<ReconWarning>,
    pub pass_counts: PassCounts,
}

/// Run all four passes over one partition.
pub fn match_partition(
    partition: &Partition,
    rules: &RuleSet,
    options: &MatchingOptions,
) -> PartitionOutcome {
    let mut m = PartitionMatcher::new(partition, rules, options);
    m.exact_pass();
    m.tolerance_pass();
    m.fuzzy_pass();
    m.multi_leg_pass();
    m.finish()
}

// ---------------------------------------------------------------------------
// Matcher state
// ---------------------------------------------------------------------------

struct PartitionMatcher<'p> {
    key: &'p PartitionKey,
    label: String,
    rules: &'p RuleSet,
    options: &'p MatchingOptions,
    model: ScoringModel,
    /// All transactions of the partition, bucket by bucket.
    txns: Vec<&'p Transaction>,
    buckets: Vec<(&'p BucketKey, Vec<usize>)>,
    used: Vec<bool>,
    candidates: Vec<CandidateMatch>,
    warnings: Vec<ReconWarning>,
    pass_counts: PassCounts,
}

impl<'p> PartitionMatcher<'p> {
    fn new(partition: &'p Partition, rules: &'p RuleSet, options: &'p MatchingOptions) -> Self {
        let mut txns = Vec::with_capacity(partition.len());
        let mut buckets = Vec::with_capacity(partition.buckets.len());
        for (bkey, bucket) in &partition.buckets {
            let start = txns.len();
            txns.extend(bucket.iter());
            buckets.push((bkey, (start..txns.len()).collect()));
        }
        let used = vec![false; txns.len()];
        Self {
            key: &partition.key,
            label: partition.key.to_string(),
            rules,
            options,
            model: ScoringModel::new(options.max_lag_days),
            txns,
            buckets,
            used,
            candidates: Vec::new(),
            warnings: Vec::new(),
            pass_counts: PassCounts::default(),
        }
    }

    /// Legs can sit on opposite sides of one match.
    fn opposite(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.txns[i], self.txns[j]);
        let signs = (a.amount > 0 && b.amount < 0) || (a.amount < 0 && b.amount > 0);
        signs && a.pairs_with(b)
    }

    fn pair_of(&self, legs: &[usize]) -> EntityPair {
        let entities = legs.iter().map(|&i| self.txns[i].entity_id.as_str());
        match (entities.clone().min(), entities.max()) {
            (Some(a), Some(b)) => EntityPair::new(a, b),
            _ => EntityPair::new("", ""),
        }
    }

    fn ids(&self, legs: &[usize]) -> Vec<String> {
        legs.iter().map(|&i| self.txns[i].id.clone()).collect()
    }

    fn score_pair(&mut self, i: usize, j: usize, rule: &ReconciliationRule) -> Option<Score> {
        let a = TransactionGroup::single(self.txns[i]);
        let b = TransactionGroup::single(self.txns[j]);
        match self.model.score(&a, &b, rule) {
            Ok(score) => Some(score),
            Err(_) => {
                let warning = ReconWarning::SkippedCandidate {
                    partition: self.label.clone(),
                    transaction_ids: self.ids(&[i, j]),
                    reason: "amount overflow".into(),
                };
                log::warn!("{warning}");
                self.warnings.push(warning);
                None
            }
        }
    }

    fn warn_ambiguous(&mut self, chosen: &[usize], tied_with: &[usize], score: f64) {
        let warning = ReconWarning::AmbiguousMatch {
            partition: self.label.clone(),
            chosen: self.ids(chosen),
            tied_with: self.ids(tied_with),
            score,
        };
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    fn emit(
        &mut self,
        legs: &[usize],
        match_type: MatchType,
        score: f64,
        variance: i64,
        rule: Option<&ReconciliationRule>,
        pass: MatchPass,
    ) {
        for &i in legs {
            self.used[i] = true;
        }
        let mut transaction_ids = self.ids(legs);
        transaction_ids.sort();
        log::debug!(
            "{}: {pass} match [{}] type={match_type} score={score} variance={variance}",
            self.label,
            transaction_ids.join(", ")
        );
        let pair = self.pair_of(legs);
        self.candidates.push(CandidateMatch {
            pair,
            currency: self.key.currency.clone(),
            transaction_ids,
            match_type,
            score,
            variance,
            rule_id: rule.map(|r| r.id.clone()),
            pass,
            requires_review: rule.is_some_and(|r| !r.auto_reconcile),
        });
        self.pass_counts.bump(pass);
    }

    fn unused(&self, indices: &[usize]) -> Vec<usize> {
        indices.iter().copied().filter(|&i| !self.used[i]).collect()
    }

    // -----------------------------------------------------------------------
    // Pass 1: exact
    // -----------------------------------------------------------------------

    fn exact_pass(&mut self) {
        for b in 0..self.buckets.len() {
            let mut order = self.buckets[b].1.clone();
            order.sort_by(|&x, &y| {
                let (tx, ty) = (self.txns[x], self.txns[y]);
                tx.date
                    .cmp(&ty.date)
                    .then_with(|| tx.amount.cmp(&ty.amount))
                    .then_with(|| tx.id.cmp(&ty.id))
            });

            for &i in &order {
                if self.used[i] || self.txns[i].amount <= 0 {
                    continue;
                }
                let t = self.txns[i];
                let mut counterparts: Vec<usize> = order
                    .iter()
                    .copied()
                    .filter(|&j| {
                        !self.used[j]
                            && self.txns[j].amount == -t.amount
                            && self.txns[j].date == t.date
                            && self.opposite(i, j)
                    })
                    .collect();
                if counterparts.is_empty() {
                    continue;
                }
                counterparts.sort_by(|&x, &y| self.txns[x].id.cmp(&self.txns[y].id));
                if counterparts.len() > 1 {
                    self.warn_ambiguous(&[i, counterparts[0]], &counterparts[1..], 1.0);
                }
                self.emit(&[i, counterparts[0]], MatchType::Exact, 1.0, 0, None, MatchPass::Exact);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pass 2: tolerance
    // -----------------------------------------------------------------------

    fn tolerance_pass(&mut self) {
        let rules = self.rules;
        for b in 0..self.buckets.len() {
            let bucket_key: &'p BucketKey = self.buckets[b].0;
            let Some(rule) = rules.governing([bucket_key.account_code.as_str()]) else {
                continue;
            };
            // Bucket indices follow id order.
            let legs = self.unused(&self.buckets[b].1);

            for &i in &legs {
                if self.used[i] {
                    continue;
                }
                let mut scored: Vec<(Score, usize)> = Vec::new();
                for &j in &legs {
                    if j == i || self.used[j] || !self.opposite(i, j) {
                        continue;
                    }
                    let Some(score) = self.score_pair(i, j, rule) else {
                        continue;
                    };
                    if score.within_tolerance() && classify_within_tolerance(&score).is_some() {
                        scored.push((score, j));
                    }
                }
                if scored.is_empty() {
                    continue;
                }
                scored.sort_by(|x, y| {
                    candidate_order(
                        (&x.0, self.txns[x.1].date, self.txns[x.1].id.as_str()),
                        (&y.0, self.txns[y.1].date, self.txns[y.1].id.as_str()),
                    )
                });

                let (best, j) = scored[0];
                let tied: Vec<usize> = scored[1..]
                    .iter()
                    .take_while(|(s, _)| s.score == best.score)
                    .map(|&(_, k)| k)
                    .collect();
                if !tied.is_empty() {
                    self.warn_ambiguous(&[i, j], &tied, best.score);
                }
                let match_type = classify_within_tolerance(&best).unwrap_or(MatchType::Partial);
                self.emit(&[i, j], match_type, best.score, best.variance, Some(rule), MatchPass::Tolerance);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pass 3: fuzzy
    // -----------------------------------------------------------------------

    fn fuzzy_pass(&mut self) {
        let mut residue: Vec<usize> = (0..self.txns.len()).filter(|&i| !self.used[i]).collect();
        residue.sort_by(|&x, &y| {
            self.txns[x].date.cmp(&self.txns[y].date).then_with(|| self.txns[x].id.cmp(&self.txns[y].id))
        });

        let rules = self.rules;
        let mut scored: Vec<(Score, &'p ReconciliationRule, usize, usize)> = Vec::new();
        for (pos, &i) in residue.iter().enumerate() {
            for &j in &residue[pos + 1..] {
                if lag_days(self.txns[i].date, self.txns[j].date) > self.options.max_lag_days {
                    break;
                }
                if !self.opposite(i, j) {
                    continue;
                }
                let (ti, tj) = (self.txns[i], self.txns[j]);
                let Some(rule) = rules.governing([ti.account_code.as_str(), tj.account_code.as_str()]) else {
                    continue;
                };
                let Some(score) = self.score_pair(i, j, rule) else {
                    continue;
                };
                if score.classification.is_some() {
                    scored.push((score, rule, i, j));
                }
            }
        }

        let txns = &self.txns;
        let first_id = |i: usize, j: usize| txns[i].id.as_str().min(txns[j].id.as_str());
        let last_id = |i: usize, j: usize| txns[i].id.as_str().max(txns[j].id.as_str());
        let earliest = |i: usize, j: usize| txns[i].date.min(txns[j].date);
        scored.sort_by(|x, y| {
            candidate_order((&x.0, earliest(x.2, x.3), first_id(x.2, x.3)), (&y.0, earliest(y.2, y.3), first_id(y.2, y.3)))
                .then_with(|| last_id(x.2, x.3).cmp(last_id(y.2, y.3)))
        });

        for k in 0..scored.len() {
            let (score, rule, i, j) = scored[k];
            if self.used[i] || self.used[j] {
                continue;
            }
            let tied: Vec<usize> = scored[k + 1..]
                .iter()
                .take_while(|c| c.0.score == score.score)
                .filter(|c| !self.used[c.2] && !self.used[c.3])
                .filter_map(|c| match (c.2 == i || c.2 == j, c.3 == i || c.3 == j) {
                    (true, false) => Some(c.3),
                    (false, true) => Some(c.2),
                    _ => None,
                })
                .collect();
            if !tied.is_empty() {
                self.warn_ambiguous(&[i, j], &tied, score.score);
            }
            let match_type = score.classification.unwrap_or(MatchType::Suspected);
            self.emit(&[i, j], match_type, score.score, score.variance, Some(rule), MatchPass::Fuzzy);
        }
    }

    // -----------------------------------------------------------------------
    // Pass 4: multi-leg
    // -----------------------------------------------------------------------

    fn multi_leg_pass(&mut self) {
        let rules = self.rules;
        let mut by_account: BTreeMap<&'p str, Vec<usize>> = BTreeMap::new();
        for (i, &t) in self.txns.iter().enumerate() {
            if !self.used[i] {
                by_account.entry(t.account_code.as_str()).or_default().push(i);
            }
        }

        for (account, mut pool) in by_account {
            let Some(rule) = rules.governing([account]) else {
                continue;
            };
            pool.sort_by(|&x, &y| {
                let (tx, ty) = (self.txns[x], self.txns[y]);
                tx.date
                    .cmp(&ty.date)
                    .then_with(|| tx.amount.cmp(&ty.amount))
                    .then_with(|| tx.id.cmp(&ty.id))
            });

            for pair in self.leg_pairs(&pool) {
                let members: Vec<usize> =
                    pool.iter().copied().filter(|&i| self.fits_pair(i, &pair)).collect();
                if !self.search_pair(account, rule, &pair, members) {
                    break;
                }
            }
        }
    }

    /// Entity pairs a multi-leg group in `pool` could span, in sorted order.
    fn leg_pairs(&self, pool: &[usize]) -> Vec<EntityPair> {
        let mut entities: Vec<&str> = pool.iter().map(|&i| self.txns[i].entity_id.as_str()).collect();
        entities.sort_unstable();
        entities.dedup();

        let mut pairs = Vec::new();
        for (k, a) in entities.iter().enumerate() {
            let ledger = pool.iter().any(|&i| {
                let t = self.txns[i];
                t.entity_id == *a && t.counterparty_id.as_deref() == Some(*a)
            });
            if ledger {
                pairs.push(EntityPair::new(a, a));
            }
            for b in &entities[k + 1..] {
                pairs.push(EntityPair::new(a, b));
            }
        }
        pairs.sort();
        pairs
    }

    /// Leg `i` may join a group spanning exactly `pair`.
    fn fits_pair(&self, i: usize, pair: &EntityPair) -> bool {
        let t = self.txns[i];
        let cp = t.counterparty_id.as_deref();
        if !pair.is_cross_entity() {
            return t.entity_id == pair.a && cp == Some(pair.a.as_str());
        }
        let other = if t.entity_id == pair.a {
            &pair.b
        } else if t.entity_id == pair.b {
            &pair.a
        } else {
            return false;
        };
        cp.map_or(true, |c| c == other.as_str())
    }

    /// Repeatedly take the best clearing group from `members`. Returns false
    /// once the search budget ran out.
    fn search_pair(
        &mut self,
        account: &str,
        rule: &'p ReconciliationRule,
        pair: &EntityPair,
        mut members: Vec<usize>,
    ) -> bool {
        let required_entities = if pair.is_cross_entity() {
            Some((pair.a.as_str(), pair.b.as_str()))
        } else {
            None
        };

        loop {
            members.retain(|&i| !self.used[i]);
            let legs: Vec<&Transaction> = members.iter().map(|&i| self.txns[i]).collect();
            let result = LegSearch {
                legs: &legs,
                rule,
                model: &self.model,
                required_entities,
                max_legs: self.options.max_legs,
                max_nodes: self.options.max_search_nodes,
                max_span_days: self.options.max_lag_days,
            }
            .run();

            if result.cap_hit {
                let warning = ReconWarning::SearchBudgetExhausted {
                    partition: self.label.clone(),
                    account_code: account.to_string(),
                    nodes_visited: result.nodes_visited,
                };
                log::warn!("{warning}");
                self.warnings.push(warning);
            }
            if result.overflowed > 0 {
                let warning = ReconWarning::SkippedCandidate {
                    partition: self.label.clone(),
                    transaction_ids: Vec::new(),
                    reason: format!("{} multi-leg branches overflowed on account {account}", result.overflowed),
                };
                log::warn!("{warning}");
                self.warnings.push(warning);
            }

            let Some(best) = result.best else {
                return !result.cap_hit;
            };
            let group: Vec<usize> = best.indices.iter().map(|&k| members[k]).collect();
            if let Some(tied) = result.tied.first() {
                let tied: Vec<usize> = tied.iter().map(|&k| members[k]).collect();
                self.warn_ambiguous(&group, &tied, best.score.score);
            }
            let match_type = classify_within_tolerance(&best.score).unwrap_or(MatchType::Partial);
            self.emit(
                &group,
                match_type,
                best.score.score,
                best.score.variance,
                Some(rule),
                MatchPass::MultiLeg,
            );
            if result.cap_hit {
                return false;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Residue
    // -----------------------------------------------------------------------

    fn finish(self) -> PartitionOutcome {
        let mut residue: Vec<UnmatchedTransaction> = self
            .txns
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.used[*i])
            .map(|(_, t)| {
                let reason = if self.rules.governing([t.account_code.as_str()]).is_some() {
                    UnmatchedReason::NoCounterpart
                } else {
                    UnmatchedReason::NoGoverningRule
                };
                UnmatchedTransaction::from_transaction(t, reason)
            })
            .collect();
        residue.sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

        log::debug!(
            "{}: {} matches ({:?}), {} unmatched",
            self.label,
            self.candidates.len(),
            self.pass_counts,
            residue.len()
        );

        PartitionOutcome {
            key: self.key.clone(),
            candidates: self.candidates,
            residue,
            warnings: self.warnings,
            pass_counts: self.pass_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TransactionIndex;
    use crate::model::{Period, TransactionRecord};
    use crate::rules::AccountScope;
    use chrono::NaiveDate;

    fn rec(id: &str, entity: &str, cp: &str, account: &str, amount: i64, date: &str, narration: &str) -> TransactionRecord {
        TransactionRecord {
            id: Some(id.into()),
            entity_id: Some(entity.into()),
            counterparty_id: Some(cp.into()),
            account_code: Some(account.into()),
            amount: Some(amount),
            currency: Some("USD".into()),
            date: Some(NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap()),
            narration: Some(narration.into()),
            ..Default::default()
        }
    }

    fn rules(tolerance_amount: i64, tolerance_percent: f64) -> RuleSet {
        RuleSet::new(vec![ReconciliationRule {
            id: "ic".into(),
            name: "ic".into(),
            priority: 1,
            accounts: AccountScope::Codes(["1400".to_string(), "2400".to_string()].into()),
            tolerance_percent,
            tolerance_amount,
            auto_reconcile: true,
            active: true,
        }])
        .unwrap()
    }

    fn run(records: Vec<TransactionRecord>, rules: &RuleSet) -> PartitionOutcome {
        let index = TransactionIndex::build(records, &Period::parse("2026-01").unwrap());
        assert_eq!(index.partitions.len(), 1, "tests use a single partition");
        match_partition(&index.partitions[0], rules, &MatchingOptions::default())
    }

    #[test]
    fn exact_pair() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 100_000, "2026-01-14", ""),
                rec("t2", "UK", "US", "1400", -100_000, "2026-01-14", ""),
            ],
            &rules(0, 0.0),
        );
        assert_eq!(out.candidates.len(), 1);
        let m = &out.candidates[0];
        assert_eq!(m.pass, MatchPass::Exact);
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.score, 1.0);
        assert_eq!(m.variance, 0);
        assert_eq!(m.rule_id, None);
        assert!(out.residue.is_empty());
    }

    #[test]
    fn exact_needs_opposite_entities() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 500, "2026-01-14", ""),
                rec("t2", "US", "UK", "1400", -500, "2026-01-14", ""),
            ],
            &rules(0, 0.0),
        );
        assert!(out.candidates.is_empty());
        assert_eq!(out.residue.len(), 2);
        assert_eq!(out.residue[0].reason, UnmatchedReason::NoCounterpart);
    }

    #[test]
    fn exact_ambiguity_picks_smallest_id() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 500, "2026-01-14", ""),
                rec("t3", "UK", "US", "1400", -500, "2026-01-14", ""),
                rec("t2", "UK", "US", "1400", -500, "2026-01-14", ""),
            ],
            &rules(0, 0.0),
        );
        assert_eq!(out.candidates[0].transaction_ids, vec!["t1", "t2"]);
        assert!(matches!(out.warnings[0], ReconWarning::AmbiguousMatch { .. }));
        assert_eq!(out.residue[0].transaction_id, "t3");
    }

    #[test]
    fn tolerance_pair_is_partial() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 100_000, "2026-01-14", "Mgmt fee Jan"),
                rec("t2", "UK", "US", "1400", -99_950, "2026-01-14", "mgmt fee jan"),
            ],
            &rules(0, 0.1),
        );
        assert_eq!(out.candidates.len(), 1);
        let m = &out.candidates[0];
        assert_eq!(m.pass, MatchPass::Tolerance);
        assert_eq!(m.match_type, MatchType::Partial);
        assert_eq!(m.variance, 50);
        assert_eq!(m.rule_id.as_deref(), Some("ic"));
        assert_eq!(out.pass_counts.tolerance, 1);
    }

    #[test]
    fn tolerance_tie_prefers_earliest_date() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 10_000, "2026-01-14", "loan"),
                rec("t2", "UK", "US", "1400", -9_990, "2026-01-15", "loan"),
                rec("t3", "UK", "US", "1400", -9_990, "2026-01-13", "loan"),
            ],
            &rules(100, 0.0),
        );
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].pass, MatchPass::Tolerance);
        assert_eq!(out.candidates[0].transaction_ids, vec!["t1", "t3"]);
        match &out.warnings[0] {
            ReconWarning::AmbiguousMatch { chosen, tied_with, .. } => {
                assert_eq!(chosen, &vec!["t1".to_string(), "t3".to_string()]);
                assert_eq!(tied_with, &vec!["t2".to_string()]);
            }
            other => panic!("unexpected warning {other:?}"),
        }
        assert_eq!(out.residue[0].transaction_id, "t2");
    }

    #[test]
    fn tolerance_tie_prefers_smaller_variance_then_id() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 10_000, "2026-01-14", "loan"),
                rec("t2", "UK", "US", "1400", -9_990, "2026-01-14", "loan"),
                rec("t3", "UK", "US", "1400", -9_995, "2026-01-14", "loan"),
                rec("t4", "US", "UK", "1400", 20_000, "2026-01-14", "loan"),
                rec("t5", "UK", "US", "1400", -19_990, "2026-01-14", "loan"),
                rec("t6", "UK", "US", "1400", -19_990, "2026-01-14", "loan"),
            ],
            &rules(100, 0.0),
        );
        let ids: Vec<Vec<&str>> = out
            .candidates
            .iter()
            .map(|m| m.transaction_ids.iter().map(String::as_str).collect())
            .collect();
        // t3 is closer than t2; t5 and t6 tie on everything but id.
        assert_eq!(ids, vec![vec!["t1", "t3"], vec!["t4", "t5"]]);
        assert_eq!(out.candidates[0].variance, 5);
        let ambiguous = out
            .warnings
            .iter()
            .filter(|w| matches!(w, ReconWarning::AmbiguousMatch { .. }))
            .count();
        assert_eq!(ambiguous, 1);
    }

    #[test]
    fn over_tolerance_stays_unmatched() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 100_000, "2026-01-14", ""),
                rec("t2", "UK", "US", "1400", -99_000, "2026-01-14", ""),
            ],
            &rules(0, 0.1),
        );
        assert!(out.candidates.is_empty());
        assert_eq!(out.residue.len(), 2);
    }

    #[test]
    fn fuzzy_crosses_accounts_and_weeks() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 20_000, "2026-01-09", "recharge IT services"),
                rec("t2", "UK", "US", "2400", -20_000, "2026-01-12", "IT services recharge"),
            ],
            &rules(0, 0.0),
        );
        assert_eq!(out.candidates.len(), 1);
        let m = &out.candidates[0];
        assert_eq!(m.pass, MatchPass::Fuzzy);
        // 0.4 + 0.25 * (1 - 3/30) + 0.2 + 0 = 0.825
        assert_eq!(m.score, 0.825);
        assert_eq!(m.match_type, MatchType::Suspected);
    }

    #[test]
    fn fuzzy_greedy_takes_higher_score_first() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 20_000, "2026-01-09", "IT services recharge"),
                rec("t2", "US", "UK", "1400", 20_000, "2026-01-12", "IT services recharge"),
                rec("t3", "UK", "US", "2400", -20_000, "2026-01-12", "IT services recharge"),
                rec("t4", "UK", "US", "2400", -20_000, "2026-01-20", "IT services recharge"),
            ],
            &rules(0, 0.0),
        );
        let ids: Vec<Vec<&str>> = out
            .candidates
            .iter()
            .map(|m| m.transaction_ids.iter().map(String::as_str).collect())
            .collect();
        // t1 scores 0.825 with t3 but loses it to t2 at 0.85, then takes t4.
        assert_eq!(ids, vec![vec!["t2", "t3"], vec!["t1", "t4"]]);
        assert_eq!(out.candidates[0].score, 0.85);
        assert!(out.candidates[1].score < 0.825);
        assert!(out.candidates.iter().all(|m| m.pass == MatchPass::Fuzzy));
        assert_eq!(out.candidates[1].match_type, MatchType::Suspected);
        assert!(out.residue.is_empty());
    }

    #[test]
    fn legs_without_counterparty_pair_across_entities() {
        let open = |id: &str, entity: &str, amount: i64| {
            let mut r = rec(id, entity, "", "1400", amount, "2026-01-14", "");
            r.counterparty_id = None;
            r
        };
        let out = run(
            vec![
                open("a", "US", 100_000),
                open("b", "UK", -100_000),
                open("c", "US", -100_000),
            ],
            &rules(0, 0.0),
        );
        assert_eq!(out.candidates.len(), 1);
        let m = &out.candidates[0];
        assert_eq!(m.transaction_ids, vec!["a", "b"]);
        assert_eq!(m.pair, EntityPair::new("US", "UK"));
        // Same entity, no declared ledger: never paired.
        assert_eq!(out.residue[0].transaction_id, "c");
    }

    #[test]
    fn multi_leg_uses_open_legs_of_one_pair() {
        let open = |id: &str, entity: &str, amount: i64| {
            let mut r = rec(id, entity, "", "1400", amount, "2026-01-14", "");
            r.counterparty_id = None;
            r
        };
        let out = run(
            vec![
                open("a", "US", 50_000),
                rec("b", "US", "DE", "1400", 30_000, "2026-01-14", ""),
                open("c", "DE", -80_000),
                open("d", "UK", -80_000),
            ],
            &rules(0, 0.0),
        );
        assert_eq!(out.candidates.len(), 1);
        let m = &out.candidates[0];
        assert_eq!(m.pass, MatchPass::MultiLeg);
        assert_eq!(m.transaction_ids, vec!["a", "b", "c"]);
        assert_eq!(m.pair, EntityPair::new("DE", "US"));
        assert_eq!(out.residue[0].transaction_id, "d");
    }

    #[test]
    fn no_governing_rule_reason() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "9999", 100, "2026-01-14", ""),
                rec("t2", "UK", "US", "9999", -90, "2026-01-14", ""),
            ],
            &rules(50, 0.0),
        );
        assert!(out.candidates.is_empty());
        assert!(out.residue.iter().all(|u| u.reason == UnmatchedReason::NoGoverningRule));
    }

    #[test]
    fn multi_leg_three_way() {
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 50_000, "2026-01-14", ""),
                rec("t2", "US", "UK", "1400", 30_000, "2026-01-14", ""),
                rec("t3", "UK", "US", "1400", -80_000, "2026-01-14", ""),
            ],
            &rules(0, 0.0),
        );
        assert_eq!(out.candidates.len(), 1);
        let m = &out.candidates[0];
        assert_eq!(m.pass, MatchPass::MultiLeg);
        assert_eq!(m.transaction_ids, vec!["t1", "t2", "t3"]);
        assert_eq!(m.variance, 0);
        assert!(out.residue.is_empty());
    }

    #[test]
    fn manual_review_when_rule_not_auto() {
        let mut set = rules(100, 0.0).rules().to_vec();
        set[0].auto_reconcile = false;
        let set = RuleSet::new(set).unwrap();
        let out = run(
            vec![
                rec("t1", "US", "UK", "1400", 1_000, "2026-01-14", ""),
                rec("t2", "UK", "US", "1400", -990, "2026-01-14", ""),
            ],
            &set,
        );
        assert!(out.candidates[0].requires_review);
    }
}
