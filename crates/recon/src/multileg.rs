//! Bounded subset-sum search for multi-leg groups.
//!
//! Legs are searched in (date, amount, id) order. A group is acceptable when
//! it has 3..=`max_legs` legs, spans at most `max_span_days`, carries both a
//! positive and a negative leg (and both entities of a cross-entity pair),
//! nets to within the governing rule's tolerance of zero, and scores at least
//! the suspected threshold. Among acceptable groups the best is the one with
//! the smallest |sum|, then fewer legs, then lexicographically smallest ids.

use std::cmp::Ordering;

use crate::model::Transaction;
use crate::rules::ReconciliationRule;
use crate::scoring::{classify_within_tolerance, lag_days, Score, ScoringModel, TransactionGroup};

pub const MIN_LEGS: usize = 3;

/// An accepted group: indices into the searched slice, ascending.
#[derive(Debug, Clone)]
pub struct LegGroup {
    pub indices: Vec<usize>,
    pub score: Score,
}

#[derive(Debug, Default)]
pub struct SearchResult {
    pub best: Option<LegGroup>,
    /// Acceptable groups that tied with `best` on (|sum|, leg count).
    pub tied: Vec<Vec<usize>>,
    pub nodes_visited: u64,
    pub cap_hit: bool,
    /// Branches abandoned because the running sum overflowed.
    pub overflowed: u64,
}

pub struct LegSearch<'a> {
    /// Sorted by (date, amount, id).
    pub legs: &'a [&'a Transaction],
    pub rule: &'a ReconciliationRule,
    pub model: &'a ScoringModel,
    /// Both entities of a cross-entity pair must appear in the group.
    pub required_entities: Option<(&'a str, &'a str)>,
    pub max_legs: usize,
    pub max_nodes: usize,
    pub max_span_days: u32,
}

/// Maximum number of tied groups kept for the ambiguity warning.
const MAX_TIED: usize = 8;

struct State {
    stack: Vec<usize>,
    result: SearchResult,
}

impl<'a> LegSearch<'a> {
    pub fn run(&self) -> SearchResult {
        let mut state = State {
            stack: Vec::with_capacity(self.max_legs),
            result: SearchResult::default(),
        };
        if self.legs.len() >= MIN_LEGS && self.max_legs >= MIN_LEGS {
            self.dfs(0, 0, &mut state);
        }
        state.result
    }

    fn dfs(&self, start: usize, sum: i64, state: &mut State) {
        if state.result.cap_hit {
            return;
        }
        if state.stack.len() >= MIN_LEGS {
            self.consider(sum, state);
        }
        if state.stack.len() >= self.max_legs {
            return;
        }

        for i in start..self.legs.len() {
            if let Some(&first) = state.stack.first() {
                // Sorted by date: every later leg is further away.
                if lag_days(self.legs[first].date, self.legs[i].date) > self.max_span_days {
                    break;
                }
            }

            state.result.nodes_visited += 1;
            if state.result.nodes_visited >= self.max_nodes as u64 {
                state.result.cap_hit = true;
                return;
            }

            let Some(next_sum) = sum.checked_add(self.legs[i].amount) else {
                state.result.overflowed += 1;
                continue;
            };

            state.stack.push(i);
            self.dfs(i + 1, next_sum, state);
            state.stack.pop();

            if state.result.cap_hit {
                return;
            }
        }
    }

    fn consider(&self, sum: i64, state: &mut State) {
        let group: Vec<&Transaction> = state.stack.iter().map(|&i| self.legs[i]).collect();

        if !group.iter().any(|t| t.amount > 0) || !group.iter().any(|t| t.amount < 0) {
            return;
        }
        if let Some((a, b)) = self.required_entities {
            if !group.iter().any(|t| t.entity_id == a) || !group.iter().any(|t| t.entity_id == b) {
                return;
            }
        }

        let Some(variance) = sum.checked_abs() else {
            state.result.overflowed += 1;
            return;
        };

        // Level = (|sum|, leg count); a worse level never needs scoring.
        let level = match &state.result.best {
            None => Ordering::Less,
            Some(best) => variance
                .cmp(&best.score.variance)
                .then_with(|| state.stack.len().cmp(&best.indices.len())),
        };
        if level == Ordering::Greater {
            return;
        }

        let (debits, credits): (Vec<&Transaction>, Vec<&Transaction>) =
            group.iter().copied().partition(|t| t.amount > 0);
        let Ok(score) = self
            .model
            .score(&TransactionGroup::new(debits), &TransactionGroup::new(credits), self.rule)
        else {
            state.result.overflowed += 1;
            return;
        };
        if !score.within_tolerance() || classify_within_tolerance(&score).is_none() {
            return;
        }

        let candidate = LegGroup { indices: state.stack.clone(), score };
        let result = &mut state.result;
        match (level, result.best.take()) {
            (Ordering::Equal, Some(best)) => {
                let (winner, loser) = if self.sorted_ids(&candidate.indices) < self.sorted_ids(&best.indices) {
                    (candidate, best)
                } else {
                    (best, candidate)
                };
                if result.tied.len() < MAX_TIED {
                    result.tied.push(loser.indices);
                }
                result.best = Some(winner);
            }
            _ => {
                result.tied.clear();
                result.best = Some(candidate);
            }
        }
    }

    fn sorted_ids(&self, indices: &[usize]) -> Vec<&'a str> {
        let mut ids: Vec<&str> = indices.iter().map(|&i| self.legs[i].id.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use crate::rules::AccountScope;
    use chrono::NaiveDate;

    fn leg(id: &str, entity: &str, amount: i64, day: u32) -> Transaction {
        Transaction {
            id: id.into(),
            entity_id: entity.into(),
            counterparty_id: None,
            account_code: "1400".into(),
            amount,
            currency: "USD".into(),
            date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            narration: String::new(),
            source_document_id: None,
            side: Side::from_amount(amount),
            voucher_type: None,
        }
    }

    fn rule(tolerance_amount: i64) -> ReconciliationRule {
        ReconciliationRule {
            id: "r".into(),
            name: "r".into(),
            priority: 1,
            accounts: AccountScope::Any,
            tolerance_percent: 0.0,
            tolerance_amount,
            auto_reconcile: true,
            active: true,
        }
    }

    fn search<'a>(
        legs: &'a [&'a Transaction],
        rule: &'a ReconciliationRule,
        model: &'a ScoringModel,
        max_legs: usize,
    ) -> SearchResult {
        LegSearch {
            legs,
            rule,
            model,
            required_entities: None,
            max_legs,
            max_nodes: 50_000,
            max_span_days: 30,
        }
        .run()
    }

    fn ids(legs: &[&Transaction], group: &LegGroup) -> Vec<String> {
        group.indices.iter().map(|&i| legs[i].id.clone()).collect()
    }

    #[test]
    fn three_legs_clear() {
        let txns = [leg("a", "US", 50_000, 5), leg("b", "US", 30_000, 5), leg("c", "UK", -80_000, 6)];
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(0);
        let out = search(&legs, &r, &model, 5);
        let best = out.best.unwrap();
        assert_eq!(ids(&legs, &best), vec!["a", "b", "c"]);
        assert_eq!(best.score.variance, 0);
        assert!(!out.cap_hit);
    }

    #[test]
    fn prefers_smaller_residual_then_fewer_legs() {
        let txns = [
            leg("a", "US", 100, 5),
            leg("b", "US", 200, 5),
            leg("c", "UK", -290, 5),
            leg("d", "UK", -10, 5),
        ];
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(20);
        let best = search(&legs, &r, &model, 5).best.unwrap();
        // {a,b,c} leaves 10, {a,b,c,d} clears exactly.
        assert_eq!(ids(&legs, &best), vec!["a", "b", "c", "d"]);
        assert_eq!(best.score.variance, 0);
    }

    #[test]
    fn respects_max_legs() {
        let txns = [
            leg("a", "US", 10, 5),
            leg("b", "US", 10, 5),
            leg("c", "US", 10, 5),
            leg("d", "US", 10, 5),
            leg("e", "UK", -40, 5),
        ];
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(0);
        assert!(search(&legs, &r, &model, 4).best.is_none());
        assert_eq!(search(&legs, &r, &model, 5).best.unwrap().indices.len(), 5);
    }

    #[test]
    fn requires_both_entities() {
        let txns = [leg("a", "US", 50, 5), leg("b", "US", 30, 5), leg("c", "US", -80, 5)];
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(0);
        let out = LegSearch {
            legs: &legs,
            rule: &r,
            model: &model,
            required_entities: Some(("UK", "US")),
            max_legs: 5,
            max_nodes: 50_000,
            max_span_days: 30,
        }
        .run();
        assert!(out.best.is_none());
    }

    #[test]
    fn span_limit_prunes() {
        let txns = [leg("a", "US", 50, 1), leg("b", "US", 30, 2), leg("c", "UK", -80, 20)];
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(0);
        let out = LegSearch {
            legs: &legs,
            rule: &r,
            model: &model,
            required_entities: None,
            max_legs: 5,
            max_nodes: 50_000,
            max_span_days: 10,
        }
        .run();
        assert!(out.best.is_none());
    }

    #[test]
    fn ties_break_on_ids() {
        let txns = [
            leg("a", "US", 50, 5),
            leg("b", "US", 30, 5),
            leg("c", "US", 30, 5),
            leg("d", "UK", -80, 5),
        ];
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(0);
        let out = search(&legs, &r, &model, 3);
        let best = out.best.as_ref().unwrap();
        assert_eq!(ids(&legs, best), vec!["a", "b", "d"]);
        assert_eq!(out.tied.len(), 1);
    }

    #[test]
    fn node_cap() {
        let txns: Vec<Transaction> = (0..20).map(|i| leg(&format!("t{i:02}"), "US", 7 + i, 5)).collect();
        let legs: Vec<&Transaction> = txns.iter().collect();
        let model = ScoringModel::default();
        let r = rule(0);
        let out = LegSearch {
            legs: &legs,
            rule: &r,
            model: &model,
            required_entities: None,
            max_legs: 5,
            max_nodes: 100,
            max_span_days: 30,
        }
        .run();
        assert!(out.cap_hit);
        assert!(out.best.is_none());
        assert_eq!(out.nodes_visited, 100);
    }
}
