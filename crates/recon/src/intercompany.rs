use std::collections::{BTreeMap, HashSet};

use crate::error::ReconError;
use crate::model::{EliminationStatus, IntercompanyTransaction, IntercompanyType, Match, Transaction};

/// Declared entity hierarchy: child -> direct parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentChildMap {
    parents: BTreeMap<String, String>,
}

impl ParentChildMap {
    pub fn new(parents: BTreeMap<String, String>) -> Result<Self, ReconError> {
        for (child, parent) in &parents {
            if child == parent {
                return Err(ReconError::Configuration(format!(
                    "entity '{child}' is declared as its own parent"
                )));
            }
        }
        // Walk up from every entity; revisiting a node means a cycle.
        for start in parents.keys() {
            let mut seen = HashSet::new();
            let mut cur = start.as_str();
            while let Some(parent) = parents.get(cur) {
                if !seen.insert(cur) {
                    return Err(ReconError::Configuration(format!(
                        "entity hierarchy has a cycle through '{start}'"
                    )));
                }
                cur = parent.as_str();
            }
        }
        Ok(Self { parents })
    }

    pub fn parent_of(&self, entity: &str) -> Option<&str> {
        self.parents.get(entity).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// `(parent, child)` when the two entities are directly related, either way round.
    pub fn relation<'a>(&self, x: &'a str, y: &'a str) -> Option<(&'a str, &'a str)> {
        if self.parent_of(y) == Some(x) {
            Some((x, y))
        } else if self.parent_of(x) == Some(y) {
            Some((y, x))
        } else {
            None
        }
    }
}

/// Derive intercompany records for matches between a parent and its child.
///
/// `transactions` resolves leg ids to their entity and amount.
pub fn classify(
    matches: &[Match],
    hierarchy: &ParentChildMap,
    transactions: &BTreeMap<&str, &Transaction>,
) -> Vec<IntercompanyTransaction> {
    let mut out = Vec::new();

    for m in matches {
        let Some((parent, child)) = hierarchy.relation(&m.entity_a, &m.entity_b) else {
            continue;
        };

        let parent_net: i64 = m
            .transaction_ids
            .iter()
            .filter_map(|id| transactions.get(id.as_str()))
            .filter(|t| t.entity_id == parent)
            .map(|t| t.amount)
            .sum();

        let transaction_type = if parent_net >= 0 {
            IntercompanyType::Downstream
        } else {
            IntercompanyType::Upstream
        };

        let mut record = IntercompanyTransaction {
            match_id: m.id.clone(),
            run_id: m.run_id.clone(),
            parent_entity: parent.to_string(),
            child_entity: child.to_string(),
            transaction_ids: m.transaction_ids.clone(),
            transaction_type,
            is_reconciled: false,
            variance: m.variance,
            elimination_status: EliminationStatus::Blocked,
        };
        record.mirror(m.status);
        out.push(record);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MatchPass, MatchStatus, MatchType, Side};
    use chrono::{NaiveDate, Utc};

    fn hierarchy() -> ParentChildMap {
        ParentChildMap::new(BTreeMap::from([
            ("UK".to_string(), "US".to_string()),
            ("DE".to_string(), "US".to_string()),
        ]))
        .unwrap()
    }

    fn txn(id: &str, entity: &str, amount: i64) -> Transaction {
        Transaction {
            id: id.into(),
            entity_id: entity.into(),
            counterparty_id: None,
            account_code: "1400".into(),
            amount,
            currency: "USD".into(),
            date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            narration: String::new(),
            source_document_id: None,
            side: Side::from_amount(amount),
            voucher_type: None,
        }
    }

    fn matched(id: &str, a: &str, b: &str, legs: &[&str], variance: i64) -> Match {
        Match {
            id: id.into(),
            run_id: "run".into(),
            entity_a: a.into(),
            entity_b: b.into(),
            currency: "USD".into(),
            transaction_ids: legs.iter().map(|s| s.to_string()).collect(),
            match_type: MatchType::Exact,
            match_score: 1.0,
            variance,
            status: MatchStatus::Matched,
            rule_id: None,
            pass: MatchPass::Exact,
            requires_review: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn rejects_self_parent_and_cycles() {
        let own = ParentChildMap::new(BTreeMap::from([("A".to_string(), "A".to_string())]));
        assert!(own.is_err());
        let cycle = ParentChildMap::new(BTreeMap::from([
            ("A".to_string(), "B".to_string()),
            ("B".to_string(), "C".to_string()),
            ("C".to_string(), "A".to_string()),
        ]));
        assert!(cycle.unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn relation_either_direction() {
        let h = hierarchy();
        assert_eq!(h.relation("UK", "US"), Some(("US", "UK")));
        assert_eq!(h.relation("US", "DE"), Some(("US", "DE")));
        // Siblings are not a declared parent/child pair.
        assert_eq!(h.relation("UK", "DE"), None);
    }

    #[test]
    fn classifies_parent_child_matches_only() {
        let txns = [
            txn("t1", "US", 5000),
            txn("t2", "UK", -5000),
            txn("t3", "UK", 700),
            txn("t4", "DE", -690),
            txn("t5", "DE", -300),
            txn("t6", "US", 300),
        ];
        let lookup: BTreeMap<&str, &Transaction> = txns.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut disputed = matched("m3", "DE", "US", &["t5", "t6"], 0);
        disputed.status = MatchStatus::Disputed;
        let matches = vec![
            matched("m1", "UK", "US", &["t1", "t2"], 0),
            matched("m2", "DE", "UK", &["t3", "t4"], 10),
            disputed,
        ];

        let ic = classify(&matches, &hierarchy(), &lookup);
        assert_eq!(ic.len(), 2);

        assert_eq!(ic[0].match_id, "m1");
        assert_eq!(ic[0].parent_entity, "US");
        assert_eq!(ic[0].child_entity, "UK");
        assert_eq!(ic[0].transaction_type, IntercompanyType::Downstream);
        assert!(ic[0].is_reconciled);
        assert_eq!(ic[0].elimination_status, EliminationStatus::Ready);

        assert_eq!(ic[1].match_id, "m3");
        assert_eq!(ic[1].transaction_type, IntercompanyType::Downstream);
        assert!(!ic[1].is_reconciled);
        assert_eq!(ic[1].elimination_status, EliminationStatus::Blocked);
    }

    #[test]
    fn upstream_when_child_nets_positive() {
        let txns = [txn("a", "US", -100), txn("b", "UK", 100)];
        let lookup: BTreeMap<&str, &Transaction> = txns.iter().map(|t| (t.id.as_str(), t)).collect();
        let ic = classify(&[matched("m", "UK", "US", &["a", "b"], 3)], &hierarchy(), &lookup);
        assert_eq!(ic[0].transaction_type, IntercompanyType::Upstream);
        assert_eq!(ic[0].elimination_status, EliminationStatus::ReadyWithVariance);
    }

    #[test]
    fn mirror_follows_match_status() {
        let txns = [txn("a", "US", 100), txn("b", "UK", -97)];
        let lookup: BTreeMap<&str, &Transaction> = txns.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut ic = classify(&[matched("m", "UK", "US", &["a", "b"], 3)], &hierarchy(), &lookup).remove(0);

        ic.mirror(MatchStatus::Disputed);
        assert!(!ic.is_reconciled);
        assert_eq!(ic.elimination_status, EliminationStatus::Blocked);

        ic.mirror(MatchStatus::Matched);
        assert!(ic.is_reconciled);
        assert_eq!(ic.elimination_status, EliminationStatus::ReadyWithVariance);
    }
}
