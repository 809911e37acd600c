use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{Datelike, NaiveDate};

use crate::model::{
    EntityPair, Period, Transaction, TransactionRecord, UnmatchedReason, UnmatchedTransaction,
};

/// ISO year-week a transaction date falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn of(date: NaiveDate) -> Self {
        let w = date.iso_week();
        Self { year: w.year(), week: w.week() }
    }
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

/// Matching scope of one transaction, before partitions are formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Counterparty given: only legs of this pair can meet it.
    Pair(EntityPair),
    /// No counterparty: any other entity's legs can meet it.
    Open(String),
}

impl Scope {
    pub fn of(t: &Transaction) -> Self {
        match t.counterparty_id.as_deref() {
            Some(cp) => Self::Pair(EntityPair::new(&t.entity_id, cp)),
            None => Self::Open(t.entity_id.clone()),
        }
    }
}

/// Partition key = the scopes that can meet each other, plus currency.
/// Never matches across currencies.
///
/// Pair scopes without open entities form a partition of their own. Open
/// entities can meet each other and every cross-entity pair they belong to,
/// so those scopes share one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub pairs: Vec<EntityPair>,
    pub open: Vec<String>,
    pub currency: String,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scopes: Vec<String> = self
            .pairs
            .iter()
            .map(EntityPair::to_string)
            .chain(self.open.iter().map(|e| format!("{e}<>*")))
            .collect();
        write!(f, "{}:{}", scopes.join(","), self.currency)
    }
}

/// Union-find over scopes; the root of a group is its smallest scope.
#[derive(Debug, Default)]
struct ScopeGroups {
    parent: BTreeMap<Scope, Scope>,
}

impl ScopeGroups {
    fn insert(&mut self, scope: &Scope) {
        if !self.parent.contains_key(scope) {
            self.parent.insert(scope.clone(), scope.clone());
        }
    }

    fn root(&self, scope: &Scope) -> Scope {
        let mut cur = scope;
        while let Some(parent) = self.parent.get(cur) {
            if parent == cur {
                break;
            }
            cur = parent;
        }
        cur.clone()
    }

    fn join(&mut self, x: &Scope, y: &Scope) {
        let (rx, ry) = (self.root(x), self.root(y));
        match rx.cmp(&ry) {
            Ordering::Less => {
                self.parent.insert(ry, rx);
            }
            Ordering::Greater => {
                self.parent.insert(rx, ry);
            }
            Ordering::Equal => {}
        }
    }

    /// Group the scopes of one currency.
    fn of(txns: &[Transaction]) -> Self {
        let mut groups = Self::default();
        for t in txns {
            groups.insert(&Scope::of(t));
        }
        let open: Vec<Scope> = groups
            .parent
            .keys()
            .filter(|s| matches!(s, Scope::Open(_)))
            .cloned()
            .collect();
        for pair in open.windows(2) {
            groups.join(&pair[0], &pair[1]);
        }
        let pairs: Vec<EntityPair> = groups
            .parent
            .keys()
            .filter_map(|s| match s {
                Scope::Pair(p) if p.is_cross_entity() => Some(p.clone()),
                _ => None,
            })
            .collect();
        for pair in pairs {
            for entity in [&pair.a, &pair.b] {
                let open = Scope::Open(entity.clone());
                if groups.parent.contains_key(&open) {
                    groups.join(&Scope::Pair(pair.clone()), &open);
                }
            }
        }
        groups
    }
}

/// Bucket key inside a partition = (account code, ISO week).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub account_code: String,
    pub week: WeekKey,
}

/// All transactions of one partition key. Owned by exactly one
/// worker for the duration of a run.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: PartitionKey,
    /// Transactions sorted by id within each bucket.
    pub buckets: BTreeMap<BucketKey, Vec<Transaction>>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }
}

/// Transactions bucketed for bounded candidate search, plus the records that
/// could not be indexed at all.
#[derive(Debug, Clone, Default)]
pub struct TransactionIndex {
    pub partitions: Vec<Partition>,
    pub unindexable: Vec<UnmatchedTransaction>,
    pub total: usize,
}

impl TransactionIndex {
    /// Validate records and bucket them by (scope group, currency, account,
    /// week).
    ///
    /// Malformed records, records dated outside `period` and repeated ids go
    /// to `unindexable` with their reason; nothing here is fatal.
    pub fn build(records: Vec<TransactionRecord>, period: &Period) -> Self {
        let total = records.len();
        let mut unindexable = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut by_currency: BTreeMap<String, Vec<Transaction>> = BTreeMap::new();

        for (row, record) in records.into_iter().enumerate() {
            let raw = record.clone();
            let txn = match Transaction::validate(record, row) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("{e}");
                    unindexable.push(UnmatchedTransaction {
                        transaction_id: e.record.clone(),
                        entity_id: raw.entity_id,
                        account_code: raw.account_code,
                        amount: raw.amount,
                        reason: UnmatchedReason::MissingRequiredField,
                        detail: Some(e.field.to_string()),
                    });
                    continue;
                }
            };

            if !seen_ids.insert(txn.id.clone()) {
                log::warn!("duplicate transaction id '{}' (row {row})", txn.id);
                unindexable.push(UnmatchedTransaction::from_transaction(&txn, UnmatchedReason::DuplicateId));
                continue;
            }

            if !period.contains(txn.date) {
                let mut u = UnmatchedTransaction::from_transaction(&txn, UnmatchedReason::OutsidePeriod);
                u.detail = Some(txn.date.to_string());
                unindexable.push(u);
                continue;
            }

            by_currency.entry(txn.currency.clone()).or_default().push(txn);
        }

        let mut partitions = Vec::new();
        for (currency, txns) in by_currency {
            let groups = ScopeGroups::of(&txns);
            let mut members: BTreeMap<Scope, Vec<&Scope>> = BTreeMap::new();
            for scope in groups.parent.keys() {
                members.entry(groups.root(scope)).or_default().push(scope);
            }
            let mut grouped: BTreeMap<Scope, BTreeMap<BucketKey, Vec<Transaction>>> = BTreeMap::new();
            for txn in txns {
                let bkey = BucketKey {
                    account_code: txn.account_code.clone(),
                    week: WeekKey::of(txn.date),
                };
                let root = groups.root(&Scope::of(&txn));
                grouped.entry(root).or_default().entry(bkey).or_default().push(txn);
            }

            for (root, mut buckets) in grouped {
                for txns in buckets.values_mut() {
                    txns.sort_by(|a, b| a.id.cmp(&b.id));
                }
                let mut key = PartitionKey {
                    pairs: Vec::new(),
                    open: Vec::new(),
                    currency: currency.clone(),
                };
                for scope in members.get(&root).into_iter().flatten() {
                    match scope {
                        Scope::Pair(p) => key.pairs.push(p.clone()),
                        Scope::Open(e) => key.open.push(e.clone()),
                    }
                }
                partitions.push(Partition { key, buckets });
            }
        }
        partitions.sort_by(|a, b| a.key.cmp(&b.key));

        Self { partitions, unindexable, total }
    }

    pub fn indexed_count(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }
}
