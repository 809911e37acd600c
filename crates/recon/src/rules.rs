//! Reconciliation rules and the immutable, priority-ordered [`RuleSet`].
//!
//! A candidate group is governed by exactly one rule: the first active rule,
//! in `(priority, id)` order, whose account scope covers every account code
//! in the group. Rules never stack.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use crate::error::ReconError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountScope {
    Any,
    Codes(BTreeSet<String>),
}

impl AccountScope {
    pub fn from_codes(rule_id: &str, codes: Vec<String>) -> Result<Self, ReconError> {
        if codes.is_empty() {
            return Err(ReconError::Configuration(format!(
                "rule '{rule_id}': account scope is empty"
            )));
        }
        if codes.iter().any(|c| c == "*") {
            if codes.len() == 1 {
                return Ok(Self::Any);
            }
            return Err(ReconError::Configuration(format!(
                "rule '{rule_id}': wildcard \"*\" cannot be mixed with account codes"
            )));
        }
        let mut set = BTreeSet::new();
        for code in codes {
            let code = code.trim().to_string();
            if code.is_empty() {
                return Err(ReconError::Configuration(format!(
                    "rule '{rule_id}': blank account code in scope"
                )));
            }
            set.insert(code);
        }
        Ok(Self::Codes(set))
    }

    pub fn covers(&self, account_code: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Codes(codes) => codes.contains(account_code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationRule {
    pub id: String,
    pub name: String,
    /// Lower is evaluated first.
    pub priority: i32,
    pub accounts: AccountScope,
    /// Percent of the larger side, e.g. `0.1` = 0.1%.
    pub tolerance_percent: f64,
    /// Absolute tolerance in minor units.
    pub tolerance_amount: i64,
    pub auto_reconcile: bool,
    pub active: bool,
}

impl ReconciliationRule {
    /// Effective tolerance in minor units for a group whose debit legs total
    /// `debits` and credit legs total `credits` (both as magnitudes).
    pub fn tolerance_for(&self, debits: i64, credits: i64) -> i64 {
        let base = debits.max(credits).max(0) as f64;
        let pct = (base * self.tolerance_percent / 100.0).floor() as i64;
        self.tolerance_amount.max(pct)
    }

    pub fn covers_all<'a>(&self, mut accounts: impl Iterator<Item = &'a str>) -> bool {
        accounts.all(|a| self.accounts.covers(a))
    }

    fn validate(&self) -> Result<(), ReconError> {
        if self.id.trim().is_empty() {
            return Err(ReconError::Configuration("rule with blank id".into()));
        }
        if !self.tolerance_percent.is_finite() || self.tolerance_percent < 0.0 {
            return Err(ReconError::Configuration(format!(
                "rule '{}': tolerance_percent must be a non-negative number",
                self.id
            )));
        }
        if self.tolerance_amount < 0 {
            return Err(ReconError::Configuration(format!(
                "rule '{}': tolerance_amount must be non-negative",
                self.id
            )));
        }
        if let AccountScope::Codes(codes) = &self.accounts {
            if codes.is_empty() {
                return Err(ReconError::Configuration(format!(
                    "rule '{}': account scope is empty",
                    self.id
                )));
            }
        }
        Ok(())
    }
}

/// Validated rules, sorted by `(priority, id)`. At least one is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    rules: Vec<ReconciliationRule>,
}

impl RuleSet {
    pub fn new(mut rules: Vec<ReconciliationRule>) -> Result<Self, ReconError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(ReconError::Configuration(format!("duplicate rule id '{}'", rule.id)));
            }
        }
        if !rules.iter().any(|r| r.active) {
            return Err(ReconError::Configuration(
                "no active rules: tolerance is undefined".into(),
            ));
        }
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(Self { rules })
    }

    /// All rules, active or not, in evaluation order.
    pub fn rules(&self) -> &[ReconciliationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Never true for a constructed set; pairs with `len` for clippy's
    /// `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &ReconciliationRule> {
        self.rules.iter().filter(|r| r.active)
    }

    /// First active rule covering every given account code.
    pub fn governing<'a, I>(&self, accounts: I) -> Option<&ReconciliationRule>
    where
        I: IntoIterator<Item = &'a str>,
        I::IntoIter: Clone,
    {
        let accounts = accounts.into_iter();
        self.active().find(|r| r.covers_all(accounts.clone()))
    }

    pub fn get(&self, id: &str) -> Option<&ReconciliationRule> {
        self.rules.iter().find(|r| r.id == id)
    }
}
