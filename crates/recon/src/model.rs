use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MalformedTransaction, ReconError};

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[serde(alias = "dr", alias = "DR", alias = "Debit")]
    Debit,
    #[serde(alias = "cr", alias = "CR", alias = "Credit")]
    Credit,
}

impl Side {
    pub fn from_amount(amount: i64) -> Self {
        if amount < 0 {
            Self::Credit
        } else {
            Self::Debit
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debit" | "dr" | "d" => Some(Self::Debit),
            "credit" | "cr" | "c" => Some(Self::Credit),
            _ => None,
        }
    }
}

/// A transaction exactly as handed over by the extraction pipeline.
///
/// Every field is optional; [`Transaction::validate`] decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Option<String>,
    pub entity_id: Option<String>,
    pub counterparty_id: Option<String>,
    pub account_code: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub date: Option<NaiveDate>,
    pub narration: Option<String>,
    pub source_document_id: Option<String>,
    pub side: Option<Side>,
    pub voucher_type: Option<String>,
}

/// A validated, immutable unit of reconciliation input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub entity_id: String,
    pub counterparty_id: Option<String>,
    pub account_code: String,
    /// Signed minor units.
    pub amount: i64,
    pub currency: String,
    pub date: NaiveDate,
    pub narration: String,
    pub source_document_id: Option<String>,
    pub side: Side,
    pub voucher_type: Option<String>,
}

fn required(value: Option<String>, record: &str, field: &'static str) -> Result<String, MalformedTransaction> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(MalformedTransaction { record: record.to_string(), field }),
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Transaction {
    /// Validate a loose record. `row` names records that carry no id.
    pub fn validate(record: TransactionRecord, row: usize) -> Result<Self, MalformedTransaction> {
        let label = record
            .id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{row}"));

        let id = required(record.id, &label, "id")?;
        let entity_id = required(record.entity_id, &label, "entity_id")?;
        let account_code = required(record.account_code, &label, "account_code")?;
        let amount = record.amount.ok_or_else(|| MalformedTransaction {
            record: label.clone(),
            field: "amount",
        })?;
        let currency = required(record.currency, &label, "currency")?.to_ascii_uppercase();
        let date = record.date.ok_or_else(|| MalformedTransaction {
            record: label.clone(),
            field: "date",
        })?;

        Ok(Self {
            id,
            entity_id,
            counterparty_id: optional(record.counterparty_id),
            account_code,
            amount,
            currency,
            date,
            narration: record.narration.unwrap_or_default(),
            source_document_id: optional(record.source_document_id),
            side: record.side.unwrap_or_else(|| Side::from_amount(amount)),
            voucher_type: optional(record.voucher_type),
        })
    }

    /// Whether `other` may sit opposite this transaction in one match.
    ///
    /// A counterparty names the only acceptable entity (its own entity for a
    /// same-entity ledger). Without one, any other entity is acceptable.
    pub fn accepts(&self, other: &Transaction) -> bool {
        match self.counterparty_id.as_deref() {
            Some(cp) => cp == other.entity_id,
            None => other.entity_id != self.entity_id,
        }
    }

    pub fn pairs_with(&self, other: &Transaction) -> bool {
        self.accepts(other) && other.accepts(self)
    }
}

/// Unordered pair of entities; `a <= b`. `a == b` for same-entity ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityPair {
    pub a: String,
    pub b: String,
}

impl EntityPair {
    pub fn new(x: &str, y: &str) -> Self {
        if x <= y {
            Self { a: x.to_string(), b: y.to_string() }
        } else {
            Self { a: y.to_string(), b: x.to_string() }
        }
    }

    pub fn is_cross_entity(&self) -> bool {
        self.a != self.b
    }
}

impl fmt::Display for EntityPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<>{}", self.a, self.b)
    }
}

// ---------------------------------------------------------------------------
// Run context
// ---------------------------------------------------------------------------

/// Inclusive date range a run covers. Written `YYYY-MM` for calendar months,
/// otherwise `YYYY-MM-DD..YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(Self { start, end: next.pred_opt()? })
    }

    pub fn parse(s: &str) -> Result<Self, ReconError> {
        let bad = || ReconError::Configuration(format!("invalid period '{s}'"));
        if let Some((from, to)) = s.split_once("..") {
            let start = NaiveDate::parse_from_str(from.trim(), "%Y-%m-%d").map_err(|_| bad())?;
            let end = NaiveDate::parse_from_str(to.trim(), "%Y-%m-%d").map_err(|_| bad())?;
            if end < start {
                return Err(bad());
            }
            return Ok(Self { start, end });
        }
        let (y, m) = s.trim().split_once('-').ok_or_else(bad)?;
        let year: i32 = y.parse().map_err(|_| bad())?;
        let month: u32 = m.parse().map_err(|_| bad())?;
        Self::month(year, month).ok_or_else(bad)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    fn is_calendar_month(&self) -> bool {
        self.start.day() == 1
            && Self::month(self.start.year(), self.start.month()).map(|p| p.end) == Some(self.end)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_calendar_month() {
            write!(f, "{}", self.start.format("%Y-%m"))
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

impl TryFrom<String> for Period {
    type Error = ReconError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Period> for String {
    fn from(p: Period) -> Self {
        p.to_string()
    }
}

/// Identity of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: String,
    pub tenant_id: String,
    pub period: Period,
    pub created_at: DateTime<Utc>,
}

impl RunContext {
    /// Fresh run with a random id, stamped now.
    pub fn new(tenant_id: impl Into<String>, period: Period) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            period,
            created_at: Utc::now(),
        }
    }

    /// Fully pinned run; re-running with the same context reproduces the
    /// same output byte for byte.
    pub fn pinned(
        run_id: impl Into<String>,
        tenant_id: impl Into<String>,
        period: Period,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            tenant_id: tenant_id.into(),
            period,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Matches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Partial,
    Suspected,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Partial => write!(f, "partial"),
            Self::Suspected => write!(f, "suspected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Unmatched,
    Disputed,
}

impl MatchStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "matched" => Some(Self::Matched),
            "unmatched" => Some(Self::Unmatched),
            "disputed" => Some(Self::Disputed),
            _ => None,
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Unmatched => write!(f, "unmatched"),
            Self::Disputed => write!(f, "disputed"),
        }
    }
}

/// Which engine pass produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    Exact,
    Tolerance,
    Fuzzy,
    MultiLeg,
}

impl fmt::Display for MatchPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Tolerance => write!(f, "tolerance"),
            Self::Fuzzy => write!(f, "fuzzy"),
            Self::MultiLeg => write!(f, "multi_leg"),
        }
    }
}

/// One matched group of transactions.
///
/// `match_type` depends on the pass that produced the match. The exact pass
/// always reports `exact`. The tolerance and multi-leg passes only admit
/// candidates that clear the governing rule, so anything the scoring model
/// would call `suspected` is reported there as `partial`. Only fuzzy-pass
/// matches carry the unadjusted model classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub run_id: String,
    pub entity_a: String,
    pub entity_b: String,
    pub currency: String,
    /// Sorted ascending; length >= 2, > 2 for multi-leg matches.
    pub transaction_ids: Vec<String>,
    pub match_type: MatchType,
    pub match_score: f64,
    /// |sum of signed amounts| across the group, minor units.
    pub variance: i64,
    pub status: MatchStatus,
    /// `None` for exact-pass matches.
    pub rule_id: Option<String>,
    pub pass: MatchPass,
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
}

impl Match {
    pub fn dispute(&mut self) -> Result<(), ReconError> {
        self.transition(MatchStatus::Matched, MatchStatus::Disputed)
    }

    pub fn resolve(&mut self) -> Result<(), ReconError> {
        self.transition(MatchStatus::Disputed, MatchStatus::Matched)
    }

    pub fn reject(&mut self) -> Result<(), ReconError> {
        self.transition(MatchStatus::Disputed, MatchStatus::Unmatched)
    }

    /// Move to `to` if the lifecycle allows it from the current status.
    pub fn apply_status(&mut self, to: MatchStatus) -> Result<(), ReconError> {
        match to {
            MatchStatus::Disputed => self.dispute(),
            MatchStatus::Matched => self.resolve(),
            MatchStatus::Unmatched => self.reject(),
        }
    }

    fn transition(&mut self, from: MatchStatus, to: MatchStatus) -> Result<(), ReconError> {
        if self.status != from {
            return Err(ReconError::InvalidTransition {
                match_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn leg_count(&self) -> usize {
        self.transaction_ids.len()
    }
}

// ---------------------------------------------------------------------------
// Residue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    MissingRequiredField,
    OutsidePeriod,
    DuplicateId,
    NoGoverningRule,
    NoCounterpart,
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRequiredField => write!(f, "missing_required_field"),
            Self::OutsidePeriod => write!(f, "outside_period"),
            Self::DuplicateId => write!(f, "duplicate_id"),
            Self::NoGoverningRule => write!(f, "no_governing_rule"),
            Self::NoCounterpart => write!(f, "no_counterpart"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedTransaction {
    pub transaction_id: String,
    pub entity_id: Option<String>,
    pub account_code: Option<String>,
    pub amount: Option<i64>,
    pub reason: UnmatchedReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UnmatchedTransaction {
    pub fn from_transaction(t: &Transaction, reason: UnmatchedReason) -> Self {
        Self {
            transaction_id: t.id.clone(),
            entity_id: Some(t.entity_id.clone()),
            account_code: Some(t.account_code.clone()),
            amount: Some(t.amount),
            reason,
            detail: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Intercompany
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntercompanyType {
    /// The parent's legs net positive (parent lends or sells to the child).
    Downstream,
    /// The child's legs net positive.
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EliminationStatus {
    Ready,
    ReadyWithVariance,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntercompanyTransaction {
    pub match_id: String,
    pub run_id: String,
    pub parent_entity: String,
    pub child_entity: String,
    pub transaction_ids: Vec<String>,
    pub transaction_type: IntercompanyType,
    pub is_reconciled: bool,
    pub variance: i64,
    pub elimination_status: EliminationStatus,
}

impl IntercompanyTransaction {
    /// Follow the status of the underlying match.
    pub fn mirror(&mut self, status: MatchStatus) {
        self.is_reconciled = status == MatchStatus::Matched;
        self.elimination_status = match (self.is_reconciled, self.variance) {
            (true, 0) => EliminationStatus::Ready,
            (true, _) => EliminationStatus::ReadyWithVariance,
            (false, _) => EliminationStatus::Blocked,
        };
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleStats {
    pub match_count: usize,
    pub transaction_count: usize,
    pub total_variance: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: String,
    pub tenant_id: String,
    pub period: Period,
    pub total_transactions: usize,
    pub matched_transactions: usize,
    pub unmatched_transactions: usize,
    pub reconciliation_rate: f64,
    pub total_variance: i64,
    /// rule id -> match count; every configured rule appears.
    pub per_rule_breakdown: BTreeMap<String, usize>,
    pub rule_statistics: BTreeMap<String, RuleStats>,
    /// Exact-pass matches, which carry no rule.
    pub exact_unruled_matches: usize,
    pub match_type_counts: BTreeMap<MatchType, usize>,
    pub unmatched_reasons: BTreeMap<UnmatchedReason, usize>,
    pub intercompany_count: usize,
    pub requires_review_count: usize,
    /// `sha256:` digest of the canonical match list.
    pub matches_fingerprint: String,
    pub engine_version: String,
    pub timestamp: DateTime<Utc>,
}
