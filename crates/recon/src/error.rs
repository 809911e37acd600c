use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::MatchStatus;

/// Run-level failure. Any of these aborts the run; nothing is persisted.
#[derive(Debug, Error)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Rule set or hierarchy is unusable (no active rules, bad scope, cycle).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Input file is structurally broken (bad CSV framing, bad JSON).
    #[error("input error: {0}")]
    Input(String),
    /// Run was cancelled between partitions.
    #[error("run {run_id} cancelled")]
    Cancelled { run_id: String },
    /// Match status change not allowed from the current status.
    #[error("match {match_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        match_id: String,
        from: MatchStatus,
        to: MatchStatus,
    },
    /// Writing matches or the report failed; the run is discarded.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ReconError {
    /// Single user-visible category for a failed run.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConfigParse(_) | Self::Configuration(_) => "configuration",
            Self::Input(_) => "input",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("run {0} already persisted")]
    DuplicateRun(String),
    #[error("match {0} not found")]
    MatchNotFound(String),
    #[error("cannot encode record: {0}")]
    Encode(String),
}

/// A transaction record missing a field the engine needs.
///
/// Never fatal: the record is reported unmatched with reason
/// `missing_required_field`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transaction {record}: missing required field '{field}'")]
pub struct MalformedTransaction {
    pub record: String,
    pub field: &'static str,
}

/// Non-fatal observation made during a run. Logged, collected in the run
/// diagnostics, never aborts matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconWarning {
    /// Two or more candidates tied on score; resolved by the deterministic
    /// tie-break order.
    AmbiguousMatch {
        partition: String,
        chosen: Vec<String>,
        tied_with: Vec<String>,
        score: f64,
    },
    /// A candidate pair could not be evaluated and was skipped.
    SkippedCandidate {
        partition: String,
        transaction_ids: Vec<String>,
        reason: String,
    },
    /// Multi-leg search stopped at its node budget; best group so far was used.
    SearchBudgetExhausted {
        partition: String,
        account_code: String,
        nodes_visited: u64,
    },
}

impl std::fmt::Display for ReconWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousMatch { partition, chosen, tied_with, score } => write!(
                f,
                "{partition}: ambiguous match at score {score}: chose [{}] over [{}]",
                chosen.join(", "),
                tied_with.join(", ")
            ),
            Self::SkippedCandidate { partition, transaction_ids, reason } => write!(
                f,
                "{partition}: skipped candidate [{}]: {reason}",
                transaction_ids.join(", ")
            ),
            Self::SearchBudgetExhausted { partition, account_code, nodes_visited } => write!(
                f,
                "{partition}: multi-leg search on account {account_code} hit node budget after {nodes_visited} nodes"
            ),
        }
    }
}
