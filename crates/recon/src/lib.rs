//! `closure-recon`: intercompany reconciliation matching engine.
//!
//! Pure engine crate: receives loosely shaped transaction records and a
//! validated rule set, returns matches, residue, intercompany records and a
//! report. Storage backends plug in through [`store::ReconStore`].

pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod intercompany;
pub mod load;
pub mod matcher;
pub mod model;
pub mod multileg;
pub mod report;
pub mod rules;
pub mod scoring;
pub mod store;

pub use config::{MatchingOptions, ReconConfig};
pub use engine::{run, run_and_persist, CancellationToken, RunDiagnostics, RunOutput};
pub use error::{MalformedTransaction, PersistenceError, ReconError, ReconWarning};
pub use intercompany::ParentChildMap;
pub use model::{
    Match, MatchStatus, MatchType, Period, ReconciliationReport, RunContext, Transaction,
    TransactionRecord, UnmatchedReason, UnmatchedTransaction,
};
pub use rules::{AccountScope, ReconciliationRule, RuleSet};
pub use store::{MemoryStore, ReconStore, RunRecord};
