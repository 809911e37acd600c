//! `closure-store`: SQLite persistence for reconciliation runs.
//!
//! Implements [`closure_recon::store::ReconStore`]; the engine crate stays
//! free of any database dependency.

pub mod sqlite;

pub use sqlite::SqliteStore;
