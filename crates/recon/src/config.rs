use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ReconError;
use crate::intercompany::ParentChildMap;
use crate::rules::{AccountScope, ReconciliationRule, RuleSet};

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Raw shape of a `.recon.toml` file before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    matching: MatchingOptions,
    /// child entity -> parent entity
    #[serde(default)]
    entities: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    priority: i32,
    accounts: ScopeEntry,
    #[serde(default)]
    tolerance_percent: f64,
    #[serde(default)]
    tolerance_amount: i64,
    #[serde(default)]
    auto_reconcile: bool,
    #[serde(default = "default_true")]
    active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScopeEntry {
    Wildcard(String),
    Codes(Vec<String>),
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Matching options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchingOptions {
    /// Date lag at which date proximity decays to zero.
    #[serde(default = "default_max_lag_days")]
    pub max_lag_days: u32,
    /// Upper bound on legs in one multi-leg match.
    #[serde(default = "default_max_legs")]
    pub max_legs: usize,
    /// DFS node budget per multi-leg search.
    #[serde(default = "default_max_search_nodes")]
    pub max_search_nodes: usize,
    /// Worker threads; 0 = available cores.
    #[serde(default)]
    pub workers: usize,
}

fn default_max_lag_days() -> u32 {
    30
}

fn default_max_legs() -> usize {
    5
}

fn default_max_search_nodes() -> usize {
    50_000
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            max_lag_days: default_max_lag_days(),
            max_legs: default_max_legs(),
            max_search_nodes: default_max_search_nodes(),
            workers: 0,
        }
    }
}

impl MatchingOptions {
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.max_legs < 3 {
            return Err(ReconError::Configuration(format!(
                "max_legs must be at least 3, got {}",
                self.max_legs
            )));
        }
        if self.max_search_nodes == 0 {
            return Err(ReconError::Configuration("max_search_nodes must be positive".into()));
        }
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

/// Everything a run needs besides the transactions, already validated.
#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub rules: RuleSet,
    pub matching: MatchingOptions,
    pub hierarchy: ParentChildMap,
}

impl ReconConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let file: ConfigFile =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;

        let mut rules = Vec::with_capacity(file.rules.len());
        for entry in file.rules {
            let accounts = match entry.accounts {
                ScopeEntry::Wildcard(s) if s == "*" => AccountScope::Any,
                ScopeEntry::Wildcard(s) => {
                    return Err(ReconError::Configuration(format!(
                        "rule '{}': accounts must be \"*\" or a list of codes, got \"{s}\"",
                        entry.id
                    )))
                }
                ScopeEntry::Codes(codes) => AccountScope::from_codes(&entry.id, codes)?,
            };
            rules.push(ReconciliationRule {
                name: entry.name.unwrap_or_else(|| entry.id.clone()),
                id: entry.id,
                priority: entry.priority,
                accounts,
                tolerance_percent: entry.tolerance_percent,
                tolerance_amount: entry.tolerance_amount,
                auto_reconcile: entry.auto_reconcile,
                active: entry.active,
            });
        }

        Self::new(rules, file.matching, file.entities)
    }

    pub fn new(
        rules: Vec<ReconciliationRule>,
        matching: MatchingOptions,
        entities: BTreeMap<String, String>,
    ) -> Result<Self, ReconError> {
        let config = Self {
            rules: RuleSet::new(rules)?,
            matching,
            hierarchy: ParentChildMap::new(entities)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rule set and hierarchy are validated on construction; options are
    /// public and re-checked here before every run.
    pub fn validate(&self) -> Result<(), ReconError> {
        self.matching.validate()
    }
}
