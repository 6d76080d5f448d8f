use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Engine configuration, threaded explicitly through sync runs, rebuilds and
/// dashboard builds. There is no environment-driven global state: callers
/// construct one of these (or load it from a TOML file) and pass it down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Directory of end-of-day price CSVs (one file per ticker).
    pub prices_dir: Option<PathBuf>,
    /// Directory of per-year tax parameter JSON files (`2025.json`, ...).
    pub tax_params_dir: PathBuf,
    /// Days of overlap re-fetched at the start of every INCREMENTAL sync.
    pub incremental_overlap_days: i64,
    /// Per-year trust cutoff: trust-account rows before this date are
    /// excluded from trust totals for that tax year.
    pub trust_start_dates: HashMap<i32, NaiveDate>,
    /// Fallback year whose parameter file is used when the requested year
    /// has none.
    pub tax_params_fallback_year: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/ledger.db"),
            prices_dir: None,
            tax_params_dir: PathBuf::from("data/tax_params"),
            incremental_overlap_days: 7,
            trust_start_dates: HashMap::new(),
            tax_params_fallback_year: 2025,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| AppError::Validation(format!("config parse: {e}")))
    }

    pub fn trust_start_for_year(&self, year: i32) -> Option<NaiveDate> {
        self.trust_start_dates.get(&year).copied()
    }
}
