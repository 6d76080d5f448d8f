use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::{HoldingItem, SyncMode};

/// Provider-side account descriptor returned by `fetch_accounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub provider_account_id: String,
    pub name: Option<String>,
}

/// One provider-side transaction row, already parsed out of a payload unit
/// but not yet classified or normalized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTxnRow {
    pub provider_account_id: String,
    pub date: Option<NaiveDate>,
    pub raw_type: Option<String>,
    pub description: Option<String>,
    pub additional_detail: Option<String>,
    pub symbol: Option<String>,
    pub qty: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub provider_txn_id: Option<String>,
}

impl RawTxnRow {
    /// Upper-cased haystack for the keyword heuristics.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(d) = self.description.as_deref() {
            parts.push(d);
        }
        if let Some(a) = self.additional_detail.as_deref() {
            parts.push(a);
        }
        parts.join(" ").to_ascii_uppercase()
    }
}

/// Broker-supplied closed-lot row inside a payload unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawClosureRow {
    pub provider_account_id: String,
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub open_date_raw: Option<String>,
    pub quantity_closed: Decimal,
    pub cost_basis: Option<Decimal>,
    pub realized_pl: Option<Decimal>,
    pub proceeds: Option<Decimal>,
    pub trade_id: Option<String>,
}

/// Broker-supplied per-symbol realized summary row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSymbolSummaryRow {
    pub provider_account_id: String,
    pub symbol: String,
    pub as_of_date: NaiveDate,
    pub quantity: Option<Decimal>,
    pub cost_basis: Option<Decimal>,
    pub proceeds: Option<Decimal>,
    pub realized_pl: Option<Decimal>,
}

/// A content-addressed unit of transaction payload: one offline file or one
/// cursor page.
#[derive(Debug, Clone, Default)]
pub struct TransactionsUnit {
    pub unit_name: String,
    pub unit_hash: String,
    pub rows: Vec<RawTxnRow>,
    pub closures: Vec<RawClosureRow>,
    pub symbol_summaries: Vec<RawSymbolSummaryRow>,
    pub parse_failures: u64,
    pub start_hint: Option<NaiveDate>,
    pub end_hint: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionsBatch {
    pub units: Vec<TransactionsUnit>,
    pub next_cursor: Option<String>,
}

/// A content-addressed holdings payload unit (positions plus cash section).
#[derive(Debug, Clone)]
pub struct HoldingsUnit {
    pub unit_name: String,
    pub unit_hash: String,
    pub as_of: DateTime<Utc>,
    pub items: Vec<HoldingItem>,
    /// (provider_account_id, as_of_date, amount) cash rows.
    pub cash: Vec<(String, NaiveDate, Decimal)>,
    pub parse_failures: u64,
}

#[derive(Debug, Clone)]
pub struct SyncParams {
    pub connection_id: i64,
    pub mode: SyncMode,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub actor: String,
    pub reprocess: bool,
}

impl SyncParams {
    pub fn full(connection_id: i64, actor: &str) -> Self {
        Self {
            connection_id,
            mode: SyncMode::Full,
            start: None,
            end: None,
            actor: actor.to_string(),
            reprocess: false,
        }
    }

    pub fn incremental(connection_id: i64, actor: &str) -> Self {
        Self {
            connection_id,
            mode: SyncMode::Incremental,
            start: None,
            end: None,
            actor: actor.to_string(),
            reprocess: false,
        }
    }
}
