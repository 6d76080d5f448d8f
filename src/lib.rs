//! Household investment and tax planning ledger engine.
//!
//! Four subsystems share one canonical SQLite store:
//!
//! * ingestion ([`ingest`]): connector payloads in, deduped canonical
//!   transactions, holdings snapshots and cash balances out;
//! * connection preference ([`preference`]): one authoritative connector per
//!   account per metric class;
//! * reconstructed tax lots ([`lots`]): replayable FIFO lots, disposals,
//!   wash-sale adjustments and corporate actions;
//! * the tax dashboard ([`tax`]): monthly YTD projection folding ledger
//!   totals, tags, manual inputs and confirmed document facts.
//!
//! All numbers are planning-grade: provenance and warnings travel with every
//! result instead of being rounded away.

pub mod config;
pub mod db;
pub mod docs;
pub mod errors;
pub mod holdings;
pub mod ingest;
pub mod lots;
pub mod preference;
pub mod prices;
pub mod store;
pub mod tax;

/// Install a plain stdout subscriber. Host binaries and test harnesses call
/// this once; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

pub use config::EngineConfig;
pub use errors::{AppError, AppResult};
pub use holdings::build_holdings_view;
pub use ingest::{run_sync, ConnectorAdapter, SyncParams};
pub use lots::{rebuild_tax_lots_for_taxpayer, wash_risk_for_loss_sale};
pub use preference::DashboardScope;
pub use store::Store;
pub use tax::build_tax_dashboard;
