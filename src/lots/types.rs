use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Summary of one rebuild run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildResult {
    pub lots_created: u64,
    pub disposals_created: u64,
    pub wash_adjustments_created: u64,
    pub warnings: Vec<String>,
}

/// Non-fatal conditions surfaced by the replay. The rebuild never guesses:
/// missing reference data degrades the affected rows and keeps going.
#[derive(Debug, Clone, PartialEq)]
pub enum RebuildWarning {
    MissingLotHistory {
        ticker: String,
        account_id: i64,
        sell_txn_id: i64,
        missing_qty: Decimal,
    },
    UnknownSecurity {
        ticker: String,
    },
    UnappliedCorporateAction {
        event_id: i64,
        reason: String,
    },
    MergerCashExceedsBasis {
        event_id: i64,
        excess: Decimal,
    },
}

impl fmt::Display for RebuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildWarning::MissingLotHistory {
                ticker,
                account_id,
                sell_txn_id,
                missing_qty,
            } => write!(
                f,
                "missing lot history: sell txn {sell_txn_id} of {ticker} in account {account_id} short {missing_qty} shares"
            ),
            RebuildWarning::UnknownSecurity { ticker } => {
                write!(f, "unknown security: {ticker}")
            }
            RebuildWarning::UnappliedCorporateAction { event_id, reason } => {
                write!(f, "corporate action {event_id} not applied: {reason}")
            }
            RebuildWarning::MergerCashExceedsBasis { event_id, excess } => {
                write!(
                    f,
                    "merger {event_id}: cash in lieu exceeds basis, {excess} realized"
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WashRisk {
    None,
    Possible,
    Definite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WashMatchKind {
    ExecutedBuy,
    ProposedBuy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WashMatch {
    pub kind: WashMatchKind,
    pub date: NaiveDate,
    pub ticker: String,
    pub account_id: Option<i64>,
}

/// A trade the caller is thinking about placing, checked for wash risk
/// before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedBuy {
    pub ticker: Option<String>,
    pub date: Option<NaiveDate>,
    pub account_id: Option<i64>,
}
