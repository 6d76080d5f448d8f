use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use super::types::RawTxnRow;
use crate::store::TxnType;

lazy_static! {
    static ref DIV_WORD: Regex = Regex::new(r"\bDIV\b|DIVIDEND|CASH DIV").expect("static regex");
    static ref WS: Regex = Regex::new(r"\s+").expect("static regex");
}

/// Withholding keyword set. Shared with the IRA tagging rules.
pub fn looks_like_withholding(text: &str) -> bool {
    let t = text.to_ascii_uppercase();
    [
        "WITHHOLD",
        "WITHHOLDING",
        "W/H",
        "FEDERAL W/H",
        "STATE W/H",
        "FOREIGN TAX",
        "TAX WITHHOLD",
    ]
    .iter()
    .any(|tok| t.contains(tok))
}

/// Dividend-flavored text, deliberately broad: the IRA tagging rule must not
/// treat a foreign-tax-withheld dividend row as a distribution.
pub fn looks_like_dividend(text: &str) -> bool {
    let t = text.to_ascii_uppercase();
    DIV_WORD.is_match(&t) || t.contains("FOREIGN TAX WITHHELD") || t.contains("ADR")
}

pub fn looks_like_interest(text: &str) -> bool {
    text.to_ascii_uppercase().contains("INTEREST")
}

/// Book-keeping movements between a broker's own sub-accounts. These are
/// never deposits, withdrawals or income: they classify OTHER and stay out
/// of cashflow summaries.
pub fn is_internal_transfer_like(text: &str) -> bool {
    let t = text.to_ascii_uppercase();
    if t.contains("DEPOSIT SWEEP") || t.contains("SHADO") {
        return true;
    }
    if t.contains("REC FR SIS") || t.contains("REC TRSF SIS") || t.contains("TRSF SIS") {
        return true;
    }
    if t.contains("MULTI") && t.contains("CURRENCY") {
        return true;
    }
    if t.contains("FX") && (t.contains("SETTLEMENT") || t.contains("TRAD")) {
        return true;
    }
    false
}

/// One entry of the ordered classification table. The first matching rule
/// wins; rows matching nothing stay OTHER.
pub struct ClassificationRule {
    pub name: &'static str,
    pub matches: fn(&RawTxnRow) -> bool,
    pub txn_type: TxnType,
}

fn provider_category(row: &RawTxnRow) -> String {
    row.raw_type
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_ascii_uppercase()
}

fn rule_foreign_tax_withheld(row: &RawTxnRow) -> bool {
    row.text().contains("FOREIGN TAX WITHHELD")
}

fn rule_adr_fee_on_dividend(row: &RawTxnRow) -> bool {
    let text = row.text();
    text.contains("ADR FEE") && looks_like_dividend(&text)
}

fn rule_internal_transfer(row: &RawTxnRow) -> bool {
    is_internal_transfer_like(&row.text())
}

fn rule_category_transfer(row: &RawTxnRow) -> bool {
    matches!(
        provider_category(row).as_str(),
        "DEPOSIT" | "WITHDRAWAL" | "DEPOSITS & WITHDRAWALS" | "TRANSFER"
    )
}

fn rule_category_buy(row: &RawTxnRow) -> bool {
    provider_category(row) == "BUY"
}

fn rule_category_sell(row: &RawTxnRow) -> bool {
    provider_category(row) == "SELL"
}

fn rule_category_dividend(row: &RawTxnRow) -> bool {
    matches!(provider_category(row).as_str(), "DIVIDEND" | "DIVIDENDS")
}

fn rule_category_interest(row: &RawTxnRow) -> bool {
    matches!(
        provider_category(row).as_str(),
        "INTEREST" | "BROKER INTEREST"
    )
}

fn rule_category_withholding(row: &RawTxnRow) -> bool {
    matches!(
        provider_category(row).as_str(),
        "WITHHOLDING" | "WITHHOLDING TAX"
    )
}

fn rule_category_fee(row: &RawTxnRow) -> bool {
    matches!(provider_category(row).as_str(), "FEE" | "FEES" | "OTHER FEES")
}

fn rule_keyword_withholding(row: &RawTxnRow) -> bool {
    looks_like_withholding(&row.text())
}

fn rule_keyword_dividend(row: &RawTxnRow) -> bool {
    DIV_WORD.is_match(&row.text())
}

fn rule_keyword_interest(row: &RawTxnRow) -> bool {
    looks_like_interest(&row.text())
}

fn rule_keyword_fee(row: &RawTxnRow) -> bool {
    row.text().contains("FEE")
}

fn rule_sign_sell(row: &RawTxnRow) -> bool {
    match (row.qty, row.amount) {
        (Some(q), Some(a)) => q < Decimal::ZERO && a > Decimal::ZERO,
        _ => false,
    }
}

fn rule_sign_buy(row: &RawTxnRow) -> bool {
    match (row.qty, row.amount) {
        (Some(q), Some(a)) => q > Decimal::ZERO && a < Decimal::ZERO,
        _ => false,
    }
}

/// The decision procedure of the ingestion pipeline, as data: provider
/// category first, then keyword overrides, then the sign fallback. The
/// internal-transfer filter sits ahead of the transfer category so sweep and
/// sister-account rows never look like deposits or withdrawals.
pub fn classification_rules() -> &'static [ClassificationRule] {
    const RULES: &[ClassificationRule] = &[
        ClassificationRule {
            name: "foreign-tax-withheld",
            matches: rule_foreign_tax_withheld,
            txn_type: TxnType::Withholding,
        },
        ClassificationRule {
            name: "adr-fee-on-dividend",
            matches: rule_adr_fee_on_dividend,
            txn_type: TxnType::Div,
        },
        ClassificationRule {
            name: "internal-transfer",
            matches: rule_internal_transfer,
            txn_type: TxnType::Other,
        },
        ClassificationRule {
            name: "category-buy",
            matches: rule_category_buy,
            txn_type: TxnType::Buy,
        },
        ClassificationRule {
            name: "category-sell",
            matches: rule_category_sell,
            txn_type: TxnType::Sell,
        },
        ClassificationRule {
            name: "category-transfer",
            matches: rule_category_transfer,
            txn_type: TxnType::Transfer,
        },
        ClassificationRule {
            name: "category-dividend",
            matches: rule_category_dividend,
            txn_type: TxnType::Div,
        },
        ClassificationRule {
            name: "category-interest",
            matches: rule_category_interest,
            txn_type: TxnType::Int,
        },
        ClassificationRule {
            name: "category-withholding",
            matches: rule_category_withholding,
            txn_type: TxnType::Withholding,
        },
        ClassificationRule {
            name: "category-fee",
            matches: rule_category_fee,
            txn_type: TxnType::Fee,
        },
        ClassificationRule {
            name: "keyword-withholding",
            matches: rule_keyword_withholding,
            txn_type: TxnType::Withholding,
        },
        ClassificationRule {
            name: "keyword-dividend",
            matches: rule_keyword_dividend,
            txn_type: TxnType::Div,
        },
        ClassificationRule {
            name: "keyword-interest",
            matches: rule_keyword_interest,
            txn_type: TxnType::Int,
        },
        ClassificationRule {
            name: "keyword-fee",
            matches: rule_keyword_fee,
            txn_type: TxnType::Fee,
        },
        ClassificationRule {
            name: "sign-sell",
            matches: rule_sign_sell,
            txn_type: TxnType::Sell,
        },
        ClassificationRule {
            name: "sign-buy",
            matches: rule_sign_buy,
            txn_type: TxnType::Buy,
        },
    ];
    RULES
}

/// Fold the rule table over a raw row.
pub fn classify(row: &RawTxnRow) -> TxnType {
    for rule in classification_rules() {
        if (rule.matches)(row) {
            return rule.txn_type;
        }
    }
    TxnType::Other
}

/// Sign normalization after classification: BUY is a cash outflow with
/// positive qty, SELL an inflow with positive qty, WITHHOLDING is stored
/// as a positive magnitude.
pub fn normalize_signs(
    txn_type: TxnType,
    amount: Decimal,
    qty: Option<Decimal>,
) -> (Decimal, Option<Decimal>) {
    match txn_type {
        TxnType::Buy => (-amount.abs(), qty.map(|q| q.abs())),
        TxnType::Sell => (amount.abs(), qty.map(|q| q.abs())),
        TxnType::Withholding => (amount.abs(), qty),
        _ => (amount, qty),
    }
}

/// Deterministic provider-identity fallback for connectors without stable
/// row ids: a hash over the economic content of the row.
pub fn synthesize_provider_txn_id(
    provider_account_id: &str,
    date: chrono::NaiveDate,
    txn_type: TxnType,
    amount: Decimal,
    description: &str,
) -> String {
    let normalized_desc = WS
        .replace_all(description.trim(), " ")
        .to_ascii_uppercase();
    let material = format!(
        "{provider_account_id}|{date}|{}|{}|{normalized_desc}",
        txn_type.as_str(),
        amount.normalize()
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("syn-{}", &hex[..32])
}
