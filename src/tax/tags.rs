use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::debug;

use crate::errors::AppResult;
use crate::ingest::classify::{is_internal_transfer_like, looks_like_dividend, looks_like_withholding};
use crate::store::{Account, AccountType, Store, TagCategory, TaxpayerType, Transaction, TxnType};

/// The IRA/trust auto-tagging rule.
///
/// Inside an IRA, dividend-looking rows are never distributions (a foreign
/// tax line on a dividend stays untagged), withholding keywords win next,
/// and remaining TRANSFER/WITHHOLDING rows that are not internal transfers
/// are distributions. Trust outflows after the trust cutoff become
/// TRUST_DISTRIBUTION.
pub fn suggest_tax_tag(
    tx: &Transaction,
    account_type: AccountType,
    taxpayer_type: TaxpayerType,
    trust_start: Option<NaiveDate>,
) -> Option<TagCategory> {
    let text = format!(
        "{} {}",
        tx.links.text(),
        tx.ticker.as_deref().unwrap_or("")
    );
    if account_type == AccountType::Ira {
        if looks_like_dividend(&text) {
            return None;
        }
        if looks_like_withholding(&text) {
            return Some(TagCategory::IraWithholding);
        }
        if matches!(tx.txn_type, TxnType::Transfer | TxnType::Withholding)
            && !is_internal_transfer_like(&text)
        {
            return Some(TagCategory::IraDistribution);
        }
        return None;
    }
    if taxpayer_type == TaxpayerType::Trust {
        if let Some(start) = trust_start {
            if tx.date < start {
                return None;
            }
        }
        if tx.txn_type == TxnType::Transfer
            && tx.amount < Decimal::ZERO
            && !is_internal_transfer_like(&text)
        {
            return Some(TagCategory::TrustDistribution);
        }
    }
    None
}

/// Apply the suggestion rule across a year, creating missing tags and
/// correcting earlier auto-tags that flipped between the two IRA
/// categories. Hand-entered tags (any note other than "auto") are left
/// alone.
pub async fn auto_tag_tax_transactions(
    store: &Store,
    year: i32,
    trust_start: Option<NaiveDate>,
) -> AppResult<u64> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or_default();
    let end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or_default();

    let accounts: HashMap<i64, Account> = store
        .list_accounts()
        .await?
        .into_iter()
        .map(|a| (a.id, a))
        .collect();
    let taxpayers: HashMap<i64, TaxpayerType> = store
        .list_taxpayers()
        .await?
        .into_iter()
        .map(|tp| (tp.id, tp.entity_type))
        .collect();

    let mut changed = 0u64;
    for tx in store.transactions_in_range(start, end).await? {
        let account = match accounts.get(&tx.account_id) {
            Some(a) => a,
            None => continue,
        };
        let taxpayer_type = taxpayers
            .get(&account.taxpayer_id)
            .copied()
            .unwrap_or(TaxpayerType::Personal);
        if account.account_type != AccountType::Ira && taxpayer_type != TaxpayerType::Trust {
            continue;
        }
        let suggested = match suggest_tax_tag(&tx, account.account_type, taxpayer_type, trust_start)
        {
            Some(s) => s,
            None => continue,
        };
        match store.tag_for_transaction(tx.id).await? {
            None => {
                store.upsert_tax_tag(tx.id, suggested, Some("auto")).await?;
                changed += 1;
            }
            Some(existing) => {
                let both_ira = matches!(
                    existing.category,
                    TagCategory::IraWithholding | TagCategory::IraDistribution
                ) && matches!(
                    suggested,
                    TagCategory::IraWithholding | TagCategory::IraDistribution
                );
                let auto_note = existing
                    .note
                    .as_deref()
                    .map_or(true, |n| matches!(n.trim().to_ascii_lowercase().as_str(), "" | "auto"));
                if both_ira && auto_note && existing.category != suggested {
                    store.upsert_tax_tag(tx.id, suggested, Some("auto")).await?;
                    changed += 1;
                }
            }
        }
    }
    debug!(year, changed, "auto-tagged tax transactions");
    Ok(changed)
}
