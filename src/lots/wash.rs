use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;

use super::engine::ReplayOutcome;
use super::types::{ProposedBuy, WashMatch, WashMatchKind, WashRisk};
use crate::errors::AppResult;
use crate::store::{AccountType, Security, Store, Transaction, TxnType, WashStatus};

pub const WASH_WINDOW_DAYS: i64 = 30;

/// One consumed slice of a loss sale: how many shares and how much loss per
/// share they carry.
#[derive(Debug, Clone)]
pub(crate) struct LossSlice {
    pub qty: Decimal,
    pub per_share_loss: Decimal,
}

#[derive(Debug, Clone)]
pub(crate) struct LossSale {
    pub sell_txn_id: i64,
    pub ticker: String,
    pub sale_date: NaiveDate,
    pub slices: Vec<LossSlice>,
}

#[derive(Debug, Clone)]
pub(crate) struct WashDraft {
    pub loss_sale_txn_id: i64,
    pub replacement_buy_txn_id: Option<i64>,
    pub replacement_lot_index: Option<usize>,
    pub deferred_loss: Decimal,
    pub basis_increase: Decimal,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub status: WashStatus,
}

/// Same ticker, or both known and in the same substitute group.
fn substantially_identical(
    ticker_a: &str,
    ticker_b: &str,
    securities_by_ticker: &HashMap<String, Security>,
) -> bool {
    if ticker_a == ticker_b {
        return true;
    }
    match (
        securities_by_ticker.get(ticker_a),
        securities_by_ticker.get(ticker_b),
    ) {
        (Some(a), Some(b)) => match (a.substitute_group_id, b.substitute_group_id) {
            (Some(ga), Some(gb)) => ga == gb,
            _ => false,
        },
        _ => false,
    }
}

/// Match replacement shares to disallowed losses, share for share, earliest
/// buy first. Matched shares push their deferred loss into the replacement
/// lot's basis.
///
/// A replacement buy dated after `observation` (the rebuild's as-of date)
/// but still inside the window is recorded FLAGGED: the match is surfaced,
/// no basis moves until a later rebuild observes the buy. The same applies
/// to a buy without a tracked lot. Each replacement share absorbs at most
/// one loss share across all loss sales, so the sum of APPLIED basis
/// increases equals the sum of APPLIED deferred losses.
pub(crate) fn match_wash_sales(
    transactions: &[Transaction],
    securities_by_ticker: &HashMap<String, Security>,
    loss_sales: &[LossSale],
    consumed_sources: &HashMap<i64, HashSet<i64>>,
    observation: NaiveDate,
    outcome: &mut ReplayOutcome,
) {
    let mut matched_by_buy: HashMap<i64, Decimal> = HashMap::new();

    for sale in loss_sales {
        let window_start = sale.sale_date - Duration::days(WASH_WINDOW_DAYS);
        let window_end = sale.sale_date + Duration::days(WASH_WINDOW_DAYS);
        let excluded = consumed_sources.get(&sale.sell_txn_id);

        let mut candidates: Vec<&Transaction> = transactions
            .iter()
            .filter(|tx| tx.txn_type == TxnType::Buy)
            .filter(|tx| tx.date >= window_start && tx.date <= window_end)
            .filter(|tx| excluded.map_or(true, |set| !set.contains(&tx.id)))
            .filter(|tx| {
                tx.ticker
                    .as_deref()
                    .map_or(false, |t| substantially_identical(&sale.ticker, t, securities_by_ticker))
            })
            .collect();
        candidates.sort_by_key(|tx| (tx.date, tx.id));

        let mut slices: Vec<LossSlice> = sale.slices.clone();
        for buy in candidates {
            if slices.is_empty() {
                break;
            }
            let buy_qty = match buy.qty {
                Some(q) if q > Decimal::ZERO => q,
                _ => continue,
            };
            let already = matched_by_buy.get(&buy.id).copied().unwrap_or(Decimal::ZERO);
            let mut available = buy_qty - already;
            if available <= Decimal::ZERO {
                continue;
            }

            let mut deferred = Decimal::ZERO;
            let mut matched_here = Decimal::ZERO;
            while available > Decimal::ZERO && !slices.is_empty() {
                let take = available.min(slices[0].qty);
                deferred += take * slices[0].per_share_loss;
                matched_here += take;
                available -= take;
                slices[0].qty -= take;
                if slices[0].qty <= Decimal::ZERO {
                    slices.remove(0);
                }
            }
            if matched_here <= Decimal::ZERO {
                continue;
            }
            *matched_by_buy.entry(buy.id).or_insert(Decimal::ZERO) += matched_here;

            let replacement_lot_index = outcome
                .lots
                .iter()
                .position(|lot| lot.created_from_txn_id == Some(buy.id));
            if buy.date > observation {
                // Known future trade inside the window: informational only.
                outcome.wash.push(WashDraft {
                    loss_sale_txn_id: sale.sell_txn_id,
                    replacement_buy_txn_id: Some(buy.id),
                    replacement_lot_index,
                    deferred_loss: deferred,
                    basis_increase: Decimal::ZERO,
                    window_start,
                    window_end,
                    status: WashStatus::Flagged,
                });
                continue;
            }
            match replacement_lot_index {
                Some(index) => {
                    outcome.lots[index].basis_open += deferred;
                    outcome.wash.push(WashDraft {
                        loss_sale_txn_id: sale.sell_txn_id,
                        replacement_buy_txn_id: Some(buy.id),
                        replacement_lot_index: Some(index),
                        deferred_loss: deferred,
                        basis_increase: deferred,
                        window_start,
                        window_end,
                        status: WashStatus::Applied,
                    });
                }
                None => {
                    // The buy exists in the stream but produced no tracked
                    // lot (unknown security or non-taxable side): surface it
                    // without touching basis.
                    outcome.wash.push(WashDraft {
                        loss_sale_txn_id: sale.sell_txn_id,
                        replacement_buy_txn_id: Some(buy.id),
                        replacement_lot_index: None,
                        deferred_loss: deferred,
                        basis_increase: Decimal::ZERO,
                        window_start,
                        window_end,
                        status: WashStatus::Flagged,
                    });
                }
            }
        }
    }
}

/// Advisory check before placing a sale at a loss: would executed or
/// proposed buys inside the window trigger a wash?
///
/// POSSIBLE is returned when matching is blocked by missing security
/// metadata rather than by a clean miss.
pub async fn wash_risk_for_loss_sale(
    store: &Store,
    taxpayer_id: i64,
    sale_ticker: &str,
    sale_date: NaiveDate,
    proposed_buys: &[ProposedBuy],
    window_days: i64,
) -> AppResult<(WashRisk, Vec<WashMatch>)> {
    let window_start = sale_date - Duration::days(window_days);
    let window_end = sale_date + Duration::days(window_days);

    let securities_by_ticker: HashMap<String, Security> = store
        .list_securities()
        .await?
        .into_iter()
        .map(|s| (s.ticker.clone(), s))
        .collect();
    let taxable_accounts: HashSet<i64> = store
        .list_accounts()
        .await?
        .into_iter()
        .filter(|a| a.taxpayer_id == taxpayer_id && a.account_type == AccountType::Taxable)
        .map(|a| a.id)
        .collect();

    let mut matches: Vec<WashMatch> = Vec::new();
    let mut possible_due_to_unknown = false;

    // None means the comparison was blocked by missing security metadata.
    let identical = |other: &str| -> Option<bool> {
        if sale_ticker == other {
            return Some(true);
        }
        match (
            securities_by_ticker.get(sale_ticker),
            securities_by_ticker.get(other),
        ) {
            (Some(a), Some(b)) => Some(
                matches!((a.substitute_group_id, b.substitute_group_id), (Some(ga), Some(gb)) if ga == gb),
            ),
            _ => None,
        }
    };

    let executed = store.transactions_in_range(window_start, window_end).await?;
    for tx in executed {
        if tx.txn_type != TxnType::Buy || !taxable_accounts.contains(&tx.account_id) {
            continue;
        }
        let ticker = match tx.ticker.as_deref() {
            Some(t) => t,
            None => {
                possible_due_to_unknown = true;
                continue;
            }
        };
        match identical(ticker) {
            Some(true) => matches.push(WashMatch {
                kind: WashMatchKind::ExecutedBuy,
                date: tx.date,
                ticker: ticker.to_string(),
                account_id: Some(tx.account_id),
            }),
            Some(false) => {}
            None => possible_due_to_unknown = true,
        }
    }

    for proposed in proposed_buys {
        let ticker = match proposed.ticker.as_deref() {
            Some(t) => t,
            None => {
                possible_due_to_unknown = true;
                continue;
            }
        };
        match identical(ticker) {
            Some(true) => matches.push(WashMatch {
                kind: WashMatchKind::ProposedBuy,
                date: proposed.date.unwrap_or(sale_date),
                ticker: ticker.to_string(),
                account_id: proposed.account_id,
            }),
            Some(false) => {}
            None => possible_due_to_unknown = true,
        }
    }

    let risk = if !matches.is_empty() {
        WashRisk::Definite
    } else if possible_due_to_unknown {
        WashRisk::Possible
    } else {
        WashRisk::None
    };
    Ok((risk, matches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_db, initialize_schema};
    use crate::store::{database as db_ops, NewTransaction, TaxpayerType, TxnLinks};
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    async fn store_with_account() -> (Store, i64, i64) {
        let pool = create_memory_db().await.unwrap();
        initialize_schema(&pool).await.unwrap();
        let store = Store::new(pool);
        let tp = store.insert_taxpayer("Trust", TaxpayerType::Trust).await.unwrap();
        let acct = store
            .insert_account("A1", "IB", AccountType::Taxable, tp)
            .await
            .unwrap();
        (store, tp, acct)
    }

    #[tokio::test]
    async fn definite_when_executed_buy_in_window() {
        let (store, tp, acct) = store_with_account().await;
        store
            .upsert_security("AAPL", "Apple", "EQUITY", 0.0, None)
            .await
            .unwrap();
        db_ops::insert_transaction(
            store.pool(),
            &NewTransaction {
                account_id: acct,
                date: d(2025, 2, 10),
                txn_type: TxnType::Buy,
                ticker: Some("AAPL".to_string()),
                qty: Some(dec!(5)),
                amount: dec!(-500),
                links: TxnLinks::default(),
            },
        )
        .await
        .unwrap();

        let (risk, matches) =
            wash_risk_for_loss_sale(&store, tp, "AAPL", d(2025, 2, 1), &[], 30)
                .await
                .unwrap();
        assert_eq!(risk, WashRisk::Definite);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].kind, WashMatchKind::ExecutedBuy);
    }

    #[tokio::test]
    async fn possible_when_security_metadata_missing() {
        let (store, tp, acct) = store_with_account().await;
        // Buy of an unregistered ticker in the window.
        db_ops::insert_transaction(
            store.pool(),
            &NewTransaction {
                account_id: acct,
                date: d(2025, 2, 10),
                txn_type: TxnType::Buy,
                ticker: Some("MYSTERY".to_string()),
                qty: Some(dec!(5)),
                amount: dec!(-500),
                links: TxnLinks::default(),
            },
        )
        .await
        .unwrap();

        let (risk, matches) =
            wash_risk_for_loss_sale(&store, tp, "AAPL", d(2025, 2, 1), &[], 30)
                .await
                .unwrap();
        assert_eq!(risk, WashRisk::Possible);
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn none_when_window_is_clean() {
        let (store, tp, acct) = store_with_account().await;
        store
            .upsert_security("AAPL", "Apple", "EQUITY", 0.0, None)
            .await
            .unwrap();
        store
            .upsert_security("MSFT", "Microsoft", "EQUITY", 0.0, None)
            .await
            .unwrap();
        db_ops::insert_transaction(
            store.pool(),
            &NewTransaction {
                account_id: acct,
                date: d(2025, 2, 10),
                txn_type: TxnType::Buy,
                ticker: Some("MSFT".to_string()),
                qty: Some(dec!(5)),
                amount: dec!(-500),
                links: TxnLinks::default(),
            },
        )
        .await
        .unwrap();

        let (risk, matches) =
            wash_risk_for_loss_sale(&store, tp, "AAPL", d(2025, 2, 1), &[], 30)
                .await
                .unwrap();
        assert_eq!(risk, WashRisk::None);
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn proposed_substitute_group_buy_is_definite() {
        let (store, tp, _acct) = store_with_account().await;
        let group = store.insert_substitute_group("sp500", None).await.unwrap();
        store
            .upsert_security("VOO", "Vanguard S&P", "ETF", 0.0003, Some(group))
            .await
            .unwrap();
        store
            .upsert_security("SPY", "SPDR S&P", "ETF", 0.0009, Some(group))
            .await
            .unwrap();

        let proposed = vec![ProposedBuy {
            ticker: Some("SPY".to_string()),
            date: Some(d(2025, 2, 20)),
            account_id: None,
        }];
        let (risk, matches) =
            wash_risk_for_loss_sale(&store, tp, "VOO", d(2025, 2, 1), &proposed, 30)
                .await
                .unwrap();
        assert_eq!(risk, WashRisk::Definite);
        assert_eq!(matches[0].kind, WashMatchKind::ProposedBuy);
    }
}
