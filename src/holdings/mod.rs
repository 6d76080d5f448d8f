use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AppResult;
use crate::ingest::classify::{is_internal_transfer_like, looks_like_withholding};
use crate::preference::{account_ids_for_scope, preferred_connection_ids_for_scope, DashboardScope};
use crate::prices::PriceStore;
use crate::store::{Store, Transaction, TxnType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub account_id: i64,
    pub account_name: String,
    pub ticker: String,
    pub qty: Decimal,
    pub market_value: Option<Decimal>,
    pub cost_basis_total: Option<Decimal>,
    pub price_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashRow {
    pub account_id: i64,
    pub account_name: String,
    pub amount: Decimal,
    pub as_of_date: NaiveDate,
}

/// Calendar-year-to-date cashflow rollup. Withholding contributes as an
/// outflow magnitude.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CashflowSummary {
    pub deposits: Decimal,
    pub withdrawals: Decimal,
    pub dividends_interest: Decimal,
    pub withholding: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingsView {
    pub scope: DashboardScope,
    pub as_of: NaiveDate,
    pub positions: Vec<PositionRow>,
    pub cash: Vec<CashRow>,
    pub total_market_value: Decimal,
    pub total_cash: Decimal,
    pub ytd_cashflows: CashflowSummary,
    pub warnings: Vec<String>,
}

fn provider_flow_key(tx: &Transaction) -> Option<(String, String)> {
    match (
        tx.links.provider_account_id.as_deref(),
        tx.links.provider_txn_id.as_deref(),
    ) {
        (Some(account), Some(txn)) => Some((account.to_string(), txn.to_string())),
        _ => None,
    }
}

/// Aggregate positions, cash and YTD cashflows for display.
///
/// Positions come from each preferred connection's latest snapshot that
/// carries real position items (`is_total` rows feed valuation only and are
/// never counted as positions). Cashflows honor the connection preference
/// and collapse duplicate provider rows that linger while two connectors
/// still hold the same economic event.
pub async fn build_holdings_view(
    store: &Store,
    prices: Option<&dyn PriceStore>,
    scope: DashboardScope,
    account_filter: Option<i64>,
    today: NaiveDate,
) -> AppResult<HoldingsView> {
    let taxpayers = store.list_taxpayers().await?;
    let accounts = store.list_accounts().await?;
    let connections = store.list_connections().await?;

    let scope_account_ids: HashSet<i64> = account_ids_for_scope(scope, &taxpayers, &accounts, false)
        .into_iter()
        .filter(|id| account_filter.map_or(true, |only| *id == only))
        .collect();
    let account_names: HashMap<i64, String> =
        accounts.iter().map(|a| (a.id, a.name.clone())).collect();
    let preferred = preferred_connection_ids_for_scope(scope, &taxpayers, &connections);

    let mut warnings: Vec<String> = Vec::new();

    // Positions: latest snapshot with real items, per preferred connection.
    let mut qty_by_position: BTreeMap<(i64, String), (Decimal, Option<Decimal>, Option<Decimal>)> =
        BTreeMap::new();
    for connection_id in &preferred {
        let snapshot = store.latest_position_snapshot(*connection_id, None).await?;
        let snapshot = match snapshot {
            Some(s) => s,
            None => continue,
        };
        let provider_to_account: HashMap<String, i64> = store
            .account_maps_for_connection(*connection_id)
            .await?
            .into_iter()
            .map(|m| (m.provider_account_id, m.account_id))
            .collect();
        for item in snapshot.payload.items.iter().filter(|i| !i.is_total) {
            let (symbol, qty) = match (item.symbol.clone(), item.qty) {
                (Some(s), Some(q)) if q != Decimal::ZERO => (s, q),
                _ => continue,
            };
            let account_id = match provider_to_account.get(&item.provider_account_id) {
                Some(id) if scope_account_ids.contains(id) => *id,
                Some(_) => continue,
                None => {
                    warnings.push(format!(
                        "position for unmapped provider account {}",
                        item.provider_account_id
                    ));
                    continue;
                }
            };
            let entry = qty_by_position
                .entry((account_id, symbol))
                .or_insert((Decimal::ZERO, None, None));
            entry.0 += qty;
            if let Some(mv) = item.market_value {
                entry.1 = Some(entry.1.unwrap_or(Decimal::ZERO) + mv);
            }
            if let Some(basis) = item.cost_basis_total {
                entry.2 = Some(entry.2.unwrap_or(Decimal::ZERO) + basis);
            }
        }
    }

    let mut positions: Vec<PositionRow> = Vec::new();
    let mut total_market_value = Decimal::ZERO;
    let mut missing_prices: HashSet<String> = HashSet::new();
    for ((account_id, ticker), (qty, snapshot_mv, basis)) in qty_by_position {
        let mut market_value = None;
        let mut price_date = None;
        if let Some(prices) = prices {
            if let Some(quote) = prices.latest_price(&ticker, today).await? {
                market_value = Some(quote.price * qty);
                price_date = Some(quote.date);
            }
        }
        if market_value.is_none() {
            // End-of-day price unavailable: fall back to the snapshot's own
            // valuation.
            market_value = snapshot_mv;
            if missing_prices.insert(ticker.clone()) {
                warnings.push(format!("no cached price for {ticker}; using snapshot value"));
            }
        }
        if let Some(mv) = market_value {
            total_market_value += mv;
        }
        positions.push(PositionRow {
            account_id,
            account_name: account_names.get(&account_id).cloned().unwrap_or_default(),
            ticker,
            qty,
            market_value,
            cost_basis_total: basis,
            price_date,
        });
    }

    // Cash: latest balance per account in scope.
    let mut cash: Vec<CashRow> = Vec::new();
    let mut total_cash = Decimal::ZERO;
    for balance in store.latest_cash_balances().await? {
        if !scope_account_ids.contains(&balance.account_id) {
            continue;
        }
        total_cash += balance.amount;
        cash.push(CashRow {
            account_id: balance.account_id,
            account_name: account_names
                .get(&balance.account_id)
                .cloned()
                .unwrap_or_default(),
            amount: balance.amount,
            as_of_date: balance.as_of_date,
        });
    }
    cash.sort_by_key(|c| c.account_id);

    // YTD cashflows over the preferred connections, deduped by provider
    // identity within the set.
    let mut preferred_txn_ids: HashSet<i64> = HashSet::new();
    for connection_id in &preferred {
        for map in store.transaction_maps_for_connection(*connection_id).await? {
            preferred_txn_ids.insert(map.transaction_id);
        }
    }
    let year_start = NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today);
    let mut ytd = CashflowSummary::default();
    let mut seen_flows: HashSet<(String, String)> = HashSet::new();
    for tx in store.transactions_in_range(year_start, today).await? {
        if !preferred_txn_ids.contains(&tx.id) || !scope_account_ids.contains(&tx.account_id) {
            continue;
        }
        if let Some(key) = provider_flow_key(&tx) {
            if !seen_flows.insert(key) {
                continue;
            }
        }
        let text = tx.links.text();
        match tx.txn_type {
            TxnType::Transfer => {
                if is_internal_transfer_like(&text) {
                    continue;
                }
                if tx.amount > Decimal::ZERO {
                    ytd.deposits += tx.amount;
                } else {
                    ytd.withdrawals += tx.amount.abs();
                }
            }
            TxnType::Div | TxnType::Int => {
                if tx.amount < Decimal::ZERO && looks_like_withholding(&text) {
                    ytd.withholding += tx.amount.abs();
                } else {
                    ytd.dividends_interest += tx.amount;
                }
            }
            TxnType::Withholding => ytd.withholding += tx.amount.abs(),
            _ => {}
        }
    }

    debug!(
        ?scope,
        positions = positions.len(),
        mv = %total_market_value,
        "holdings view built"
    );

    Ok(HoldingsView {
        scope,
        as_of: today,
        positions,
        cash,
        total_market_value,
        total_cash,
        ytd_cashflows: ytd,
        warnings,
    })
}
