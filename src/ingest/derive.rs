use std::collections::HashMap;

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, Sqlite, Transaction as DbTransaction};
use tracing::debug;

use crate::errors::AppResult;
use crate::store::{self, HoldingItem, HoldingsPayload, TxnType};

/// Forward-roll the connection's last known positions to `target` by
/// applying the canonical BUY/SELL/TRANSFER rows since the snapshot date.
///
/// A connector that reports positions only quarterly still yields current
/// holdings this way. Double counting is impossible here: rows come off the
/// per-connection provider-identity map, so one economic event is one
/// canonical row even after a reclassification.
pub async fn derive_forward_snapshot(
    tx: &mut DbTransaction<'_, Sqlite>,
    connection_id: i64,
    account_map: &HashMap<String, i64>,
    target: NaiveDate,
) -> AppResult<()> {
    let base_row = sqlx::query(
        r#"
        SELECT * FROM external_holding_snapshots
        WHERE connection_id = ?1
        ORDER BY as_of DESC, id DESC LIMIT 1
        "#,
    )
    .bind(connection_id)
    .fetch_optional(&mut **tx)
    .await?;
    let base_row = match base_row {
        Some(row) => row,
        None => return Ok(()),
    };
    let base_as_of: chrono::DateTime<Utc> = base_row.try_get("as_of")?;
    let payload_raw: String = base_row.try_get("payload")?;
    let payload: HoldingsPayload = serde_json::from_str(&payload_raw)
        .map_err(crate::errors::AppError::Serialization)?;

    let base_date = base_as_of.date_naive();
    if base_date >= target {
        return Ok(());
    }

    let rows = sqlx::query(
        r#"
        SELECT t.* FROM transactions t
        JOIN external_transaction_map m ON m.transaction_id = t.id
        WHERE m.connection_id = ?1 AND t.date > ?2 AND t.date <= ?3
          AND t.type IN ('BUY', 'SELL', 'TRANSFER')
        ORDER BY t.date ASC, t.id ASC
        "#,
    )
    .bind(connection_id)
    .bind(base_date)
    .bind(target)
    .fetch_all(&mut **tx)
    .await?;
    if rows.is_empty() {
        return Ok(());
    }

    let mut qty_by_key: HashMap<(String, String), Decimal> = HashMap::new();
    for item in payload.items.iter().filter(|i| !i.is_total) {
        if let (Some(symbol), Some(qty)) = (item.symbol.clone(), item.qty) {
            *qty_by_key
                .entry((item.provider_account_id.clone(), symbol))
                .or_insert(Decimal::ZERO) += qty;
        }
    }

    let mut cash_delta_by_account: HashMap<String, Decimal> = HashMap::new();
    for row in &rows {
        let txn = store::map_transaction(row)?;
        let provider_account = txn
            .links
            .provider_account_id
            .clone()
            .unwrap_or_default();
        *cash_delta_by_account
            .entry(provider_account.clone())
            .or_insert(Decimal::ZERO) += txn.amount;
        if let (Some(ticker), Some(qty)) = (txn.ticker.clone(), txn.qty) {
            let entry = qty_by_key
                .entry((provider_account, ticker))
                .or_insert(Decimal::ZERO);
            match txn.txn_type {
                TxnType::Buy => *entry += qty,
                TxnType::Sell => *entry -= qty,
                _ => {}
            }
        }
    }

    // Rebuild the item list: adjusted quantities, stale market values (the
    // holdings view re-prices), totals carried through untouched.
    let mut items: Vec<HoldingItem> = Vec::new();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
    for item in &payload.items {
        if item.is_total {
            items.push(item.clone());
            continue;
        }
        let symbol = match item.symbol.clone() {
            Some(s) => s,
            None => {
                items.push(item.clone());
                continue;
            }
        };
        let key = (item.provider_account_id.clone(), symbol);
        let qty = qty_by_key.get(&key).copied().unwrap_or(Decimal::ZERO);
        seen.insert(key);
        if qty == Decimal::ZERO {
            continue;
        }
        let mut updated = item.clone();
        updated.qty = Some(qty);
        items.push(updated);
    }
    for ((provider_account_id, symbol), qty) in &qty_by_key {
        let key = (provider_account_id.clone(), symbol.clone());
        if *qty == Decimal::ZERO || seen.contains(&key) {
            continue;
        }
        items.push(HoldingItem {
            provider_account_id: provider_account_id.clone(),
            symbol: Some(symbol.clone()),
            qty: Some(*qty),
            market_value: None,
            cost_basis_total: None,
            is_total: false,
        });
    }

    let as_of = Utc.from_utc_datetime(&target.and_hms_opt(0, 0, 0).unwrap_or_default());
    store::insert_holding_snapshot(
        &mut **tx,
        connection_id,
        as_of,
        true,
        &HoldingsPayload { items, cash: None },
    )
    .await?;

    // Roll cash forward too: last known balance plus the window's net flows.
    for (provider_account_id, delta) in &cash_delta_by_account {
        let account_id = match account_map.get(provider_account_id) {
            Some(id) => *id,
            None => continue,
        };
        let latest = sqlx::query(
            r#"
            SELECT amount FROM cash_balances
            WHERE account_id = ?1 AND as_of_date <= ?2
            ORDER BY as_of_date DESC LIMIT 1
            "#,
        )
        .bind(account_id)
        .bind(base_date)
        .fetch_optional(&mut **tx)
        .await?;
        let base_cash = match latest {
            Some(row) => store::database::parse_dec(&row.try_get::<String, _>("amount")?)?,
            None => Decimal::ZERO,
        };
        store::upsert_cash_balance(&mut **tx, account_id, target, base_cash + *delta).await?;
    }

    debug!(connection = connection_id, %target, "derived forward-rolled snapshot");
    Ok(())
}
