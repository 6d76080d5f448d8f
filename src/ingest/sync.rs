use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::{Sqlite, Transaction as DbTransaction};
use tracing::{info, warn};

use super::classify::{classify, normalize_signs, synthesize_provider_txn_id};
use super::connector::{AdapterError, ConnectorAdapter};
use super::derive::derive_forward_snapshot;
use super::types::{SyncParams, TransactionsUnit};
use crate::config::EngineConfig;
use crate::errors::AppResult;
use crate::store::{
    self, BrokerLotClosure, BrokerSymbolSummary, ConnectionStatus, NewTransaction, Store, SyncMode,
    SyncRun, SyncStatus, TxnLinks, TxnType,
};

const MAX_FETCH_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 100;
const DEFAULT_FULL_SYNC_START: (i32, u32, u32) = (2015, 1, 1);

#[derive(Default)]
struct RunCounters {
    pages_fetched: i64,
    txn_count: i64,
    new_count: i64,
    dupes_count: i64,
    parse_fail_count: i64,
    missing_symbol_count: i64,
    file_count: i64,
    skipped_files: i64,
    closures_imported: i64,
    symbol_summaries_imported: i64,
    holdings_items_imported: i64,
    cash_balances_imported: i64,
    txn_type_counts: HashMap<&'static str, i64>,
    warnings: Vec<String>,
    earliest_seen: Option<NaiveDate>,
    latest_seen: Option<NaiveDate>,
}

impl RunCounters {
    fn coverage(&self, resume_cursor: Option<&str>) -> serde_json::Value {
        json!({
            "file_count": self.file_count,
            "skipped_files": self.skipped_files,
            "new_inserted": self.new_count,
            "txn_count": self.txn_count,
            "txn_type_counts": self.txn_type_counts,
            "closures_imported": self.closures_imported,
            "symbol_summaries_imported": self.symbol_summaries_imported,
            "holdings_items_imported": self.holdings_items_imported,
            "cash_balances_imported": self.cash_balances_imported,
            "warnings": self.warnings,
            "resume_cursor": resume_cursor,
        })
    }
}

async fn with_retries<T, F, Fut>(mut op: F) -> Result<T, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let retry_after = match &err {
                    AdapterError::RateLimited { retry_after_secs } => {
                        retry_after_secs.map(Duration::from_secs)
                    }
                    AdapterError::Transient(_) => None,
                    _ => return Err(err),
                };
                if attempt >= MAX_FETCH_ATTEMPTS {
                    return Err(err);
                }
                let backoff = retry_after
                    .unwrap_or_else(|| Duration::from_millis(RETRY_BASE_MS << attempt));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// One sync run: enumerate payload units, classify and upsert rows, import
/// holdings, derive forward-rolled positions. All canonical writes happen in
/// a single transaction per completed batch; a failed run leaves the prior
/// state untouched and is recorded as an ERROR SyncRun row.
pub async fn run_sync(
    store: &Store,
    config: &EngineConfig,
    adapter: &dyn ConnectorAdapter,
    params: SyncParams,
) -> AppResult<SyncRun> {
    let started_at = Utc::now();
    let connection = match store.get_connection(params.connection_id).await? {
        Some(c) => c,
        None => {
            return Err(crate::errors::AppError::NotFound(format!(
                "connection {}",
                params.connection_id
            )))
        }
    };

    let mut run = SyncRun {
        id: 0,
        connection_id: connection.id,
        started_at,
        finished_at: None,
        status: SyncStatus::Error,
        mode: params.mode,
        actor: params.actor.clone(),
        requested_start: params.start,
        requested_end: params.end,
        effective_start: None,
        effective_end: None,
        pages_fetched: 0,
        txn_count: 0,
        new_count: 0,
        dupes_count: 0,
        parse_fail_count: 0,
        missing_symbol_count: 0,
        error: None,
        coverage: json!({}),
    };

    if connection.status == ConnectionStatus::Disabled {
        run.error = Some("connection disabled".to_string());
        run.finished_at = Some(Utc::now());
        run.id = store.insert_sync_run(&run).await?;
        return Ok(run);
    }

    let end = params.end.unwrap_or_else(|| Utc::now().date_naive());
    let start = params.start.unwrap_or_else(|| match params.mode {
        SyncMode::Full => {
            let (y, m, d) = DEFAULT_FULL_SYNC_START;
            NaiveDate::from_ymd_opt(y, m, d).unwrap_or(end)
        }
        SyncMode::Incremental => connection
            .last_successful_txn_end
            .map(|d| d - chrono::Duration::days(config.incremental_overlap_days))
            .unwrap_or_else(|| {
                let (y, m, d) = DEFAULT_FULL_SYNC_START;
                NaiveDate::from_ymd_opt(y, m, d).unwrap_or(end)
            }),
    });
    run.effective_start = Some(start);
    run.effective_end = Some(end);

    let account_map: HashMap<String, i64> = store
        .account_maps_for_connection(connection.id)
        .await?
        .into_iter()
        .map(|m| (m.provider_account_id, m.account_id))
        .collect();

    let mut counters = RunCounters::default();
    let mut tx = store.pool().begin().await?;
    let mut resume_cursor: Option<String> = None;
    let mut partial = false;

    // Transaction payload units, page by page.
    let mut cursor: Option<String> = None;
    loop {
        let fetched = with_retries(|| {
            adapter.fetch_transactions(start, end, cursor.as_deref())
        })
        .await;
        let batch = match fetched {
            Ok(batch) => batch,
            Err(err @ (AdapterError::Unauthorized | AdapterError::Fatal(_))) => {
                tx.rollback().await?;
                run.error = Some(err.to_string());
                run.finished_at = Some(Utc::now());
                run.coverage = counters.coverage(None);
                run.id = store.insert_sync_run(&run).await?;
                store
                    .set_connection_status(connection.id, ConnectionStatus::Error, run.error.as_deref())
                    .await?;
                return Ok(run);
            }
            Err(err) => {
                // Retry budget exhausted on a transient failure: keep what
                // completed, mark the run PARTIAL and remember the cursor.
                warn!(connection = connection.id, error = %err, "transient fetch failure, partial run");
                counters.warnings.push(err.to_string());
                resume_cursor = cursor.clone();
                partial = true;
                break;
            }
        };
        counters.pages_fetched += 1;

        for unit in &batch.units {
            process_transactions_unit(
                &mut tx,
                &connection.id,
                unit,
                &account_map,
                params.reprocess,
                &mut counters,
            )
            .await?;
        }

        match batch.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    // Holdings snapshots and cash.
    if !partial {
        match with_retries(|| adapter.fetch_holdings()).await {
            Ok(units) => {
                for unit in &units {
                    counters.parse_fail_count += unit.parse_failures as i64;
                    let already =
                        store::file_hash_ingested(&mut *tx, connection.id, &unit.unit_hash).await?;
                    if already && !params.reprocess {
                        counters.skipped_files += 1;
                        continue;
                    }
                    let payload = crate::store::HoldingsPayload {
                        items: unit.items.clone(),
                        cash: None,
                    };
                    store::insert_holding_snapshot(&mut *tx, connection.id, unit.as_of, false, &payload)
                        .await?;
                    counters.holdings_items_imported +=
                        unit.items.iter().filter(|i| !i.is_total).count() as i64;
                    for (provider_account_id, as_of_date, amount) in &unit.cash {
                        match account_map.get(provider_account_id) {
                            Some(account_id) => {
                                store::upsert_cash_balance(&mut *tx, *account_id, *as_of_date, *amount)
                                    .await?;
                                counters.cash_balances_imported += 1;
                            }
                            None => counters
                                .warnings
                                .push(format!("cash row for unmapped account {provider_account_id}")),
                        }
                    }
                    store::record_file_ingest(
                        &mut *tx,
                        connection.id,
                        "HOLDINGS",
                        &unit.unit_name,
                        &unit.unit_hash,
                        None,
                        None,
                        None,
                    )
                    .await?;
                    counters.file_count += 1;
                }
            }
            Err(err @ (AdapterError::Unauthorized | AdapterError::Fatal(_))) => {
                tx.rollback().await?;
                run.error = Some(err.to_string());
                run.finished_at = Some(Utc::now());
                run.coverage = counters.coverage(None);
                run.id = store.insert_sync_run(&run).await?;
                return Ok(run);
            }
            Err(err) => {
                counters.warnings.push(format!("holdings fetch: {err}"));
                partial = true;
            }
        }
    }

    // Forward-roll positions to the sync end date so quarterly position
    // feeds still yield current holdings.
    if let Err(err) = derive_forward_snapshot(&mut tx, connection.id, &account_map, end).await {
        counters.warnings.push(format!("derive holdings: {err}"));
    }

    tx.commit().await?;

    run.pages_fetched = counters.pages_fetched;
    run.txn_count = counters.txn_count;
    run.new_count = counters.new_count;
    run.dupes_count = counters.dupes_count;
    run.parse_fail_count = counters.parse_fail_count;
    run.missing_symbol_count = counters.missing_symbol_count;
    run.status = if partial {
        SyncStatus::Partial
    } else {
        SyncStatus::Success
    };
    run.finished_at = Some(Utc::now());
    run.coverage = counters.coverage(resume_cursor.as_deref());
    run.id = store.insert_sync_run(&run).await?;

    if run.status == SyncStatus::Success {
        store
            .update_connection_after_sync(
                connection.id,
                counters.latest_seen.or(Some(end)),
                counters.earliest_seen,
                params.mode == SyncMode::Full,
            )
            .await?;
    }

    info!(
        connection = connection.id,
        status = run.status.as_str(),
        new = run.new_count,
        dupes = run.dupes_count,
        "sync finished"
    );
    Ok(run)
}

async fn process_transactions_unit(
    tx: &mut DbTransaction<'_, Sqlite>,
    connection_id: &i64,
    unit: &TransactionsUnit,
    account_map: &HashMap<String, i64>,
    reprocess: bool,
    counters: &mut RunCounters,
) -> AppResult<()> {
    let connection_id = *connection_id;
    counters.parse_fail_count += unit.parse_failures as i64;

    let already = store::file_hash_ingested(&mut **tx, connection_id, &unit.unit_hash).await?;
    if already && !reprocess {
        counters.skipped_files += 1;
        return Ok(());
    }
    counters.file_count += 1;

    for raw in &unit.rows {
        let (date, amount) = match (raw.date, raw.amount) {
            (Some(d), Some(a)) => (d, a),
            _ => {
                counters.parse_fail_count += 1;
                continue;
            }
        };
        let account_id = match account_map.get(&raw.provider_account_id) {
            Some(id) => *id,
            None => {
                counters
                    .warnings
                    .push(format!("row for unmapped account {}", raw.provider_account_id));
                counters.parse_fail_count += 1;
                continue;
            }
        };

        let txn_type = classify(raw);
        let (amount, qty) = normalize_signs(txn_type, amount, raw.qty);

        // Sign/direction invariant: a trade without a usable share count is
        // rejected, not repaired.
        if matches!(txn_type, TxnType::Buy | TxnType::Sell)
            && qty.map_or(true, |q| q <= Decimal::ZERO)
        {
            counters
                .warnings
                .push(format!("rejected {} without qty on {}", txn_type.as_str(), date));
            counters.parse_fail_count += 1;
            continue;
        }
        if raw.symbol.is_none() && matches!(txn_type, TxnType::Buy | TxnType::Sell) {
            counters.missing_symbol_count += 1;
        }

        let description = raw.description.clone().unwrap_or_default();
        let provider_txn_id = raw.provider_txn_id.clone().unwrap_or_else(|| {
            synthesize_provider_txn_id(
                &raw.provider_account_id,
                date,
                txn_type,
                amount,
                &description,
            )
        });

        let links = TxnLinks {
            provider_txn_id: Some(provider_txn_id.clone()),
            provider_account_id: Some(raw.provider_account_id.clone()),
            description: raw.description.clone(),
            additional_detail: raw.additional_detail.clone(),
            raw_type: raw.raw_type.clone(),
            source: Some(unit.unit_name.clone()),
            ..Default::default()
        };

        counters.txn_count += 1;
        counters.earliest_seen = Some(counters.earliest_seen.map_or(date, |d| d.min(date)));
        counters.latest_seen = Some(counters.latest_seen.map_or(date, |d| d.max(date)));

        let existing =
            store::transaction_id_for_provider(&mut **tx, connection_id, &provider_txn_id).await?;
        match existing {
            None => {
                let txn_id = store::insert_transaction(
                    &mut **tx,
                    &NewTransaction {
                        account_id,
                        date,
                        txn_type,
                        ticker: raw.symbol.clone(),
                        qty,
                        amount,
                        links: links.clone(),
                    },
                )
                .await?;
                store::insert_transaction_map(&mut **tx, connection_id, &provider_txn_id, txn_id)
                    .await?;
                counters.new_count += 1;
                *counters.txn_type_counts.entry(txn_type.as_str()).or_insert(0) += 1;
            }
            Some(txn_id) => {
                counters.dupes_count += 1;
                let current = store::get_transaction(&mut **tx, txn_id).await?;
                let current = match current {
                    Some(c) => c,
                    None => continue,
                };
                if reprocess {
                    store::update_transaction_classification(
                        &mut **tx,
                        txn_id,
                        txn_type,
                        amount,
                        qty,
                        raw.symbol.as_deref().or(current.ticker.as_deref()),
                        &links,
                    )
                    .await?;
                } else if !current.txn_type.is_specific() && txn_type.is_specific() {
                    // Upgrade OTHER to the more specific classification; a
                    // specific type never degrades and signs never flip
                    // outside an explicit reprocess.
                    store::update_transaction_classification(
                        &mut **tx,
                        txn_id,
                        txn_type,
                        amount,
                        qty.or(current.qty),
                        raw.symbol.as_deref().or(current.ticker.as_deref()),
                        &links,
                    )
                    .await?;
                }
            }
        }
    }

    for closure in &unit.closures {
        store::insert_broker_lot_closure(
            &mut **tx,
            &BrokerLotClosure {
                id: 0,
                connection_id,
                provider_account_id: closure.provider_account_id.clone(),
                symbol: closure.symbol.clone(),
                trade_date: closure.trade_date,
                open_date_raw: closure.open_date_raw.clone(),
                quantity_closed: closure.quantity_closed,
                cost_basis: closure.cost_basis,
                realized_pl: closure.realized_pl,
                proceeds: closure.proceeds,
                trade_id: closure.trade_id.clone(),
                source_file_hash: unit.unit_hash.clone(),
            },
        )
        .await?;
        counters.closures_imported += 1;
    }

    for (row_idx, summary) in unit.symbol_summaries.iter().enumerate() {
        store::insert_broker_symbol_summary(
            &mut **tx,
            &BrokerSymbolSummary {
                id: 0,
                connection_id,
                provider_account_id: summary.provider_account_id.clone(),
                symbol: summary.symbol.clone(),
                as_of_date: summary.as_of_date,
                quantity: summary.quantity,
                cost_basis: summary.cost_basis,
                proceeds: summary.proceeds,
                realized_pl: summary.realized_pl,
                source_file_hash: unit.unit_hash.clone(),
                source_row: row_idx as i64,
            },
        )
        .await?;
        counters.symbol_summaries_imported += 1;
    }

    store::record_file_ingest(
        &mut **tx,
        connection_id,
        "TRANSACTIONS",
        &unit.unit_name,
        &unit.unit_hash,
        None,
        unit.start_hint,
        unit.end_hint,
    )
    .await?;
    Ok(())
}
