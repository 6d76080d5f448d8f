use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool};

use super::types::*;
use crate::errors::AppResult;

pub(crate) fn parse_dec(s: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str(s).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_opt_dec(s: Option<String>) -> Result<Option<Decimal>, sqlx::Error> {
    s.map(|v| parse_dec(&v)).transpose()
}

fn parse_json(s: &str) -> Result<serde_json::Value, sqlx::Error> {
    serde_json::from_str(s).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub(crate) fn map_transaction(row: &SqliteRow) -> Result<Transaction, sqlx::Error> {
    let links_raw: String = row.try_get("links")?;
    let links: TxnLinks =
        serde_json::from_str(&links_raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(Transaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        date: row.try_get("date")?,
        txn_type: TxnType::parse(&row.try_get::<String, _>("type")?),
        ticker: row.try_get("ticker")?,
        qty: parse_opt_dec(row.try_get("qty")?)?,
        amount: parse_dec(&row.try_get::<String, _>("amount")?)?,
        links,
    })
}

fn map_income_event(row: &SqliteRow) -> Result<IncomeEvent, sqlx::Error> {
    Ok(IncomeEvent {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        date: row.try_get("date")?,
        income_type: IncomeType::parse(&row.try_get::<String, _>("type")?),
        ticker: row.try_get("ticker")?,
        amount: parse_dec(&row.try_get::<String, _>("amount")?)?,
    })
}

fn map_connection(row: &SqliteRow) -> Result<ExternalConnection, sqlx::Error> {
    Ok(ExternalConnection {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        broker: row.try_get("broker")?,
        connector: row.try_get("connector")?,
        taxpayer_id: row.try_get("taxpayer_id")?,
        status: ConnectionStatus::parse(&row.try_get::<String, _>("status")?),
        metadata: parse_json(&row.try_get::<String, _>("metadata")?)?,
        last_successful_sync_at: row.try_get("last_successful_sync_at")?,
        last_successful_txn_end: row.try_get("last_successful_txn_end")?,
        txn_earliest_available: row.try_get("txn_earliest_available")?,
        holdings_last_asof: row.try_get("holdings_last_asof")?,
        last_full_sync_at: row.try_get("last_full_sync_at")?,
        coverage_status: row.try_get("coverage_status")?,
        last_error: row.try_get("last_error")?,
    })
}

fn map_tax_lot(row: &SqliteRow) -> Result<TaxLot, sqlx::Error> {
    Ok(TaxLot {
        id: row.try_get("id")?,
        taxpayer_id: row.try_get("taxpayer_id")?,
        account_id: row.try_get("account_id")?,
        security_id: row.try_get("security_id")?,
        acquired_date: row.try_get("acquired_date")?,
        quantity_open: parse_dec(&row.try_get::<String, _>("quantity_open")?)?,
        basis_open: parse_opt_dec(row.try_get("basis_open")?)?,
        source: LotSource::parse(&row.try_get::<String, _>("source")?),
        created_from_txn_id: row.try_get("created_from_txn_id")?,
    })
}

fn map_lot_disposal(row: &SqliteRow) -> Result<LotDisposal, sqlx::Error> {
    Ok(LotDisposal {
        id: row.try_get("id")?,
        sell_txn_id: row.try_get("sell_txn_id")?,
        tax_lot_id: row.try_get("tax_lot_id")?,
        quantity_sold: parse_dec(&row.try_get::<String, _>("quantity_sold")?)?,
        proceeds_allocated: parse_dec(&row.try_get::<String, _>("proceeds_allocated")?)?,
        basis_allocated: parse_opt_dec(row.try_get("basis_allocated")?)?,
        realized_gain: parse_opt_dec(row.try_get("realized_gain")?)?,
        term: Term::parse(&row.try_get::<String, _>("term")?),
        as_of_date: row.try_get("as_of_date")?,
    })
}

fn map_wash_adjustment(row: &SqliteRow) -> Result<WashSaleAdjustment, sqlx::Error> {
    Ok(WashSaleAdjustment {
        id: row.try_get("id")?,
        loss_sale_txn_id: row.try_get("loss_sale_txn_id")?,
        replacement_buy_txn_id: row.try_get("replacement_buy_txn_id")?,
        replacement_lot_id: row.try_get("replacement_lot_id")?,
        deferred_loss: parse_dec(&row.try_get::<String, _>("deferred_loss")?)?,
        basis_increase: parse_dec(&row.try_get::<String, _>("basis_increase")?)?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        status: WashStatus::parse(&row.try_get::<String, _>("status")?),
    })
}

fn map_corporate_action(row: &SqliteRow) -> Result<CorporateActionEvent, sqlx::Error> {
    Ok(CorporateActionEvent {
        id: row.try_get("id")?,
        taxpayer_id: row.try_get("taxpayer_id")?,
        account_id: row.try_get("account_id")?,
        security_id: row.try_get("security_id")?,
        action_date: row.try_get("action_date")?,
        action_type: CorporateActionType::parse(&row.try_get::<String, _>("action_type")?),
        ratio: parse_opt_dec(row.try_get("ratio")?)?,
        applied: row.try_get("applied")?,
        apply_notes: row.try_get("apply_notes")?,
        details: parse_json(&row.try_get::<String, _>("details")?)?,
    })
}

fn map_security(row: &SqliteRow) -> Result<Security, sqlx::Error> {
    Ok(Security {
        id: row.try_get("id")?,
        ticker: row.try_get("ticker")?,
        name: row.try_get("name")?,
        asset_class: row.try_get("asset_class")?,
        expense_ratio: row.try_get("expense_ratio")?,
        substitute_group_id: row.try_get("substitute_group_id")?,
        metadata: parse_json(&row.try_get::<String, _>("metadata")?)?,
    })
}

fn map_holding_snapshot(row: &SqliteRow) -> Result<ExternalHoldingSnapshot, sqlx::Error> {
    let payload_raw: String = row.try_get("payload")?;
    let payload: HoldingsPayload =
        serde_json::from_str(&payload_raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(ExternalHoldingSnapshot {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        as_of: row.try_get("as_of")?,
        derived: row.try_get("derived")?,
        payload,
    })
}

fn map_closure(row: &SqliteRow) -> Result<BrokerLotClosure, sqlx::Error> {
    Ok(BrokerLotClosure {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        provider_account_id: row.try_get("provider_account_id")?,
        symbol: row.try_get("symbol")?,
        trade_date: row.try_get("trade_date")?,
        open_date_raw: row.try_get("open_date_raw")?,
        quantity_closed: parse_dec(&row.try_get::<String, _>("quantity_closed")?)?,
        cost_basis: parse_opt_dec(row.try_get("cost_basis")?)?,
        realized_pl: parse_opt_dec(row.try_get("realized_pl")?)?,
        proceeds: parse_opt_dec(row.try_get("proceeds")?)?,
        trade_id: row.try_get("trade_id")?,
        source_file_hash: row.try_get("source_file_hash")?,
    })
}

fn map_symbol_summary(row: &SqliteRow) -> Result<BrokerSymbolSummary, sqlx::Error> {
    Ok(BrokerSymbolSummary {
        id: row.try_get("id")?,
        connection_id: row.try_get("connection_id")?,
        provider_account_id: row.try_get("provider_account_id")?,
        symbol: row.try_get("symbol")?,
        as_of_date: row.try_get("as_of_date")?,
        quantity: parse_opt_dec(row.try_get("quantity")?)?,
        cost_basis: parse_opt_dec(row.try_get("cost_basis")?)?,
        proceeds: parse_opt_dec(row.try_get("proceeds")?)?,
        realized_pl: parse_opt_dec(row.try_get("realized_pl")?)?,
        source_file_hash: row.try_get("source_file_hash")?,
        source_row: row.try_get("source_row")?,
    })
}

fn map_tax_fact(row: &SqliteRow) -> Result<Option<TaxFact>, sqlx::Error> {
    let fact_type = match FactType::parse(&row.try_get::<String, _>("fact_type")?) {
        Some(ft) => ft,
        None => return Ok(None),
    };
    let monthly_raw: Option<String> = row.try_get("amount_monthly")?;
    let amount_monthly = monthly_raw
        .map(|s| serde_json::from_str::<Vec<f64>>(&s))
        .transpose()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(Some(TaxFact {
        id: row.try_get("id")?,
        tax_year: row.try_get("tax_year")?,
        fact_type,
        amount: parse_opt_dec(row.try_get("amount")?)?,
        amount_monthly,
        owner_entity: row.try_get("owner_entity")?,
        doc_type: row.try_get("doc_type")?,
        confirmed: row.try_get("confirmed")?,
        authoritative: row.try_get("authoritative")?,
        is_corrected: row.try_get("is_corrected")?,
    }))
}

// ---------------------------------------------------------------------------
// Write-path helpers, generic over executor so sync runs and rebuilds can
// call them inside their own transactions.
// ---------------------------------------------------------------------------

pub async fn insert_transaction<'e, E>(executor: E, t: &NewTransaction) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let links = serde_json::to_string(&t.links).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
    let res = sqlx::query(
        r#"
        INSERT INTO transactions (account_id, date, type, ticker, qty, amount, links)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(t.account_id)
    .bind(t.date)
    .bind(t.txn_type.as_str())
    .bind(&t.ticker)
    .bind(t.qty.map(|q| q.to_string()))
    .bind(t.amount.to_string())
    .bind(links)
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn update_transaction_classification<'e, E>(
    executor: E,
    transaction_id: i64,
    txn_type: TxnType,
    amount: Decimal,
    qty: Option<Decimal>,
    ticker: Option<&str>,
    links: &TxnLinks,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let links = serde_json::to_string(links).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
    sqlx::query(
        r#"
        UPDATE transactions SET type = ?2, amount = ?3, qty = ?4, ticker = ?5, links = ?6
        WHERE id = ?1
        "#,
    )
    .bind(transaction_id)
    .bind(txn_type.as_str())
    .bind(amount.to_string())
    .bind(qty.map(|q| q.to_string()))
    .bind(ticker)
    .bind(links)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_transaction_map<'e, E>(
    executor: E,
    connection_id: i64,
    provider_txn_id: &str,
    transaction_id: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO external_transaction_map (connection_id, provider_txn_id, transaction_id)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(connection_id)
    .bind(provider_txn_id)
    .bind(transaction_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn transaction_id_for_provider<'e, E>(
    executor: E,
    connection_id: i64,
    provider_txn_id: &str,
) -> Result<Option<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        r#"
        SELECT transaction_id FROM external_transaction_map
        WHERE connection_id = ?1 AND provider_txn_id = ?2
        "#,
    )
    .bind(connection_id)
    .bind(provider_txn_id)
    .fetch_optional(executor)
    .await?;
    row.map(|r| r.try_get("transaction_id")).transpose()
}

pub async fn get_transaction<'e, E>(
    executor: E,
    transaction_id: i64,
) -> Result<Option<Transaction>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM transactions WHERE id = ?1")
        .bind(transaction_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(map_transaction).transpose()
}

pub async fn upsert_cash_balance<'e, E>(
    executor: E,
    account_id: i64,
    as_of_date: NaiveDate,
    amount: Decimal,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO cash_balances (account_id, as_of_date, amount)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(account_id, as_of_date) DO UPDATE SET amount = excluded.amount
        "#,
    )
    .bind(account_id)
    .bind(as_of_date)
    .bind(amount.to_string())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_holding_snapshot<'e, E>(
    executor: E,
    connection_id: i64,
    as_of: DateTime<Utc>,
    derived: bool,
    payload: &HoldingsPayload,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(payload).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
    let res = sqlx::query(
        r#"
        INSERT INTO external_holding_snapshots (connection_id, as_of, derived, payload)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(connection_id)
    .bind(as_of)
    .bind(derived)
    .bind(payload)
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

pub async fn file_hash_ingested<'e, E>(
    executor: E,
    connection_id: i64,
    file_hash: &str,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT id FROM external_file_ingests WHERE connection_id = ?1 AND file_hash = ?2",
    )
    .bind(connection_id)
    .bind(file_hash)
    .fetch_optional(executor)
    .await?;
    Ok(row.is_some())
}

#[allow(clippy::too_many_arguments)]
pub async fn record_file_ingest<'e, E>(
    executor: E,
    connection_id: i64,
    kind: &str,
    file_name: &str,
    file_hash: &str,
    file_bytes: Option<i64>,
    start_date_hint: Option<NaiveDate>,
    end_date_hint: Option<NaiveDate>,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO external_file_ingests
            (connection_id, kind, file_name, file_hash, file_bytes, imported_at, start_date_hint, end_date_hint)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(connection_id)
    .bind(kind)
    .bind(file_name)
    .bind(file_hash)
    .bind(file_bytes)
    .bind(Utc::now())
    .bind(start_date_hint)
    .bind(end_date_hint)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_broker_lot_closure<'e, E>(
    executor: E,
    c: &BrokerLotClosure,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO broker_lot_closures
            (connection_id, provider_account_id, symbol, trade_date, open_date_raw,
             quantity_closed, cost_basis, realized_pl, proceeds, trade_id, source_file_hash)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(c.connection_id)
    .bind(&c.provider_account_id)
    .bind(&c.symbol)
    .bind(c.trade_date)
    .bind(&c.open_date_raw)
    .bind(c.quantity_closed.to_string())
    .bind(c.cost_basis.map(|v| v.to_string()))
    .bind(c.realized_pl.map(|v| v.to_string()))
    .bind(c.proceeds.map(|v| v.to_string()))
    .bind(&c.trade_id)
    .bind(&c.source_file_hash)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_broker_symbol_summary<'e, E>(
    executor: E,
    s: &BrokerSymbolSummary,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO broker_symbol_summaries
            (connection_id, provider_account_id, symbol, as_of_date, quantity,
             cost_basis, proceeds, realized_pl, source_file_hash, source_row)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(s.connection_id)
    .bind(&s.provider_account_id)
    .bind(&s.symbol)
    .bind(s.as_of_date)
    .bind(s.quantity.map(|v| v.to_string()))
    .bind(s.cost_basis.map(|v| v.to_string()))
    .bind(s.proceeds.map(|v| v.to_string()))
    .bind(s.realized_pl.map(|v| v.to_string()))
    .bind(&s.source_file_hash)
    .bind(s.source_row)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn insert_income_event<'e, E>(
    executor: E,
    account_id: i64,
    date: NaiveDate,
    income_type: IncomeType,
    ticker: Option<&str>,
    amount: Decimal,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query(
        r#"
        INSERT INTO income_events (account_id, date, type, ticker, amount)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(account_id)
    .bind(date)
    .bind(income_type.as_str())
    .bind(ticker)
    .bind(amount.to_string())
    .execute(executor)
    .await?;
    Ok(res.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Store: pool-backed canonical data access.
// ---------------------------------------------------------------------------

/// Owner of the canonical rows. All other components consume the immutable
/// view structs this hands out; the reconstructed-lot tables are written only
/// by the rebuild (which goes through its own transaction on the same pool).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- taxpayers / accounts / securities ---------------------------------

    pub async fn insert_taxpayer(&self, name: &str, entity_type: TaxpayerType) -> AppResult<i64> {
        let res = sqlx::query("INSERT INTO taxpayer_entities (name, type) VALUES (?1, ?2)")
            .bind(name)
            .bind(entity_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn list_taxpayers(&self) -> AppResult<Vec<TaxpayerEntity>> {
        let rows = sqlx::query("SELECT * FROM taxpayer_entities ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(TaxpayerEntity {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                entity_type: TaxpayerType::parse(&row.try_get::<String, _>("type")?),
                notes: row.try_get("notes")?,
            });
        }
        Ok(out)
    }

    pub async fn insert_account(
        &self,
        name: &str,
        broker: &str,
        account_type: AccountType,
        taxpayer_id: i64,
    ) -> AppResult<i64> {
        let res = sqlx::query(
            "INSERT INTO accounts (name, broker, account_type, taxpayer_id) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(broker)
        .bind(account_type.as_str())
        .bind(taxpayer_id)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn list_accounts(&self) -> AppResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Account {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                broker: row.try_get("broker")?,
                account_type: AccountType::parse(&row.try_get::<String, _>("account_type")?),
                taxpayer_id: row.try_get("taxpayer_id")?,
            });
        }
        Ok(out)
    }

    pub async fn insert_substitute_group(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> AppResult<i64> {
        let res = sqlx::query("INSERT INTO substitute_groups (name, description) VALUES (?1, ?2)")
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn upsert_security(
        &self,
        ticker: &str,
        name: &str,
        asset_class: &str,
        expense_ratio: f64,
        substitute_group_id: Option<i64>,
    ) -> AppResult<i64> {
        sqlx::query(
            r#"
            INSERT INTO securities (ticker, name, asset_class, expense_ratio, substitute_group_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(ticker) DO UPDATE SET
                name = excluded.name,
                asset_class = excluded.asset_class,
                expense_ratio = excluded.expense_ratio,
                substitute_group_id = excluded.substitute_group_id
            "#,
        )
        .bind(ticker)
        .bind(name)
        .bind(asset_class)
        .bind(expense_ratio)
        .bind(substitute_group_id)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT id FROM securities WHERE ticker = ?1")
            .bind(ticker)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn security_by_ticker(&self, ticker: &str) -> AppResult<Option<Security>> {
        let row = sqlx::query("SELECT * FROM securities WHERE ticker = ?1")
            .bind(ticker)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_security).transpose()?)
    }

    pub async fn list_securities(&self) -> AppResult<Vec<Security>> {
        let rows = sqlx::query("SELECT * FROM securities ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(map_security)
            .collect::<Result<Vec<_>, _>>()?)
    }

    // -- connections -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_connection(
        &self,
        name: &str,
        provider: &str,
        broker: &str,
        connector: Option<&str>,
        taxpayer_id: i64,
        status: ConnectionStatus,
        metadata: serde_json::Value,
    ) -> AppResult<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO external_connections (name, provider, broker, connector, taxpayer_id, status, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(name)
        .bind(provider)
        .bind(broker)
        .bind(connector)
        .bind(taxpayer_id)
        .bind(status.as_str())
        .bind(metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn get_connection(&self, id: i64) -> AppResult<Option<ExternalConnection>> {
        let row = sqlx::query("SELECT * FROM external_connections WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_connection).transpose()?)
    }

    pub async fn list_connections(&self) -> AppResult<Vec<ExternalConnection>> {
        let rows = sqlx::query("SELECT * FROM external_connections ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(map_connection)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn set_connection_status(
        &self,
        connection_id: i64,
        status: ConnectionStatus,
        last_error: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query("UPDATE external_connections SET status = ?2, last_error = ?3 WHERE id = ?1")
            .bind(connection_id)
            .bind(status.as_str())
            .bind(last_error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn map_external_account(
        &self,
        connection_id: i64,
        provider_account_id: &str,
        account_id: i64,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO external_account_map (connection_id, provider_account_id, account_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(connection_id, provider_account_id) DO UPDATE SET account_id = excluded.account_id
            "#,
        )
        .bind(connection_id)
        .bind(provider_account_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn account_maps_for_connection(
        &self,
        connection_id: i64,
    ) -> AppResult<Vec<ExternalAccountMap>> {
        let rows = sqlx::query("SELECT * FROM external_account_map WHERE connection_id = ?1")
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(ExternalAccountMap {
                id: row.try_get("id")?,
                connection_id: row.try_get("connection_id")?,
                provider_account_id: row.try_get("provider_account_id")?,
                account_id: row.try_get("account_id")?,
            });
        }
        Ok(out)
    }

    pub async fn transaction_maps_for_connection(
        &self,
        connection_id: i64,
    ) -> AppResult<Vec<ExternalTransactionMap>> {
        let rows = sqlx::query("SELECT * FROM external_transaction_map WHERE connection_id = ?1")
            .bind(connection_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(ExternalTransactionMap {
                id: row.try_get("id")?,
                connection_id: row.try_get("connection_id")?,
                provider_txn_id: row.try_get("provider_txn_id")?,
                transaction_id: row.try_get("transaction_id")?,
            });
        }
        Ok(out)
    }

    // -- transactions / income / cash --------------------------------------

    pub async fn transactions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC, id ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_transaction)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Transactions on the taxpayer's TAXABLE accounts with a known ticker,
    /// in replay order. The lot engine's input stream.
    pub async fn taxable_ticker_transactions_for_taxpayer(
        &self,
        taxpayer_id: i64,
    ) -> AppResult<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM transactions t
            JOIN accounts a ON a.id = t.account_id
            WHERE a.taxpayer_id = ?1 AND a.account_type = 'TAXABLE' AND t.ticker IS NOT NULL
            ORDER BY t.date ASC, t.id ASC
            "#,
        )
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_transaction)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn transaction(&self, id: i64) -> AppResult<Option<Transaction>> {
        Ok(get_transaction(&self.pool, id).await?)
    }

    pub async fn income_events_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AppResult<Vec<IncomeEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM income_events WHERE date >= ?1 AND date <= ?2 ORDER BY date ASC, id ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_income_event)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Latest cash balance per account (latest as_of_date wins).
    pub async fn latest_cash_balances(&self) -> AppResult<Vec<CashBalance>> {
        let rows = sqlx::query(
            r#"
            SELECT cb.* FROM cash_balances cb
            JOIN (
                SELECT account_id, MAX(as_of_date) AS max_date
                FROM cash_balances GROUP BY account_id
            ) latest ON latest.account_id = cb.account_id AND latest.max_date = cb.as_of_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(CashBalance {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                as_of_date: row.try_get("as_of_date")?,
                amount: parse_dec(&row.try_get::<String, _>("amount")?)?,
            });
        }
        Ok(out)
    }

    // -- tags ---------------------------------------------------------------

    pub async fn upsert_tax_tag(
        &self,
        transaction_id: i64,
        category: TagCategory,
        note: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tax_tags (transaction_id, category, note)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(transaction_id) DO UPDATE SET category = excluded.category, note = excluded.note
            "#,
        )
        .bind(transaction_id)
        .bind(category.as_str())
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn tag_for_transaction(&self, transaction_id: i64) -> AppResult<Option<TaxTag>> {
        let row = sqlx::query("SELECT * FROM tax_tags WHERE transaction_id = ?1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let category = match TagCategory::parse(&row.try_get::<String, _>("category")?) {
            Some(category) => category,
            None => return Ok(None),
        };
        Ok(Some(TaxTag {
            id: row.try_get("id")?,
            transaction_id: row.try_get("transaction_id")?,
            category,
            note: row.try_get("note")?,
        }))
    }

    /// (transaction, tag) pairs for tagged transactions in the date range.
    pub async fn tagged_transactions_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AppResult<Vec<(Transaction, TaxTag)>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id AS t_id, t.account_id, t.date, t.type, t.ticker, t.qty, t.amount, t.links,
                   g.id AS g_id, g.transaction_id, g.category, g.note
            FROM transactions t
            JOIN tax_tags g ON g.transaction_id = t.id
            WHERE t.date >= ?1 AND t.date <= ?2
            ORDER BY t.date ASC, t.id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let category = match TagCategory::parse(&row.try_get::<String, _>("category")?) {
                Some(c) => c,
                None => continue,
            };
            let links_raw: String = row.try_get("links")?;
            let links: TxnLinks =
                serde_json::from_str(&links_raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            let tx = Transaction {
                id: row.try_get("t_id")?,
                account_id: row.try_get("account_id")?,
                date: row.try_get("date")?,
                txn_type: TxnType::parse(&row.try_get::<String, _>("type")?),
                ticker: row.try_get("ticker")?,
                qty: parse_opt_dec(row.try_get("qty")?)?,
                amount: parse_dec(&row.try_get::<String, _>("amount")?)?,
                links,
            };
            let tag = TaxTag {
                id: row.try_get("g_id")?,
                transaction_id: row.try_get("transaction_id")?,
                category,
                note: row.try_get("note")?,
            };
            out.push((tx, tag));
        }
        Ok(out)
    }

    // -- holdings snapshots / file ingests ----------------------------------

    pub async fn latest_holding_snapshot(
        &self,
        connection_id: i64,
        as_of: Option<DateTime<Utc>>,
    ) -> AppResult<Option<ExternalHoldingSnapshot>> {
        let row = match as_of {
            Some(cutoff) => {
                sqlx::query(
                    r#"
                    SELECT * FROM external_holding_snapshots
                    WHERE connection_id = ?1 AND as_of <= ?2
                    ORDER BY as_of DESC, id DESC LIMIT 1
                    "#,
                )
                .bind(connection_id)
                .bind(cutoff)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM external_holding_snapshots
                    WHERE connection_id = ?1
                    ORDER BY as_of DESC, id DESC LIMIT 1
                    "#,
                )
                .bind(connection_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(row.as_ref().map(map_holding_snapshot).transpose()?)
    }

    /// Latest snapshot that carries at least one real (non-total) position
    /// item, preferred over newer cash/valuation-only snapshots.
    pub async fn latest_position_snapshot(
        &self,
        connection_id: i64,
        as_of: Option<DateTime<Utc>>,
    ) -> AppResult<Option<ExternalHoldingSnapshot>> {
        let rows = match as_of {
            Some(cutoff) => {
                sqlx::query(
                    r#"
                    SELECT * FROM external_holding_snapshots
                    WHERE connection_id = ?1 AND as_of <= ?2
                    ORDER BY as_of DESC, id DESC
                    "#,
                )
                .bind(connection_id)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM external_holding_snapshots
                    WHERE connection_id = ?1
                    ORDER BY as_of DESC, id DESC
                    "#,
                )
                .bind(connection_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        for row in &rows {
            let snap = map_holding_snapshot(row)?;
            if snap.payload.items.iter().any(|i| !i.is_total) {
                return Ok(Some(snap));
            }
        }
        Ok(None)
    }

    // -- broker tax rows -----------------------------------------------------

    pub async fn broker_lot_closures_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AppResult<Vec<BrokerLotClosure>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM broker_lot_closures
            WHERE trade_date >= ?1 AND trade_date <= ?2
            ORDER BY trade_date ASC, id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_closure).collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn broker_symbol_summaries_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> AppResult<Vec<BrokerSymbolSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM broker_symbol_summaries
            WHERE as_of_date >= ?1 AND as_of_date <= ?2
            ORDER BY as_of_date ASC, id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_symbol_summary)
            .collect::<Result<Vec<_>, _>>()?)
    }

    // -- reconstructed lot tables (read side; writes live in the rebuild) ----

    pub async fn tax_lots_for_taxpayer(&self, taxpayer_id: i64) -> AppResult<Vec<TaxLot>> {
        let rows = sqlx::query(
            "SELECT * FROM tax_lots WHERE taxpayer_id = ?1 ORDER BY acquired_date ASC, id ASC",
        )
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_tax_lot).collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn lot_disposals_for_taxpayer(&self, taxpayer_id: i64) -> AppResult<Vec<LotDisposal>> {
        // Disposals reach their taxpayer through the sell transaction when
        // one exists, or through the lot for sale-less rows (merger cash in
        // lieu realized against basis).
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM lot_disposals d
            LEFT JOIN transactions t ON t.id = d.sell_txn_id
            LEFT JOIN accounts a ON a.id = t.account_id
            LEFT JOIN tax_lots l ON l.id = d.tax_lot_id
            WHERE a.taxpayer_id = ?1 OR l.taxpayer_id = ?1
            ORDER BY d.as_of_date ASC, d.id ASC
            "#,
        )
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_lot_disposal)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn wash_adjustments_for_taxpayer(
        &self,
        taxpayer_id: i64,
    ) -> AppResult<Vec<WashSaleAdjustment>> {
        let rows = sqlx::query(
            r#"
            SELECT w.* FROM wash_sale_adjustments w
            JOIN transactions t ON t.id = w.loss_sale_txn_id
            JOIN accounts a ON a.id = t.account_id
            WHERE a.taxpayer_id = ?1
            ORDER BY w.id ASC
            "#,
        )
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_wash_adjustment)
            .collect::<Result<Vec<_>, _>>()?)
    }

    // -- corporate actions ---------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_corporate_action(
        &self,
        taxpayer_id: i64,
        account_id: Option<i64>,
        security_id: Option<i64>,
        action_date: NaiveDate,
        action_type: &CorporateActionType,
        ratio: Option<Decimal>,
        details: serde_json::Value,
    ) -> AppResult<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO corporate_action_events
                (taxpayer_id, account_id, security_id, action_date, action_type, ratio, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(taxpayer_id)
        .bind(account_id)
        .bind(security_id)
        .bind(action_date)
        .bind(action_type.as_str())
        .bind(ratio.map(|r| r.to_string()))
        .bind(details.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn corporate_actions_for_taxpayer(
        &self,
        taxpayer_id: i64,
    ) -> AppResult<Vec<CorporateActionEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM corporate_action_events
            WHERE taxpayer_id = ?1
            ORDER BY action_date ASC, id ASC
            "#,
        )
        .bind(taxpayer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(map_corporate_action)
            .collect::<Result<Vec<_>, _>>()?)
    }

    // -- tax facts / profile / inputs ---------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_tax_fact(
        &self,
        tax_year: i32,
        fact_type: FactType,
        amount: Option<Decimal>,
        amount_monthly: Option<&[f64]>,
        owner_entity: Option<&str>,
        doc_type: Option<&str>,
        confirmed: bool,
        authoritative: bool,
    ) -> AppResult<i64> {
        let monthly = amount_monthly
            .map(serde_json::to_string)
            .transpose()
            .map_err(crate::errors::AppError::Serialization)?;
        let res = sqlx::query(
            r#"
            INSERT INTO tax_facts
                (tax_year, fact_type, amount, amount_monthly, owner_entity, doc_type, confirmed, authoritative)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(tax_year)
        .bind(fact_type.as_str())
        .bind(amount.map(|v| v.to_string()))
        .bind(monthly)
        .bind(owner_entity)
        .bind(doc_type)
        .bind(confirmed)
        .bind(authoritative)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Confirmed, authoritative facts only; everything else is invisible to
    /// the engine.
    pub async fn confirmed_facts_for_year(&self, tax_year: i32) -> AppResult<Vec<TaxFact>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tax_facts
            WHERE tax_year = ?1 AND confirmed = 1 AND authoritative = 1
            ORDER BY id ASC
            "#,
        )
        .bind(tax_year)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::new();
        for row in &rows {
            if let Some(fact) = map_tax_fact(row)? {
                out.push(fact);
            }
        }
        Ok(out)
    }

    pub async fn get_or_create_tax_profile(&self, year: i32) -> AppResult<TaxProfile> {
        sqlx::query("INSERT OR IGNORE INTO tax_profiles (year) VALUES (?1)")
            .bind(year)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT * FROM tax_profiles WHERE year = ?1")
            .bind(year)
            .fetch_one(&self.pool)
            .await?;
        Ok(TaxProfile {
            id: row.try_get("id")?,
            year: row.try_get("year")?,
            filing_status: FilingStatus::parse(&row.try_get::<String, _>("filing_status")?),
            state_code: row.try_get("state_code")?,
            deductions_mode: DeductionsMode::parse(&row.try_get::<String, _>("deductions_mode")?),
            itemized_amount: parse_opt_dec(row.try_get("itemized_amount")?)?,
            household_size: row.try_get("household_size")?,
            dependents_count: row.try_get("dependents_count")?,
            trust_income_taxable_to_user: row.try_get("trust_income_taxable_to_user")?,
        })
    }

    pub async fn update_tax_profile(&self, profile: &TaxProfile) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE tax_profiles SET
                filing_status = ?2, state_code = ?3, deductions_mode = ?4, itemized_amount = ?5,
                household_size = ?6, dependents_count = ?7, trust_income_taxable_to_user = ?8
            WHERE year = ?1
            "#,
        )
        .bind(profile.year)
        .bind(profile.filing_status.as_str())
        .bind(&profile.state_code)
        .bind(profile.deductions_mode.as_str())
        .bind(profile.itemized_amount.map(|v| v.to_string()))
        .bind(profile.household_size)
        .bind(profile.dependents_count)
        .bind(profile.trust_income_taxable_to_user)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_tax_inputs(&self, year: i32) -> AppResult<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT data FROM tax_inputs WHERE year = ?1")
            .bind(year)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(parse_json(&row.try_get::<String, _>("data")?)?)),
        }
    }

    pub async fn put_tax_inputs(&self, year: i32, data: &serde_json::Value) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tax_inputs (year, data) VALUES (?1, ?2)
            ON CONFLICT(year) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(year)
        .bind(data.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- sync runs -----------------------------------------------------------

    pub async fn insert_sync_run(&self, run: &SyncRun) -> AppResult<i64> {
        let res = sqlx::query(
            r#"
            INSERT INTO sync_runs
                (connection_id, started_at, finished_at, status, mode, actor,
                 requested_start, requested_end, effective_start, effective_end,
                 pages_fetched, txn_count, new_count, dupes_count, parse_fail_count,
                 missing_symbol_count, error, coverage)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
        )
        .bind(run.connection_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(run.mode.as_str())
        .bind(&run.actor)
        .bind(run.requested_start)
        .bind(run.requested_end)
        .bind(run.effective_start)
        .bind(run.effective_end)
        .bind(run.pages_fetched)
        .bind(run.txn_count)
        .bind(run.new_count)
        .bind(run.dupes_count)
        .bind(run.parse_fail_count)
        .bind(run.missing_symbol_count)
        .bind(&run.error)
        .bind(run.coverage.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn update_connection_after_sync(
        &self,
        connection_id: i64,
        txn_end: Option<NaiveDate>,
        earliest: Option<NaiveDate>,
        full_sync: bool,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE external_connections SET
                last_successful_sync_at = ?2,
                last_successful_txn_end = COALESCE(?3, last_successful_txn_end),
                txn_earliest_available = COALESCE(
                    MIN(COALESCE(txn_earliest_available, ?4), ?4), txn_earliest_available),
                last_full_sync_at = CASE WHEN ?5 THEN ?2 ELSE last_full_sync_at END,
                last_error = NULL
            WHERE id = ?1
            "#,
        )
        .bind(connection_id)
        .bind(now)
        .bind(txn_end)
        .bind(earliest)
        .bind(full_sync)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
