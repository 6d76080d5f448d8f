use sqlx::SqlitePool;
use std::path::Path;

pub async fn create_sqlite_db(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());
    SqlitePool::connect(&db_url).await
}

pub async fn create_memory_db() -> Result<SqlitePool, sqlx::Error> {
    SqlitePool::connect("sqlite::memory:").await
}

/// Creates every table and index of the canonical data model. Idempotent.
///
/// Money columns are TEXT-encoded decimals; dates are ISO-8601 TEXT. The
/// unique keys here are the engine's idempotency contract: provider identity
/// per connection, cash balance per (account, day), one tag per transaction.
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS taxpayer_entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            notes TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            broker TEXT NOT NULL,
            account_type TEXT NOT NULL,
            taxpayer_id INTEGER NOT NULL REFERENCES taxpayer_entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS substitute_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS securities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticker TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            asset_class TEXT NOT NULL,
            expense_ratio REAL NOT NULL DEFAULT 0.0,
            substitute_group_id INTEGER REFERENCES substitute_groups(id),
            metadata TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            date TEXT NOT NULL,
            type TEXT NOT NULL,
            ticker TEXT,
            qty TEXT,
            amount TEXT NOT NULL,
            links TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_transactions_account_date
        ON transactions(account_id, date);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS income_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            date TEXT NOT NULL,
            type TEXT NOT NULL,
            ticker TEXT,
            amount TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cash_balances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            as_of_date TEXT NOT NULL,
            amount TEXT NOT NULL,
            UNIQUE(account_id, as_of_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_connections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            provider TEXT NOT NULL,
            broker TEXT NOT NULL,
            connector TEXT,
            taxpayer_id INTEGER NOT NULL REFERENCES taxpayer_entities(id),
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            metadata TEXT NOT NULL DEFAULT '{}',
            last_successful_sync_at TEXT,
            last_successful_txn_end TEXT,
            txn_earliest_available TEXT,
            holdings_last_asof TEXT,
            last_full_sync_at TEXT,
            coverage_status TEXT,
            last_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL DEFAULT 'ERROR',
            mode TEXT NOT NULL,
            actor TEXT NOT NULL,
            requested_start TEXT,
            requested_end TEXT,
            effective_start TEXT,
            effective_end TEXT,
            pages_fetched INTEGER NOT NULL DEFAULT 0,
            txn_count INTEGER NOT NULL DEFAULT 0,
            new_count INTEGER NOT NULL DEFAULT 0,
            dupes_count INTEGER NOT NULL DEFAULT 0,
            parse_fail_count INTEGER NOT NULL DEFAULT 0,
            missing_symbol_count INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            coverage TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_account_map (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            provider_account_id TEXT NOT NULL,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            UNIQUE(connection_id, provider_account_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_transaction_map (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            provider_txn_id TEXT NOT NULL,
            transaction_id INTEGER NOT NULL REFERENCES transactions(id),
            UNIQUE(connection_id, provider_txn_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_holding_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            as_of TEXT NOT NULL,
            derived INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_holding_snapshots_conn_asof
        ON external_holding_snapshots(connection_id, as_of);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS external_file_ingests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            kind TEXT NOT NULL DEFAULT 'TRANSACTIONS',
            file_name TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            file_bytes INTEGER,
            imported_at TEXT NOT NULL,
            start_date_hint TEXT,
            end_date_hint TEXT,
            UNIQUE(connection_id, file_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_lot_closures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            provider_account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            trade_date TEXT NOT NULL,
            open_date_raw TEXT,
            quantity_closed TEXT NOT NULL,
            cost_basis TEXT,
            realized_pl TEXT,
            proceeds TEXT,
            trade_id TEXT,
            source_file_hash TEXT NOT NULL,
            UNIQUE(connection_id, trade_id, open_date_raw, quantity_closed, cost_basis, realized_pl)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_broker_lot_closures_scope
        ON broker_lot_closures(connection_id, provider_account_id, symbol, trade_date);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_symbol_summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            connection_id INTEGER NOT NULL REFERENCES external_connections(id),
            provider_account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            as_of_date TEXT NOT NULL,
            quantity TEXT,
            cost_basis TEXT,
            proceeds TEXT,
            realized_pl TEXT,
            source_file_hash TEXT NOT NULL,
            source_row INTEGER NOT NULL,
            UNIQUE(connection_id, source_file_hash, source_row)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tax_lots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            taxpayer_id INTEGER NOT NULL REFERENCES taxpayer_entities(id),
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            security_id INTEGER NOT NULL REFERENCES securities(id),
            acquired_date TEXT NOT NULL,
            quantity_open TEXT NOT NULL,
            basis_open TEXT,
            source TEXT NOT NULL DEFAULT 'RECONSTRUCTED',
            created_from_txn_id INTEGER REFERENCES transactions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_tax_lots_scope
        ON tax_lots(taxpayer_id, account_id, security_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lot_disposals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sell_txn_id INTEGER REFERENCES transactions(id),
            tax_lot_id INTEGER REFERENCES tax_lots(id),
            quantity_sold TEXT NOT NULL,
            proceeds_allocated TEXT NOT NULL,
            basis_allocated TEXT,
            realized_gain TEXT,
            term TEXT NOT NULL DEFAULT 'UNKNOWN',
            as_of_date TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_lot_disposals_sale ON lot_disposals(sell_txn_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wash_sale_adjustments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            loss_sale_txn_id INTEGER NOT NULL REFERENCES transactions(id),
            replacement_buy_txn_id INTEGER REFERENCES transactions(id),
            replacement_lot_id INTEGER REFERENCES tax_lots(id),
            deferred_loss TEXT NOT NULL,
            basis_increase TEXT NOT NULL DEFAULT '0',
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'APPLIED'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corporate_action_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            taxpayer_id INTEGER NOT NULL REFERENCES taxpayer_entities(id),
            account_id INTEGER REFERENCES accounts(id),
            security_id INTEGER REFERENCES securities(id),
            action_date TEXT NOT NULL,
            action_type TEXT NOT NULL,
            ratio TEXT,
            applied INTEGER NOT NULL DEFAULT 0,
            apply_notes TEXT,
            details TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_corp_actions_scope
        ON corporate_action_events(taxpayer_id, action_date);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tax_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id INTEGER NOT NULL UNIQUE REFERENCES transactions(id),
            category TEXT NOT NULL,
            note TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tax_facts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tax_year INTEGER NOT NULL,
            fact_type TEXT NOT NULL,
            amount TEXT,
            amount_monthly TEXT,
            owner_entity TEXT,
            doc_type TEXT,
            confirmed INTEGER NOT NULL DEFAULT 0,
            authoritative INTEGER NOT NULL DEFAULT 0,
            is_corrected INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_tax_facts_year ON tax_facts(tax_year, fact_type);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tax_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            year INTEGER NOT NULL UNIQUE,
            filing_status TEXT NOT NULL DEFAULT 'MFJ',
            state_code TEXT,
            deductions_mode TEXT NOT NULL DEFAULT 'standard',
            itemized_amount TEXT,
            household_size INTEGER NOT NULL DEFAULT 3,
            dependents_count INTEGER NOT NULL DEFAULT 1,
            trust_income_taxable_to_user INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tax_inputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            year INTEGER NOT NULL UNIQUE,
            data TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initialization_is_idempotent() {
        let pool = create_memory_db().await.unwrap();
        initialize_schema(&pool).await.unwrap();
        initialize_schema(&pool).await.unwrap();

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
