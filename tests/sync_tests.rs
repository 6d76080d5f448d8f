use std::path::Path;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use household_ledger::config::EngineConfig;
use household_ledger::db::{create_memory_db, initialize_schema};
use household_ledger::holdings::build_holdings_view;
use household_ledger::ingest::{run_sync, OfflineCsvConnector, SyncParams};
use household_ledger::preference::{preferred_connection_ids_for_scope, DashboardScope};
use household_ledger::store::{AccountType, ConnectionStatus, Store, SyncStatus, TaxpayerType, TxnType};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

async fn base_store() -> Store {
    let pool = create_memory_db().await.unwrap();
    initialize_schema(&pool).await.unwrap();
    Store::new(pool)
}

fn write_transactions_file(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

const TXNS_1: &str = "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-01-02,Buy,BOUGHT AAPL,AAPL,10,(1000.00),USD,T-1
U1,2025-02-01,Deposit,Contribution,,,1000.00,USD,CF-1
U1,2025-02-11,Withholding Tax,WITHHOLDING TAX AAPL,AAPL,,(3.00),USD,CF-4
";

const POSITIONS_1: &str = "\
account_id,as_of,section,symbol,qty,market_value,cost_basis
U1,2025-12-19,POSITION,AAPL,10,2500.00,2000.00
U1,2025-12-19,CASH,,,250.00,
U1,2025-12-19,TOTAL,,,99999.00,
";

async fn connection_with_dir(
    store: &Store,
    name: &str,
    broker: &str,
    connector: &str,
    taxpayer_id: i64,
    account_id: i64,
) -> i64 {
    let conn = store
        .insert_connection(
            name,
            broker,
            broker,
            Some(connector),
            taxpayer_id,
            ConnectionStatus::Active,
            serde_json::json!({}),
        )
        .await
        .unwrap();
    store.map_external_account(conn, "U1", account_id).await.unwrap();
    conn
}

fn full_params(connection_id: i64) -> SyncParams {
    SyncParams {
        start: Some(d(2015, 1, 1)),
        end: Some(d(2025, 12, 31)),
        ..SyncParams::full(connection_id, "test")
    }
}

#[tokio::test]
async fn full_sync_imports_transactions_holdings_and_cash() -> anyhow::Result<()> {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("Trust", TaxpayerType::Trust).await?;
    let acct = store
        .insert_account("IB Taxable", "IB", AccountType::Taxable, tp)
        .await?;
    let conn = connection_with_dir(&store, "ib-offline", "IB", "IB_FLEX_OFFLINE", tp, acct).await;

    let dir = tempfile::tempdir()?;
    write_transactions_file(dir.path(), "transactions_2025_1.csv", TXNS_1);
    write_transactions_file(dir.path(), "positions_2025_12_20.csv", POSITIONS_1);
    let adapter = OfflineCsvConnector::new(dir.path());

    let run = run_sync(&store, &config, &adapter, full_params(conn)).await?;
    assert_eq!(run.status, SyncStatus::Success);
    assert_eq!(run.new_count, 3);
    assert_eq!(run.txn_count, 3);
    assert_eq!(run.parse_fail_count, 0);
    assert_eq!(run.coverage["cash_balances_imported"], 1);
    assert_eq!(run.coverage["holdings_items_imported"], 1);

    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    assert_eq!(txns.len(), 3);

    // Buy is a cash outflow with a positive share count.
    let buy = txns.iter().find(|t| t.txn_type == TxnType::Buy).unwrap();
    assert_eq!(buy.amount, dec!(-1000.00));
    assert_eq!(buy.qty, Some(dec!(10)));

    // Provider category classified the deposit as a transfer.
    let transfer = txns.iter().find(|t| t.txn_type == TxnType::Transfer).unwrap();
    assert_eq!(transfer.amount, dec!(1000.00));

    // Withholding lands as a positive magnitude.
    let withholding = txns.iter().find(|t| t.txn_type == TxnType::Withholding).unwrap();
    assert_eq!(withholding.amount, dec!(3.00));

    let cash = store.latest_cash_balances().await.unwrap();
    assert_eq!(cash.len(), 1);
    assert_eq!(cash[0].amount, dec!(250.00));
    assert_eq!(cash[0].as_of_date, d(2025, 12, 19));

    let conn_row = store.get_connection(conn).await?.unwrap();
    assert_eq!(conn_row.txn_earliest_available, Some(d(2025, 1, 2)));
    assert!(conn_row.last_full_sync_at.is_some());
    Ok(())
}

#[tokio::test]
async fn repeated_syncs_are_idempotent() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("Trust", TaxpayerType::Trust).await.unwrap();
    let acct = store
        .insert_account("IB Taxable", "IB", AccountType::Taxable, tp)
        .await
        .unwrap();
    let conn = connection_with_dir(&store, "ib-offline", "IB", "IB_FLEX_OFFLINE", tp, acct).await;

    let dir = tempfile::tempdir().unwrap();
    write_transactions_file(dir.path(), "transactions_2025_1.csv", TXNS_1);
    let adapter = OfflineCsvConnector::new(dir.path());

    let r1 = run_sync(&store, &config, &adapter, full_params(conn)).await.unwrap();
    assert_eq!(r1.new_count, 3);

    // Same files again: skipped wholesale by content hash.
    let r2 = run_sync(&store, &config, &adapter, full_params(conn)).await.unwrap();
    assert_eq!(r2.status, SyncStatus::Success);
    assert_eq!(r2.new_count, 0);

    // An overlapping export re-delivers T-1 plus one new row; only the new
    // row lands.
    write_transactions_file(
        dir.path(),
        "transactions_2025_2.csv",
        "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-01-02,Buy,BOUGHT AAPL,AAPL,10,(1000.00),USD,T-1
U1,2025-03-05,Sell,SOLD AAPL,AAPL,-4,600.00,USD,T-2
",
    );
    let r3 = run_sync(&store, &config, &adapter, full_params(conn)).await.unwrap();
    assert_eq!(r3.new_count, 1);
    assert_eq!(r3.dupes_count, 1);

    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    assert_eq!(txns.len(), 4);
    let sell = txns.iter().find(|t| t.txn_type == TxnType::Sell).unwrap();
    assert_eq!(sell.amount, dec!(600.00));
    assert_eq!(sell.qty, Some(dec!(4)));
}

#[tokio::test]
async fn reprocess_upgrades_other_to_specific_without_new_rows() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("P", TaxpayerType::Personal).await.unwrap();
    let acct = store
        .insert_account("RJ Taxable", "RJ", AccountType::Taxable, tp)
        .await
        .unwrap();
    let conn = connection_with_dir(&store, "rj-offline", "RJ", "RJ_OFFLINE", tp, acct).await;

    let dir = tempfile::tempdir().unwrap();
    // No category, no keywords, no qty: classifies OTHER.
    write_transactions_file(
        dir.path(),
        "transactions_a.csv",
        "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-03-05,,MISC CREDIT,AAPL,,600.00,USD,T-9
",
    );
    let adapter = OfflineCsvConnector::new(dir.path());
    let r1 = run_sync(&store, &config, &adapter, full_params(conn)).await.unwrap();
    assert_eq!(r1.new_count, 1);
    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    assert_eq!(txns[0].txn_type, TxnType::Other);

    // The corrected export carries the same provider id with sell detail:
    // the row upgrades in place.
    write_transactions_file(
        dir.path(),
        "transactions_a.csv",
        "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-03-05,Sell,SOLD AAPL,AAPL,-4,600.00,USD,T-9
",
    );
    let r2 = run_sync(
        &store,
        &config,
        &adapter,
        SyncParams {
            reprocess: true,
            ..full_params(conn)
        },
    )
    .await
    .unwrap();
    assert_eq!(r2.new_count, 0);
    assert_eq!(r2.dupes_count, 1);

    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    assert_eq!(txns.len(), 1);
    assert_eq!(txns[0].txn_type, TxnType::Sell);
    assert_eq!(txns[0].qty, Some(dec!(4)));
}

#[tokio::test]
async fn disabled_connection_yields_error_run_without_rows() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("P", TaxpayerType::Personal).await.unwrap();
    let acct = store
        .insert_account("RJ Taxable", "RJ", AccountType::Taxable, tp)
        .await
        .unwrap();
    let conn = store
        .insert_connection(
            "rj-disabled",
            "RJ",
            "RJ",
            Some("RJ_OFFLINE"),
            tp,
            ConnectionStatus::Disabled,
            serde_json::json!({}),
        )
        .await
        .unwrap();
    store.map_external_account(conn, "U1", acct).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    write_transactions_file(dir.path(), "transactions_2025_1.csv", TXNS_1);
    let adapter = OfflineCsvConnector::new(dir.path());

    let run = run_sync(&store, &config, &adapter, full_params(conn)).await.unwrap();
    assert_eq!(run.status, SyncStatus::Error);
    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    assert!(txns.is_empty());
}

#[tokio::test]
async fn ib_preference_counts_duplicated_transfer_once() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("T", TaxpayerType::Trust).await.unwrap();
    let acct = store
        .insert_account("IB Taxable", "IB", AccountType::Taxable, tp)
        .await
        .unwrap();

    // Two ACTIVE IB connections cover the same provider account and both
    // imported provider txn "X".
    let offline = connection_with_dir(&store, "ib-offline", "IB", "IB_FLEX_OFFLINE", tp, acct).await;
    let web = connection_with_dir(&store, "ib-web", "IB", "IB_FLEX_WEB", tp, acct).await;

    let transfer = "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-04-01,Withdrawal,WIRE OUT,,,( 20000.00),USD,X
";
    let dir_a = tempfile::tempdir().unwrap();
    write_transactions_file(dir_a.path(), "transactions_a.csv", transfer);
    let dir_b = tempfile::tempdir().unwrap();
    write_transactions_file(dir_b.path(), "transactions_b.csv", transfer);

    run_sync(&store, &config, &OfflineCsvConnector::new(dir_a.path()), full_params(offline))
        .await
        .unwrap();
    run_sync(&store, &config, &OfflineCsvConnector::new(dir_b.path()), full_params(web))
        .await
        .unwrap();

    // Both canonical rows exist (one per connection).
    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    assert_eq!(txns.len(), 2);

    // The resolver picks only the web connection.
    let taxpayers = store.list_taxpayers().await.unwrap();
    let connections = store.list_connections().await.unwrap();
    let preferred =
        preferred_connection_ids_for_scope(DashboardScope::Household, &taxpayers, &connections);
    assert_eq!(preferred.into_iter().collect::<Vec<_>>(), vec![web]);

    // Cashflow summaries count the withdrawal exactly once.
    let view = build_holdings_view(&store, None, DashboardScope::Household, None, d(2025, 12, 31))
        .await
        .unwrap();
    assert_eq!(view.ytd_cashflows.withdrawals, dec!(20000.00));
    assert_eq!(view.ytd_cashflows.deposits, Decimal::ZERO);
}

#[tokio::test]
async fn within_set_dedupe_handles_two_preferred_connections() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("P", TaxpayerType::Personal).await.unwrap();
    let acct = store
        .insert_account("RJ Taxable", "RJ", AccountType::Taxable, tp)
        .await
        .unwrap();

    // RJ has no preference rule: both connections stay in the preferred set
    // while both still hold provider txn "X".
    let a = connection_with_dir(&store, "rj-a", "RJ", "RJ_OFFLINE", tp, acct).await;
    let b = connection_with_dir(&store, "rj-b", "RJ", "RJ_QFX", tp, acct).await;

    let deposit = "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-05-01,Deposit,ACH IN,,,5000.00,USD,X
";
    let dir_a = tempfile::tempdir().unwrap();
    write_transactions_file(dir_a.path(), "transactions_a.csv", deposit);
    let dir_b = tempfile::tempdir().unwrap();
    write_transactions_file(dir_b.path(), "transactions_b.csv", deposit);

    run_sync(&store, &config, &OfflineCsvConnector::new(dir_a.path()), full_params(a))
        .await
        .unwrap();
    run_sync(&store, &config, &OfflineCsvConnector::new(dir_b.path()), full_params(b))
        .await
        .unwrap();

    let view = build_holdings_view(&store, None, DashboardScope::Household, None, d(2025, 12, 31))
        .await
        .unwrap();
    assert_eq!(view.ytd_cashflows.deposits, dec!(5000.00));
}

#[tokio::test]
async fn internal_transfers_stay_out_of_cashflow_summaries() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("T", TaxpayerType::Trust).await.unwrap();
    let acct = store
        .insert_account("RJ Taxable", "RJ", AccountType::Taxable, tp)
        .await
        .unwrap();
    let conn = connection_with_dir(&store, "rj", "RJ", "RJ_OFFLINE", tp, acct).await;

    let dir = tempfile::tempdir().unwrap();
    write_transactions_file(
        dir.path(),
        "transactions_a.csv",
        "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-10-03,Withdrawal,TRSF TO SHADO ACCT FOR FX TRAD,,,(650.33),USD,S-1
U1,2025-10-03,Withdrawal,WIRE TO VENDOR,,,(651.74),USD,S-2
",
    );
    run_sync(&store, &config, &OfflineCsvConnector::new(dir.path()), full_params(conn))
        .await
        .unwrap();

    // The sweep row classified OTHER and never shows up as a withdrawal.
    let txns = store.transactions_in_range(d(2025, 1, 1), d(2025, 12, 31)).await.unwrap();
    let sweep = txns.iter().find(|t| t.links.provider_txn_id.as_deref() == Some("S-1")).unwrap();
    assert_eq!(sweep.txn_type, TxnType::Other);

    let view = build_holdings_view(&store, None, DashboardScope::Household, None, d(2025, 12, 31))
        .await
        .unwrap();
    assert_eq!(view.ytd_cashflows.withdrawals, dec!(651.74));
}

#[tokio::test]
async fn stale_position_feed_is_forward_rolled_from_transactions() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("T", TaxpayerType::Trust).await.unwrap();
    let acct = store
        .insert_account("IB Taxable", "IB", AccountType::Taxable, tp)
        .await
        .unwrap();
    let conn = connection_with_dir(&store, "ib", "IB", "IB_FLEX_OFFLINE", tp, acct).await;

    // Quarterly position feed from June, trades in July.
    let dir = tempfile::tempdir().unwrap();
    write_transactions_file(
        dir.path(),
        "positions_2025_06_01.csv",
        "\
account_id,as_of,section,symbol,qty,market_value,cost_basis
U1,2025-06-01,POSITION,AAPL,10,2500.00,2000.00
U1,2025-06-01,CASH,,,1000.00,
",
    );
    write_transactions_file(
        dir.path(),
        "transactions_2025_07.csv",
        "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-07-01,Buy,BOUGHT AAPL,AAPL,5,(700.00),USD,T-1
",
    );
    run_sync(
        &store,
        &config,
        &OfflineCsvConnector::new(dir.path()),
        full_params(conn),
    )
    .await
    .unwrap();

    // The derived snapshot carries the rolled-forward quantity, and the
    // day's buy is counted exactly once in cash.
    let view = build_holdings_view(&store, None, DashboardScope::Household, None, d(2025, 12, 31))
        .await
        .unwrap();
    assert_eq!(view.positions.len(), 1);
    assert_eq!(view.positions[0].qty, dec!(15));
    assert_eq!(view.total_cash, dec!(300.00));
}

#[tokio::test]
async fn holdings_view_prices_positions_with_snapshot_fallback() {
    let store = base_store().await;
    let config = EngineConfig::default();
    let tp = store.insert_taxpayer("T", TaxpayerType::Trust).await.unwrap();
    let acct = store
        .insert_account("IB Taxable", "IB", AccountType::Taxable, tp)
        .await
        .unwrap();
    let conn = connection_with_dir(&store, "ib", "IB", "IB_FLEX_OFFLINE", tp, acct).await;

    let dir = tempfile::tempdir().unwrap();
    write_transactions_file(dir.path(), "positions_2025_12_20.csv", POSITIONS_1);
    run_sync(&store, &config, &OfflineCsvConnector::new(dir.path()), full_params(conn))
        .await
        .unwrap();

    // Cached price for AAPL exists; the total-row valuation is never a
    // position.
    let price_dir = tempfile::tempdir().unwrap();
    std::fs::write(price_dir.path().join("AAPL.csv"), "date,price\n2025-12-19,260.00\n").unwrap();
    let prices = household_ledger::prices::CsvPriceStore::new(price_dir.path());

    let view = build_holdings_view(
        &store,
        Some(&prices),
        DashboardScope::Household,
        None,
        d(2025, 12, 20),
    )
    .await
    .unwrap();
    assert_eq!(view.positions.len(), 1);
    assert_eq!(view.positions[0].ticker, "AAPL");
    assert_eq!(view.positions[0].market_value, Some(dec!(2600.00)));
    assert_eq!(view.total_cash, dec!(250.00));

    // Without a price store the snapshot value stands and a warning records
    // the fallback.
    let view = build_holdings_view(&store, None, DashboardScope::Household, None, d(2025, 12, 20))
        .await
        .unwrap();
    assert_eq!(view.positions[0].market_value, Some(dec!(2500.00)));
    assert!(view.warnings.iter().any(|w| w.contains("no cached price")));
}
