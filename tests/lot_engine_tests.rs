use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use household_ledger::db::{create_memory_db, initialize_schema};
use household_ledger::lots::{rebuild_tax_lots_for_taxpayer, wash_risk_for_loss_sale, WashRisk};
use household_ledger::store::database as db_ops;
use household_ledger::store::{
    AccountType, CorporateActionType, NewTransaction, Store, TaxpayerType, Term, TxnLinks, TxnType,
    WashStatus,
};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

async fn taxable_setup() -> (Store, i64, i64) {
    let pool = create_memory_db().await.unwrap();
    initialize_schema(&pool).await.unwrap();
    let store = Store::new(pool);
    let tp = store.insert_taxpayer("Trust", TaxpayerType::Trust).await.unwrap();
    let acct = store
        .insert_account("A1", "IB", AccountType::Taxable, tp)
        .await
        .unwrap();
    store
        .upsert_security("AAPL", "Apple", "EQUITY", 0.0, None)
        .await
        .unwrap();
    (store, tp, acct)
}

async fn add_txn(
    store: &Store,
    acct: i64,
    date: NaiveDate,
    txn_type: TxnType,
    ticker: &str,
    qty: Decimal,
    amount: Decimal,
) -> i64 {
    db_ops::insert_transaction(
        store.pool(),
        &NewTransaction {
            account_id: acct,
            date,
            txn_type,
            ticker: Some(ticker.to_string()),
            qty: Some(qty),
            amount,
            links: TxnLinks::default(),
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn rebuild_fifo_consumes_lots_and_terms() {
    let (store, tp, acct) = taxable_setup().await;
    add_txn(&store, acct, d(2024, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-1000)).await;
    add_txn(&store, acct, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-2000)).await;
    add_txn(&store, acct, d(2025, 12, 31), TxnType::Sell, "AAPL", dec!(15), dec!(2250)).await;

    let result = rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    assert_eq!(result.lots_created, 2);
    assert!(result.disposals_created >= 2);
    assert!(result.warnings.is_empty());

    let lots = store.tax_lots_for_taxpayer(tp).await.unwrap();
    let remaining: Vec<_> = lots.iter().filter(|l| l.quantity_open > Decimal::ZERO).collect();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].acquired_date, d(2025, 1, 1));
    assert_eq!(remaining[0].quantity_open, dec!(5));
    assert_eq!(remaining[0].basis_open, Some(dec!(1000)));

    let disposals = store.lot_disposals_for_taxpayer(tp).await.unwrap();
    let terms: Vec<Term> = disposals.iter().map(|disposal| disposal.term).collect();
    assert!(terms.contains(&Term::Lt));
    assert!(terms.contains(&Term::St));
    let lt = disposals.iter().find(|x| x.term == Term::Lt).unwrap();
    assert_eq!(lt.realized_gain, Some(dec!(500)));
    let st = disposals.iter().find(|x| x.term == Term::St).unwrap();
    assert_eq!(st.realized_gain, Some(dec!(-250)));

    // No replacement inside the window: no wash adjustments.
    assert_eq!(result.wash_adjustments_created, 0);
}

#[tokio::test]
async fn wash_sale_adjusts_replacement_basis() {
    let (store, tp, acct) = taxable_setup().await;
    add_txn(&store, acct, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-1000)).await;
    add_txn(&store, acct, d(2025, 2, 1), TxnType::Sell, "AAPL", dec!(10), dec!(800)).await;
    let replacement_buy =
        add_txn(&store, acct, d(2025, 2, 15), TxnType::Buy, "AAPL", dec!(10), dec!(-900)).await;

    let result = rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    assert_eq!(result.wash_adjustments_created, 1);

    let adjustments = store.wash_adjustments_for_taxpayer(tp).await.unwrap();
    let adj = &adjustments[0];
    assert_eq!(adj.deferred_loss, dec!(200));
    assert_eq!(adj.basis_increase, dec!(200));
    assert_eq!(adj.status, WashStatus::Applied);
    assert_eq!(adj.replacement_buy_txn_id, Some(replacement_buy));
    assert_eq!(adj.window_start, d(2025, 1, 2));
    assert_eq!(adj.window_end, d(2025, 3, 3));

    // Replacement lot basis rose from 900 to 1100.
    let lots = store.tax_lots_for_taxpayer(tp).await.unwrap();
    let replacement_lot = lots
        .iter()
        .find(|l| l.created_from_txn_id == Some(replacement_buy))
        .unwrap();
    assert_eq!(replacement_lot.basis_open, Some(dec!(1100)));
    assert_eq!(adj.replacement_lot_id, Some(replacement_lot.id));
}

#[tokio::test]
async fn split_event_adjusts_open_lot_quantity() {
    let (store, tp, acct) = taxable_setup().await;
    let security = store.security_by_ticker("AAPL").await.unwrap().unwrap();
    add_txn(&store, acct, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-1000)).await;
    store
        .insert_corporate_action(
            tp,
            Some(acct),
            Some(security.id),
            d(2025, 6, 1),
            &CorporateActionType::Split,
            Some(dec!(2)),
            serde_json::json!({}),
        )
        .await
        .unwrap();
    add_txn(&store, acct, d(2025, 7, 1), TxnType::Sell, "AAPL", dec!(10), dec!(600)).await;

    rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();

    // After the 2:1 split the lot holds 20 shares; selling 10 leaves 10 with
    // half the original aggregate basis.
    let lots = store.tax_lots_for_taxpayer(tp).await.unwrap();
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].quantity_open, dec!(10));
    assert_eq!(lots[0].basis_open, Some(dec!(500)));

    let actions = store.corporate_actions_for_taxpayer(tp).await.unwrap();
    assert!(actions[0].applied);
    assert!(actions[0].apply_notes.is_some());
}

#[tokio::test]
async fn merger_cash_in_lieu_realizes_gain_through_rebuild() {
    let (store, tp, acct) = taxable_setup().await;
    let security = store.security_by_ticker("AAPL").await.unwrap().unwrap();
    add_txn(&store, acct, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-100)).await;
    store
        .insert_corporate_action(
            tp,
            Some(acct),
            Some(security.id),
            d(2025, 6, 1),
            &CorporateActionType::Merger,
            None,
            serde_json::json!({"cash_in_lieu": 150.0}),
        )
        .await
        .unwrap();

    let result = rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    assert_eq!(result.disposals_created, 1);
    assert!(result.warnings.iter().any(|w| w.contains("cash in lieu exceeds basis")));

    let lots = store.tax_lots_for_taxpayer(tp).await.unwrap();
    assert_eq!(lots[0].basis_open, Some(Decimal::ZERO));

    // The excess over basis lands as a sale-less disposal carrying the gain.
    let disposals = store.lot_disposals_for_taxpayer(tp).await.unwrap();
    assert_eq!(disposals.len(), 1);
    let gain = &disposals[0];
    assert_eq!(gain.sell_txn_id, None);
    assert_eq!(gain.tax_lot_id, Some(lots[0].id));
    assert_eq!(gain.realized_gain, Some(dec!(50)));
    assert_eq!(gain.quantity_sold, Decimal::ZERO);
    assert_eq!(gain.term, Term::St);
    assert_eq!(gain.as_of_date, d(2025, 6, 1));

    // A second rebuild replaces the disposal instead of stacking another.
    rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    let disposals = store.lot_disposals_for_taxpayer(tp).await.unwrap();
    assert_eq!(disposals.len(), 1);
}

#[tokio::test]
async fn rebuild_is_deterministic_and_atomic() {
    let (store, tp, acct) = taxable_setup().await;
    add_txn(&store, acct, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-1000)).await;
    add_txn(&store, acct, d(2025, 2, 1), TxnType::Sell, "AAPL", dec!(5), dec!(600)).await;

    let r1 = rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    let lots1: Vec<_> = store
        .tax_lots_for_taxpayer(tp)
        .await
        .unwrap()
        .into_iter()
        .map(|l| (l.acquired_date, l.quantity_open, l.basis_open))
        .collect();
    let disp1: Vec<_> = store
        .lot_disposals_for_taxpayer(tp)
        .await
        .unwrap()
        .into_iter()
        .map(|x| (x.as_of_date, x.quantity_sold, x.realized_gain, x.term))
        .collect();

    let r2 = rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    let lots2: Vec<_> = store
        .tax_lots_for_taxpayer(tp)
        .await
        .unwrap()
        .into_iter()
        .map(|l| (l.acquired_date, l.quantity_open, l.basis_open))
        .collect();
    let disp2: Vec<_> = store
        .lot_disposals_for_taxpayer(tp)
        .await
        .unwrap()
        .into_iter()
        .map(|x| (x.as_of_date, x.quantity_sold, x.realized_gain, x.term))
        .collect();

    assert_eq!(r1.warnings, r2.warnings);
    assert_eq!(lots1, lots2);
    assert_eq!(disp1, disp2);
    // The second rebuild replaced, not appended.
    assert_eq!(lots2.len(), r2.lots_created as usize);
}

#[tokio::test]
async fn lot_and_wash_conservation_invariants() {
    let (store, tp, acct) = taxable_setup().await;
    add_txn(&store, acct, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-1000)).await;
    add_txn(&store, acct, d(2025, 1, 20), TxnType::Buy, "AAPL", dec!(8), dec!(-900)).await;
    add_txn(&store, acct, d(2025, 2, 1), TxnType::Sell, "AAPL", dec!(12), dec!(700)).await;
    add_txn(&store, acct, d(2025, 2, 20), TxnType::Buy, "AAPL", dec!(6), dec!(-450)).await;

    rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();

    // Shares are conserved: open + sold = bought (no corporate actions here).
    let lots = store.tax_lots_for_taxpayer(tp).await.unwrap();
    let disposals = store.lot_disposals_for_taxpayer(tp).await.unwrap();
    let open: Decimal = lots.iter().map(|l| l.quantity_open).sum();
    let sold: Decimal = disposals.iter().map(|x| x.quantity_sold).sum();
    assert_eq!(open + sold, dec!(24));

    // Applied basis increases match deferred losses one for one.
    let adjustments = store.wash_adjustments_for_taxpayer(tp).await.unwrap();
    assert!(!adjustments.is_empty());
    let deferred: Decimal = adjustments
        .iter()
        .filter(|a| a.status == WashStatus::Applied)
        .map(|a| a.deferred_loss)
        .sum();
    let increases: Decimal = adjustments
        .iter()
        .filter(|a| a.status == WashStatus::Applied)
        .map(|a| a.basis_increase)
        .sum();
    assert_eq!(deferred, increases);
}

#[tokio::test]
async fn ira_accounts_stay_out_of_lot_scope() {
    let (store, tp, _acct) = taxable_setup().await;
    let ira = store
        .insert_account("IRA", "RJ", AccountType::Ira, tp)
        .await
        .unwrap();
    add_txn(&store, ira, d(2025, 1, 1), TxnType::Buy, "AAPL", dec!(10), dec!(-1000)).await;
    add_txn(&store, ira, d(2025, 2, 1), TxnType::Sell, "AAPL", dec!(10), dec!(800)).await;

    let result = rebuild_tax_lots_for_taxpayer(&store, tp, "test").await.unwrap();
    assert_eq!(result.lots_created, 0);
    assert_eq!(result.disposals_created, 0);
    assert_eq!(result.wash_adjustments_created, 0);
}

#[tokio::test]
async fn wash_risk_advisory_end_to_end() {
    let (store, tp, acct) = taxable_setup().await;
    add_txn(&store, acct, d(2025, 2, 10), TxnType::Buy, "AAPL", dec!(5), dec!(-500)).await;

    let (risk, matches) = wash_risk_for_loss_sale(&store, tp, "AAPL", d(2025, 2, 1), &[], 30)
        .await
        .unwrap();
    assert_eq!(risk, WashRisk::Definite);
    assert_eq!(matches.len(), 1);

    // Outside the window: clean.
    let (risk, _) = wash_risk_for_loss_sale(&store, tp, "AAPL", d(2025, 4, 1), &[], 30)
        .await
        .unwrap();
    assert_eq!(risk, WashRisk::None);
}
