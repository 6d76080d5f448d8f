use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::inputs::{clamp_month_value, get_or_create_tax_inputs, zero_months, TaxInputs};
use super::params::{self, load_tax_params, TaxParams};
use super::tags::suggest_tax_tag;
use crate::config::EngineConfig;
use crate::docs::{aggregate_doc_overrides, DocOverrides};
use crate::errors::AppResult;
use crate::ingest::classify::looks_like_withholding;
use crate::preference::{preferred_connection_ids_for_scope, DashboardScope};
use crate::store::{
    Account, AccountType, BrokerLotClosure, BrokerSymbolSummary, IncomeEvent, IncomeType, Store,
    TagCategory, TaxProfile, TaxTag, TaxpayerType, Term, Transaction, TxnType,
};

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];
const LARGE_CAP_GAINS_MONTH: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "investor")]
    Investor,
    #[serde(rename = "docs")]
    Docs,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "docs+investor")]
    DocsPlusInvestor,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Investor => "investor",
            SourceKind::Docs => "docs",
            SourceKind::Manual => "manual",
            SourceKind::DocsPlusInvestor => "docs+investor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyRow {
    pub month: u32,
    pub label: String,
    pub ordinary_ytd: Decimal,
    pub st_gains_ytd: Decimal,
    pub lt_gains_ytd: Decimal,
    pub dividends_ytd: Decimal,
    pub tax_ytd: Decimal,
    pub paid_ytd: Decimal,
    pub remaining_ytd: Decimal,
    pub run_rate_tax: Decimal,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrdinaryBreakdown {
    pub ira_distributions: Decimal,
    pub ira_distributions_net: Decimal,
    pub w2_wages: Decimal,
    pub business_net_profit: Decimal,
    pub trust_passthrough: Decimal,
    pub trust_passthrough_gross: Decimal,
    pub trust_fees: Decimal,
    pub k1_income: Decimal,
    pub interest: Decimal,
    pub dividends: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapitalGainsSummary {
    pub st: Decimal,
    pub lt: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcaSummary {
    pub enabled: bool,
    pub premium_paid: Decimal,
    pub aptc_received: Decimal,
    pub magi_estimate: Decimal,
    pub fpl_ratio: f64,
    pub indicator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxSummary {
    pub year: i32,
    pub filing_status: String,
    pub state_tax_rate: f64,
    pub deductions_mode: String,
    pub deductions: Decimal,
    pub standard_deduction: Decimal,
    pub itemized_amount: Decimal,
    pub ordinary_income: Decimal,
    pub ordinary_breakdown: OrdinaryBreakdown,
    pub capital_gains: CapitalGainsSummary,
    pub se_tax: Decimal,
    pub se_deduction: Decimal,
    pub taxable_ordinary: Decimal,
    pub taxable_ltcg: Decimal,
    pub ordinary_tax: Decimal,
    pub ltcg_tax: Decimal,
    pub niit_tax: Decimal,
    pub qualified_dividends: Decimal,
    pub non_qualified_dividends: Decimal,
    pub state_tax: Decimal,
    pub total_tax: Decimal,
    pub taxable_income_total: Decimal,
    pub gross_income_total: Decimal,
    pub effective_tax_rate: f64,
    pub effective_tax_rate_gross: f64,
    pub paid_ytd: Decimal,
    pub remaining_due: Decimal,
    pub safe_harbor_target: Decimal,
    pub safe_harbor_paid_target: Decimal,
    pub safe_harbor_status: String,
    pub withholding_ytd: Decimal,
    pub ira_withholding_ytd: Decimal,
    pub w2_withholding_ytd: Decimal,
    pub other_withholding_ytd: Decimal,
    pub estimated_payments_ytd: Decimal,
    pub aca: AcaSummary,
    pub child_credit_est: Decimal,
    pub docs_primary: bool,
    pub docs_present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxDashboard {
    pub year: i32,
    pub scope: DashboardScope,
    pub profile: TaxProfile,
    pub summary: TaxSummary,
    pub monthly: Vec<MonthlyRow>,
    pub sources: BTreeMap<String, SourceKind>,
    pub warnings: Vec<String>,
}

struct AccountSets {
    non_trust: HashSet<i64>,
    trust: HashSet<i64>,
    ira: HashSet<i64>,
    non_trust_non_ira: HashSet<i64>,
    trust_non_ira: HashSet<i64>,
}

impl AccountSets {
    fn build(
        scope: DashboardScope,
        include_trust: bool,
        accounts: &[Account],
        taxpayer_types: &HashMap<i64, TaxpayerType>,
    ) -> Self {
        let mut sets = AccountSets {
            non_trust: HashSet::new(),
            trust: HashSet::new(),
            ira: HashSet::new(),
            non_trust_non_ira: HashSet::new(),
            trust_non_ira: HashSet::new(),
        };
        for account in accounts {
            let tp_type = taxpayer_types
                .get(&account.taxpayer_id)
                .copied()
                .unwrap_or(TaxpayerType::Personal);
            if !scope.matches(tp_type) {
                continue;
            }
            let is_trust = tp_type == TaxpayerType::Trust;
            if is_trust && !include_trust {
                continue;
            }
            let is_ira = account.account_type == AccountType::Ira;
            if is_ira {
                sets.ira.insert(account.id);
            }
            if is_trust {
                sets.trust.insert(account.id);
                if !is_ira {
                    sets.trust_non_ira.insert(account.id);
                }
            } else {
                sets.non_trust.insert(account.id);
                if !is_ira {
                    sets.non_trust_non_ira.insert(account.id);
                }
            }
        }
        sets
    }
}

fn month_index(date: NaiveDate) -> usize {
    date.month0() as usize
}

/// True when the row's account is in the set and, for trust accounts, past
/// the trust cutoff.
fn in_cutoff_window(
    date: NaiveDate,
    account_id: i64,
    non_trust: &HashSet<i64>,
    trust: &HashSet<i64>,
    trust_begin: NaiveDate,
) -> bool {
    if non_trust.contains(&account_id) {
        return true;
    }
    if trust.contains(&account_id) {
        return date >= trust_begin;
    }
    false
}

fn tagged_by_month(
    tagged: &[(Transaction, TaxTag)],
    category: TagCategory,
    non_trust: &HashSet<i64>,
    trust: &HashSet<i64>,
    trust_begin: NaiveDate,
) -> Vec<Decimal> {
    let mut out = zero_months();
    for (tx, tag) in tagged {
        if tag.category != category {
            continue;
        }
        if !in_cutoff_window(tx.date, tx.account_id, non_trust, trust, trust_begin) {
            continue;
        }
        out[month_index(tx.date)] += tx.amount.abs();
    }
    out
}

fn ira_flows_by_month(
    transactions: &[Transaction],
    accounts: &HashMap<i64, Account>,
    taxpayer_types: &HashMap<i64, TaxpayerType>,
    ira_ids: &HashSet<i64>,
) -> (Vec<Decimal>, Vec<Decimal>) {
    let mut dist = zero_months();
    let mut withh = zero_months();
    for tx in transactions {
        if !ira_ids.contains(&tx.account_id) {
            continue;
        }
        let account = match accounts.get(&tx.account_id) {
            Some(a) => a,
            None => continue,
        };
        let tp_type = taxpayer_types
            .get(&account.taxpayer_id)
            .copied()
            .unwrap_or(TaxpayerType::Personal);
        match suggest_tax_tag(tx, account.account_type, tp_type, None) {
            Some(TagCategory::IraDistribution) => {
                dist[month_index(tx.date)] += tx.amount.abs();
            }
            Some(TagCategory::IraWithholding) => {
                withh[month_index(tx.date)] += tx.amount.abs();
            }
            _ => {}
        }
    }
    (dist, withh)
}

fn income_events_by_month(
    events: &[IncomeEvent],
    types: &[IncomeType],
    non_trust: &HashSet<i64>,
    trust: &HashSet<i64>,
    trust_begin: NaiveDate,
) -> Vec<Decimal> {
    let mut out = zero_months();
    for event in events {
        if !types.contains(&event.income_type) {
            continue;
        }
        if !in_cutoff_window(event.date, event.account_id, non_trust, trust, trust_begin) {
            continue;
        }
        out[month_index(event.date)] += event.amount;
    }
    out
}

fn is_div_int_withholding(tx: &Transaction) -> bool {
    tx.amount < Decimal::ZERO && looks_like_withholding(&tx.links.text())
}

/// Transaction DIV/INT fallback: accounts already covered by income events
/// are shadowed, duplicate provider rows collapse on
/// (account, date, amount, description), withholding-like rows are skipped.
fn transaction_div_int_by_month(
    transactions: &[Transaction],
    events: &[IncomeEvent],
    txn_types: &[TxnType],
    event_types: &[IncomeType],
    non_trust: &HashSet<i64>,
    trust: &HashSet<i64>,
    trust_begin: NaiveDate,
) -> Vec<Decimal> {
    let shadowed: HashSet<i64> = events
        .iter()
        .filter(|e| event_types.contains(&e.income_type))
        .map(|e| e.account_id)
        .collect();

    let mut out = zero_months();
    let mut seen: HashSet<(i64, NaiveDate, String, String)> = HashSet::new();
    for tx in transactions {
        if !txn_types.contains(&tx.txn_type) || shadowed.contains(&tx.account_id) {
            continue;
        }
        if !in_cutoff_window(tx.date, tx.account_id, non_trust, trust, trust_begin) {
            continue;
        }
        if is_div_int_withholding(tx) {
            continue;
        }
        let desc = tx
            .links
            .description
            .clone()
            .or_else(|| tx.ticker.clone())
            .unwrap_or_default();
        let key = (tx.account_id, tx.date, tx.amount.to_string(), desc);
        if !seen.insert(key) {
            continue;
        }
        out[month_index(tx.date)] += tx.amount;
    }
    out
}

fn withholding_by_month(
    transactions: &[Transaction],
    events: &[IncomeEvent],
    non_trust: &HashSet<i64>,
    trust: &HashSet<i64>,
    trust_begin: NaiveDate,
) -> Vec<Decimal> {
    let mut out = zero_months();
    for tx in transactions {
        if !in_cutoff_window(tx.date, tx.account_id, non_trust, trust, trust_begin) {
            continue;
        }
        match tx.txn_type {
            TxnType::Withholding => out[month_index(tx.date)] += tx.amount.abs(),
            TxnType::Div | TxnType::Int if is_div_int_withholding(tx) => {
                out[month_index(tx.date)] += tx.amount.abs();
            }
            _ => {}
        }
    }
    for event in events {
        if event.income_type != IncomeType::Withholding {
            continue;
        }
        if !in_cutoff_window(event.date, event.account_id, non_trust, trust, trust_begin) {
            continue;
        }
        out[month_index(event.date)] += event.amount.abs();
    }
    out
}

fn term_from_open_date(trade_date: NaiveDate, open_raw: Option<&str>) -> Term {
    let raw = match open_raw {
        Some(r) if !r.is_empty() => r,
        _ => return Term::Unknown,
    };
    let first = raw.split(';').next().unwrap_or(raw);
    let compact = first.get(..8).filter(|s| s.chars().all(|c| c.is_ascii_digit()));
    let open_date = match compact {
        Some(s) => NaiveDate::parse_from_str(s, "%Y%m%d").ok(),
        None => first
            .get(..10)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
    };
    match open_date {
        Some(od) if (trade_date - od).num_days() >= 365 => Term::Lt,
        Some(_) => Term::St,
        None => Term::Unknown,
    }
}

#[allow(clippy::too_many_arguments)]
fn capital_gains_by_month(
    closures: &[BrokerLotClosure],
    summaries: &[BrokerSymbolSummary],
    preferred_conn_ids: &HashSet<i64>,
    conn_taxpayer_types: &HashMap<i64, TaxpayerType>,
    include_trust: bool,
    trust_begin: Option<NaiveDate>,
    warnings: &mut Vec<String>,
) -> (Vec<Decimal>, Vec<Decimal>) {
    let mut st = zero_months();
    let mut lt = zero_months();
    for closure in closures {
        if !preferred_conn_ids.contains(&closure.connection_id) {
            continue;
        }
        let tp_type = conn_taxpayer_types
            .get(&closure.connection_id)
            .copied()
            .unwrap_or(TaxpayerType::Personal);
        if tp_type == TaxpayerType::Trust {
            if !include_trust {
                continue;
            }
            if let Some(begin) = trust_begin {
                if closure.trade_date < begin {
                    continue;
                }
            }
        }
        let realized = closure.realized_pl.unwrap_or(Decimal::ZERO);
        let idx = month_index(closure.trade_date);
        match term_from_open_date(closure.trade_date, closure.open_date_raw.as_deref()) {
            Term::Lt => lt[idx] += realized,
            _ => st[idx] += realized,
        }
    }

    // A broker-supplied symbol summary is the authoritative yearly total;
    // scale the monthly shape to match it when they materially disagree.
    let in_scope: Vec<&BrokerSymbolSummary> = summaries
        .iter()
        .filter(|s| preferred_conn_ids.contains(&s.connection_id))
        .collect();
    if !in_scope.is_empty() {
        let adjusted_total: Decimal = in_scope
            .iter()
            .map(|s| s.realized_pl.unwrap_or(Decimal::ZERO))
            .sum();
        let fifo_total: Decimal = st.iter().sum::<Decimal>() + lt.iter().sum::<Decimal>();
        let diff = (adjusted_total - fifo_total).abs();
        if diff >= Decimal::new(1, 2) {
            if fifo_total == Decimal::ZERO {
                st = zero_months();
                lt = zero_months();
                st[11] = adjusted_total;
                warnings.push(
                    "symbol summary total with no closure detail; booked to December".to_string(),
                );
            } else {
                let factor = adjusted_total / fifo_total;
                for v in st.iter_mut().chain(lt.iter_mut()) {
                    *v *= factor;
                }
            }
        }
    }
    (st, lt)
}

struct Resolver<'a> {
    inputs: &'a TaxInputs,
    doc: &'a DocOverrides,
    apply_overrides: bool,
    docs_primary: bool,
    sources: BTreeMap<String, SourceKind>,
}

impl<'a> Resolver<'a> {
    /// manual > docs > investor.
    fn resolve(&mut self, key: &str, base: Vec<Decimal>) -> Vec<Decimal> {
        if self.apply_overrides {
            if let Some(value) = self.inputs.manual_override(key) {
                self.sources.insert(key.to_string(), SourceKind::Manual);
                return clamp_month_value(value);
            }
            if self.docs_primary && self.doc.present(key) {
                self.sources.insert(key.to_string(), SourceKind::Docs);
                let total = self.doc.total_for(key);
                return vec![total / Decimal::from(12); 12];
            }
        }
        self.sources.insert(key.to_string(), SourceKind::Investor);
        base
    }

    /// Like `resolve`, but when documents and the ledger materially disagree
    /// the two are summed instead of documents replacing the ledger. Used
    /// for interest, where bank feeds and 1099-INTs routinely cover
    /// different accounts.
    fn resolve_additive(&mut self, key: &str, base: Vec<Decimal>) -> Vec<Decimal> {
        if self.apply_overrides {
            if let Some(value) = self.inputs.manual_override(key) {
                self.sources.insert(key.to_string(), SourceKind::Manual);
                return clamp_month_value(value);
            }
            if self.docs_primary && self.doc.present(key) {
                let doc_total = self.doc.total_for(key);
                let base_total: Decimal = base.iter().sum();
                if base_total <= Decimal::ZERO {
                    self.sources.insert(key.to_string(), SourceKind::Docs);
                    return vec![doc_total / Decimal::from(12); 12];
                }
                let diff = (doc_total - base_total).abs();
                let tolerance = Decimal::ONE.max(Decimal::new(1, 2) * doc_total.max(base_total));
                if diff <= tolerance {
                    self.sources.insert(key.to_string(), SourceKind::Docs);
                    return vec![doc_total / Decimal::from(12); 12];
                }
                self.sources
                    .insert(key.to_string(), SourceKind::DocsPlusInvestor);
                return vec![(doc_total + base_total) / Decimal::from(12); 12];
            }
        }
        self.sources.insert(key.to_string(), SourceKind::Investor);
        base
    }
}

fn ytd(series: &[Decimal], through: usize) -> Decimal {
    series.iter().take(through + 1).copied().sum()
}

fn dec_to_f64(v: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    v.to_f64().unwrap_or(0.0)
}

fn dec_from_f64(v: f64) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO)
}

/// Build the per-taxpayer monthly YTD tax projection.
///
/// Never errors on missing reference data: degraded categories are skipped
/// and reported through `warnings`, and the summary stays internally
/// consistent.
pub async fn build_tax_dashboard(
    store: &Store,
    config: &EngineConfig,
    year: i32,
    scope: DashboardScope,
    as_of: Option<NaiveDate>,
    apply_overrides: bool,
) -> AppResult<TaxDashboard> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or_default();
    let end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or_default();
    let as_of = as_of.unwrap_or_else(|| end.min(Utc::now().date_naive()));

    let profile = store.get_or_create_tax_profile(year).await?;
    let inputs = get_or_create_tax_inputs(store, year).await?;
    let params: TaxParams = load_tax_params(config, year, inputs.tax_parameter_overrides.as_ref());

    let mut warnings: Vec<String> = Vec::new();
    if params.filing(profile.filing_status).is_none() {
        warnings.push(format!(
            "no bracket table for {}; income tax degraded to zero",
            profile.filing_status.as_str()
        ));
    }

    let taxpayers = store.list_taxpayers().await?;
    let accounts = store.list_accounts().await?;
    let connections = store.list_connections().await?;
    let taxpayer_types: HashMap<i64, TaxpayerType> = taxpayers
        .iter()
        .map(|tp| (tp.id, tp.entity_type))
        .collect();
    let accounts_by_id: HashMap<i64, Account> =
        accounts.iter().cloned().map(|a| (a.id, a)).collect();

    let include_trust = match scope {
        DashboardScope::Trust => true,
        DashboardScope::Personal => false,
        DashboardScope::Household => profile.trust_income_taxable_to_user,
    };
    let sets = AccountSets::build(scope, include_trust, &accounts, &taxpayer_types);
    let trust_start = config.trust_start_for_year(year);
    let trust_begin = trust_start.unwrap_or(start);

    let scoped_taxpayers: Vec<_> = taxpayers
        .iter()
        .filter(|tp| scope.matches(tp.entity_type))
        .filter(|tp| include_trust || tp.entity_type != TaxpayerType::Trust)
        .cloned()
        .collect();
    let preferred_conn_ids: HashSet<i64> =
        preferred_connection_ids_for_scope(DashboardScope::Household, &scoped_taxpayers, &connections)
            .into_iter()
            .collect();
    let conn_taxpayer_types: HashMap<i64, TaxpayerType> = connections
        .iter()
        .map(|c| {
            (
                c.id,
                taxpayer_types
                    .get(&c.taxpayer_id)
                    .copied()
                    .unwrap_or(TaxpayerType::Personal),
            )
        })
        .collect();

    let transactions = store.transactions_in_range(start, end).await?;
    let income_events = store.income_events_in_range(start, end).await?;
    let tagged = store.tagged_transactions_in_range(start, end).await?;
    let closures = store.broker_lot_closures_in_range(start, end).await?;
    let summaries = store.broker_symbol_summaries_in_range(start, end).await?;
    let facts = store.confirmed_facts_for_year(year).await?;
    let doc_overrides = aggregate_doc_overrides(&facts);

    // --- investor-derived monthly series ----------------------------------

    let (mut ira_distributions, mut ira_withholding) =
        ira_flows_by_month(&transactions, &accounts_by_id, &taxpayer_types, &sets.ira);
    if inputs
        .ira_distributions_override_monthly
        .iter()
        .copied()
        .sum::<Decimal>()
        > Decimal::ZERO
    {
        ira_distributions = inputs.ira_distributions_override_monthly.clone();
    }
    if let Some(total) = inputs.ira_withholding_override {
        ira_withholding = vec![total / Decimal::from(12); 12];
    }

    let estimated_payments_tagged = tagged_by_month(
        &tagged,
        TagCategory::EstimatedTaxPayment,
        &sets.non_trust,
        &sets.trust,
        trust_begin,
    );
    let w2_withholding_tagged = tagged_by_month(
        &tagged,
        TagCategory::W2Withholding,
        &sets.non_trust,
        &sets.trust,
        trust_begin,
    );
    let business_income_tagged = tagged_by_month(
        &tagged,
        TagCategory::BusinessIncome,
        &sets.non_trust,
        &sets.trust,
        trust_begin,
    );
    let business_expense_tagged = tagged_by_month(
        &tagged,
        TagCategory::BusinessExpense,
        &sets.non_trust,
        &sets.trust,
        trust_begin,
    );
    let other_withholding = withholding_by_month(
        &transactions
            .iter()
            .filter(|t| {
                sets.non_trust_non_ira.contains(&t.account_id)
                    || sets.trust_non_ira.contains(&t.account_id)
            })
            .cloned()
            .collect::<Vec<_>>(),
        &income_events,
        &sets.non_trust_non_ira,
        &sets.trust_non_ira,
        trust_begin,
    );

    let mut interest_monthly = income_events_by_month(
        &income_events,
        &[IncomeType::Interest],
        &sets.non_trust_non_ira,
        &sets.trust_non_ira,
        trust_begin,
    );
    let mut dividends_monthly = income_events_by_month(
        &income_events,
        &[IncomeType::Dividend],
        &sets.non_trust_non_ira,
        &sets.trust_non_ira,
        trust_begin,
    );
    let fallback_div = transaction_div_int_by_month(
        &transactions,
        &income_events,
        &[TxnType::Div],
        &[IncomeType::Dividend],
        &sets.non_trust_non_ira,
        &sets.trust_non_ira,
        trust_begin,
    );
    let fallback_int = transaction_div_int_by_month(
        &transactions,
        &income_events,
        &[TxnType::Int],
        &[IncomeType::Interest],
        &sets.non_trust_non_ira,
        &sets.trust_non_ira,
        trust_begin,
    );
    for i in 0..12 {
        dividends_monthly[i] += fallback_div[i];
        interest_monthly[i] += fallback_int[i];
    }

    let (mut st_gains, mut lt_gains) = capital_gains_by_month(
        &closures,
        &summaries,
        &preferred_conn_ids,
        &conn_taxpayer_types,
        include_trust,
        trust_start,
        &mut warnings,
    );

    let mut business_net_profit = inputs.business_net_profit_monthly.clone();
    if business_net_profit.iter().map(|v| v.abs()).sum::<Decimal>() == Decimal::ZERO
        && business_income_tagged.iter().copied().sum::<Decimal>() > Decimal::ZERO
    {
        let ratio = dec_from_f64(inputs.business_expense_ratio);
        business_net_profit = (0..12)
            .map(|i| {
                let gross = business_income_tagged[i];
                let expense = business_expense_tagged[i];
                if expense > Decimal::ZERO {
                    gross - expense
                } else {
                    gross * (Decimal::ONE - ratio)
                }
            })
            .collect();
    }

    let trust_passthrough_gross = if include_trust {
        inputs.trust_passthrough_monthly.clone()
    } else {
        zero_months()
    };
    let trust_fees = if include_trust {
        inputs.trust_fees_monthly.clone()
    } else {
        zero_months()
    };
    let trust_passthrough: Vec<Decimal> = (0..12)
        .map(|i| (trust_passthrough_gross[i] - trust_fees[i]).max(Decimal::ZERO))
        .collect();

    // --- source precedence -------------------------------------------------

    let docs_primary = apply_overrides && inputs.docs_primary;
    let mut resolver = Resolver {
        inputs: &inputs,
        doc: &doc_overrides,
        apply_overrides,
        docs_primary,
        sources: BTreeMap::new(),
    };

    let w2_wages = resolver.resolve("w2_wages_total", inputs.w2_wages_monthly.clone());
    let w2_withholding =
        resolver.resolve("w2_withholding_total", inputs.w2_withholding_monthly.clone());
    let ira_distributions = resolver.resolve("ira_distributions_total", ira_distributions);
    let ira_withholding = resolver.resolve("ira_withholding_total", ira_withholding);

    let ira_distributions_gross: Vec<Decimal> = if docs_primary
        && doc_overrides.present("ira_distributions_total")
    {
        resolver
            .sources
            .insert("ira_distributions_gross_total".to_string(), SourceKind::Docs);
        if doc_overrides.ira_distributions_gross_total > Decimal::ZERO {
            vec![doc_overrides.ira_distributions_gross_total / Decimal::from(12); 12]
        } else {
            ira_distributions.clone()
        }
    } else {
        (0..12)
            .map(|i| ira_distributions[i] + ira_withholding[i])
            .collect()
    };

    let interest_monthly = resolver.resolve_additive("interest_total", interest_monthly);
    let dividends_monthly = resolver.resolve("dividends_ordinary_total", dividends_monthly);

    let mut qualified_dividend_pct = dec_from_f64(inputs.qualified_dividend_pct);
    let resolved_div_total: Decimal = dividends_monthly.iter().copied().sum();
    if apply_overrides && resolved_div_total > Decimal::ZERO {
        let div_source = resolver.sources.get("dividends_ordinary_total").copied();
        if matches!(div_source, Some(SourceKind::Manual) | Some(SourceKind::Docs)) {
            if let Some(value) = inputs.manual_override("dividends_qualified_total") {
                let manual: Decimal = serde_json::from_value(value.clone()).unwrap_or_default();
                qualified_dividend_pct =
                    (manual / resolved_div_total).clamp(Decimal::ZERO, Decimal::ONE);
                resolver
                    .sources
                    .insert("dividends_qualified_total".to_string(), SourceKind::Manual);
            } else if docs_primary
                && doc_overrides.present("dividends_qualified_total")
                && doc_overrides.dividends_qualified_total > Decimal::ZERO
            {
                qualified_dividend_pct = (doc_overrides.dividends_qualified_total
                    / resolved_div_total)
                    .clamp(Decimal::ZERO, Decimal::ONE);
                resolver
                    .sources
                    .insert("dividends_qualified_total".to_string(), SourceKind::Docs);
            } else {
                resolver
                    .sources
                    .insert("dividends_qualified_total".to_string(), SourceKind::Investor);
            }
        }
    }

    if apply_overrides {
        if let Some(value) = inputs.manual_override("cap_gain_dist_total") {
            let total: Decimal = serde_json::from_value(value.clone()).unwrap_or_default();
            for v in lt_gains.iter_mut() {
                *v += total / Decimal::from(12);
            }
            resolver
                .sources
                .insert("cap_gain_dist_total".to_string(), SourceKind::Manual);
        } else if docs_primary && doc_overrides.present("cap_gain_dist_total") {
            for v in lt_gains.iter_mut() {
                *v += doc_overrides.cap_gain_dist_total / Decimal::from(12);
            }
            resolver
                .sources
                .insert("cap_gain_dist_total".to_string(), SourceKind::Docs);
        } else {
            resolver
                .sources
                .insert("cap_gain_dist_total".to_string(), SourceKind::Investor);
        }
    }

    let k1_monthly = resolver.resolve("k1_total", zero_months());
    let aca_premium = inputs.aca_premium_monthly.clone();
    let aca_aptc = inputs.aca_aptc_monthly.clone();

    // --- estimated payments and withholding --------------------------------

    let mut est_payments_monthly = zero_months();
    for payment in &inputs.estimated_payments {
        if payment.date < start || payment.date > end || payment.amount == Decimal::ZERO {
            continue;
        }
        est_payments_monthly[month_index(payment.date)] += payment.amount.abs();
    }
    for i in 0..12 {
        est_payments_monthly[i] += estimated_payments_tagged[i];
    }

    let withholding_monthly: Vec<Decimal> = (0..12)
        .map(|i| {
            ira_withholding[i] + w2_withholding[i] + w2_withholding_tagged[i] + other_withholding[i]
        })
        .collect();

    // --- monthly projection -------------------------------------------------

    let empty_filing = params::FilingConfig::default();
    let filing_cfg = params.filing(profile.filing_status).unwrap_or(&empty_filing);
    let standard_deduction = filing_cfg.standard_deduction;
    let itemized_amount = profile.itemized_amount.unwrap_or(Decimal::ZERO);
    let deductions = match profile.deductions_mode {
        crate::store::DeductionsMode::Standard => standard_deduction,
        crate::store::DeductionsMode::Itemized => itemized_amount,
    };
    let niit_rate = dec_from_f64(inputs.niit_rate);
    let state_tax_rate = dec_from_f64(inputs.state_tax_rate);
    let safe_harbor_target =
        inputs.last_year_total_tax * dec_from_f64(inputs.safe_harbor_multiplier);

    let mut monthly_rows: Vec<MonthlyRow> = Vec::with_capacity(12);
    let mut paid_ytd_by_month: Vec<Decimal> = Vec::with_capacity(12);
    for idx in 0..12 {
        let ytd_ordinary = ytd(&ira_distributions, idx)
            + ytd(&business_net_profit, idx)
            + ytd(&w2_wages, idx)
            + ytd(&trust_passthrough, idx)
            + ytd(&k1_monthly, idx)
            + ytd(&interest_monthly, idx);
        let ytd_st = ytd(&st_gains, idx);
        let ytd_lt = ytd(&lt_gains, idx);
        let ytd_div = ytd(&dividends_monthly, idx);

        let (se_tax, se_deduction) = params::compute_se_tax(
            ytd(&business_net_profit, idx),
            &params,
            profile.filing_status,
        );
        let breakdown = params::compute_tax_breakdown(
            ytd_ordinary,
            ytd_st,
            ytd_lt,
            ytd_div,
            qualified_dividend_pct,
            deductions,
            se_deduction,
            profile.filing_status,
            &params,
            inputs.niit_enabled,
            niit_rate,
        );
        let income_tax = breakdown.ordinary_tax + breakdown.ltcg_tax + breakdown.niit_tax;
        let state_tax =
            (breakdown.ordinary_taxable + breakdown.ltcg_taxable).max(Decimal::ZERO) * state_tax_rate;
        let tax_ytd = income_tax + se_tax + state_tax;

        let paid_ytd = ytd(&withholding_monthly, idx) + ytd(&est_payments_monthly, idx);
        paid_ytd_by_month.push(paid_ytd);

        let run_rate_tax = tax_ytd / Decimal::from(idx as i64 + 1) * Decimal::from(12);

        let mut flags: Vec<String> = Vec::new();
        if safe_harbor_target > Decimal::ZERO {
            let prorated =
                safe_harbor_target * Decimal::from(idx as i64 + 1) / Decimal::from(12);
            if paid_ytd < prorated {
                flags.push("behind safe harbor".to_string());
            }
        }
        if paid_ytd < tax_ytd * Decimal::new(9, 1) {
            flags.push("withholding shortfall".to_string());
        }
        if (st_gains[idx] + lt_gains[idx]).abs() >= LARGE_CAP_GAINS_MONTH {
            flags.push("large cap gains month".to_string());
        }

        monthly_rows.push(MonthlyRow {
            month: idx as u32 + 1,
            label: MONTH_LABELS[idx].to_string(),
            ordinary_ytd: ytd_ordinary,
            st_gains_ytd: ytd_st,
            lt_gains_ytd: ytd_lt,
            dividends_ytd: ytd_div,
            tax_ytd,
            paid_ytd,
            remaining_ytd: tax_ytd - paid_ytd,
            run_rate_tax,
            flags,
        });
    }

    // --- year totals and summary -------------------------------------------

    let total = |series: &[Decimal]| -> Decimal { series.iter().copied().sum() };
    let ordinary_income_total = total(&ira_distributions)
        + total(&business_net_profit)
        + total(&w2_wages)
        + total(&trust_passthrough)
        + total(&k1_monthly)
        + total(&interest_monthly);
    let st_total = total(&st_gains);
    let lt_total = total(&lt_gains);
    let dividends_total = total(&dividends_monthly);

    let (se_tax_total, se_deduction_total) =
        params::compute_se_tax(total(&business_net_profit), &params, profile.filing_status);
    let breakdown_total = params::compute_tax_breakdown(
        ordinary_income_total,
        st_total,
        lt_total,
        dividends_total,
        qualified_dividend_pct,
        deductions,
        se_deduction_total,
        profile.filing_status,
        &params,
        inputs.niit_enabled,
        niit_rate,
    );
    let income_tax_total =
        breakdown_total.ordinary_tax + breakdown_total.ltcg_tax + breakdown_total.niit_tax;
    let state_tax_total = (breakdown_total.ordinary_taxable + breakdown_total.ltcg_taxable)
        .max(Decimal::ZERO)
        * state_tax_rate;
    let total_tax = income_tax_total + se_tax_total + state_tax_total;
    let taxable_income_total = breakdown_total.ordinary_taxable + breakdown_total.ltcg_taxable;
    let gross_income_total = ordinary_income_total + dividends_total + st_total + lt_total;

    let as_of_idx = (as_of.month0() as usize).min(11);
    let paid_ytd = paid_ytd_by_month.get(as_of_idx).copied().unwrap_or(Decimal::ZERO);
    let remaining_due = total_tax - paid_ytd;
    let safe_harbor_paid_target = if safe_harbor_target > Decimal::ZERO {
        safe_harbor_target * Decimal::from(as_of_idx as i64 + 1) / Decimal::from(12)
    } else {
        Decimal::ZERO
    };
    let safe_harbor_status = if safe_harbor_target > Decimal::ZERO && paid_ytd < safe_harbor_paid_target
    {
        "behind"
    } else {
        "on track"
    };
    if safe_harbor_target == Decimal::ZERO {
        warnings.push("no last-year tax on file; safe harbor defaults to on track".to_string());
    }

    let fpl = params.fpl.base
        + params.fpl.per_additional * Decimal::from((profile.household_size - 1).max(0));
    let mut magi_estimate = ordinary_income_total + st_total + lt_total;
    if let Some(magi) = inputs.magi_override {
        magi_estimate = magi;
    }
    let fpl_ratio = if fpl > Decimal::ZERO {
        dec_to_f64(magi_estimate / fpl)
    } else {
        0.0
    };
    let aca_indicator = if !inputs.aca_enabled {
        "disabled"
    } else if fpl_ratio >= 4.0 {
        "likely payback"
    } else if fpl_ratio > 0.0 && fpl_ratio <= 1.5 {
        "likely extra credit"
    } else {
        "neutral"
    };

    let summary = TaxSummary {
        year,
        filing_status: profile.filing_status.as_str().to_string(),
        state_tax_rate: inputs.state_tax_rate,
        deductions_mode: profile.deductions_mode.as_str().to_string(),
        deductions,
        standard_deduction,
        itemized_amount,
        ordinary_income: ordinary_income_total + dividends_total,
        ordinary_breakdown: OrdinaryBreakdown {
            ira_distributions: total(&ira_distributions_gross),
            ira_distributions_net: total(&ira_distributions),
            w2_wages: total(&w2_wages),
            business_net_profit: total(&business_net_profit),
            trust_passthrough: total(&trust_passthrough),
            trust_passthrough_gross: total(&trust_passthrough_gross),
            trust_fees: total(&trust_fees),
            k1_income: total(&k1_monthly),
            interest: total(&interest_monthly),
            dividends: dividends_total,
        },
        capital_gains: CapitalGainsSummary {
            st: st_total,
            lt: lt_total,
        },
        se_tax: se_tax_total,
        se_deduction: se_deduction_total,
        taxable_ordinary: breakdown_total.ordinary_taxable,
        taxable_ltcg: breakdown_total.ltcg_taxable,
        ordinary_tax: breakdown_total.ordinary_tax,
        ltcg_tax: breakdown_total.ltcg_tax,
        niit_tax: breakdown_total.niit_tax,
        qualified_dividends: breakdown_total.qualified_dividends,
        non_qualified_dividends: breakdown_total.nonqualified_dividends,
        state_tax: state_tax_total,
        total_tax,
        taxable_income_total,
        gross_income_total,
        effective_tax_rate: if taxable_income_total > Decimal::ZERO {
            dec_to_f64(total_tax / taxable_income_total)
        } else {
            0.0
        },
        effective_tax_rate_gross: if gross_income_total > Decimal::ZERO {
            dec_to_f64(total_tax / gross_income_total)
        } else {
            0.0
        },
        paid_ytd,
        remaining_due,
        safe_harbor_target,
        safe_harbor_paid_target,
        safe_harbor_status: safe_harbor_status.to_string(),
        withholding_ytd: ytd(&withholding_monthly, as_of_idx),
        ira_withholding_ytd: ytd(&ira_withholding, as_of_idx),
        w2_withholding_ytd: ytd(&w2_withholding, as_of_idx) + ytd(&w2_withholding_tagged, as_of_idx),
        other_withholding_ytd: ytd(&other_withholding, as_of_idx),
        estimated_payments_ytd: ytd(&est_payments_monthly, as_of_idx),
        aca: AcaSummary {
            enabled: inputs.aca_enabled,
            premium_paid: total(&aca_premium),
            aptc_received: total(&aca_aptc),
            magi_estimate,
            fpl_ratio,
            indicator: aca_indicator.to_string(),
        },
        child_credit_est: params.child_credit.per_child * Decimal::from(profile.dependents_count),
        docs_primary,
        docs_present: doc_overrides.any_present(),
    };

    debug!(year, ?scope, total_tax = %summary.total_tax, "tax dashboard built");

    Ok(TaxDashboard {
        year,
        scope,
        profile,
        summary,
        monthly: monthly_rows,
        sources: resolver.sources,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_db, initialize_schema};
    use crate::store::{database as db_ops, FactType, FilingStatus, NewTransaction, TxnLinks};
    use rust_decimal_macros::dec;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    async fn test_env() -> (Store, EngineConfig, i64, i64) {
        let pool = create_memory_db().await.unwrap();
        initialize_schema(&pool).await.unwrap();
        let store = Store::new(pool);
        let tp = store
            .insert_taxpayer("Personal", TaxpayerType::Personal)
            .await
            .unwrap();
        let acct = store
            .insert_account("Brokerage", "IB", AccountType::Taxable, tp)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("2025.json"),
            r#"{
                "filing_status": {
                    "MFJ": {
                        "standard_deduction": 29200,
                        "ordinary_brackets": [{"up_to": 23200, "rate": 0.10}, {"up_to": null, "rate": 0.22}],
                        "ltcg_brackets": [{"up_to": 94050, "rate": 0.0}, {"up_to": null, "rate": 0.15}]
                    }
                },
                "fpl": {"base": 15060, "per_additional": 5380},
                "child_credit": {"per_child": 2000}
            }"#,
        )
        .unwrap();
        let config = EngineConfig {
            tax_params_dir: dir.path().to_path_buf(),
            tax_params_fallback_year: 2025,
            ..Default::default()
        };
        // Leak the tempdir so the params file survives the whole test.
        std::mem::forget(dir);
        (store, config, tp, acct)
    }

    #[tokio::test]
    async fn document_facts_replace_investor_wages_when_docs_primary() {
        let (store, config, _tp, acct) = test_env().await;

        // Investor-derived monthly wages: 1000/month = 12,000.
        let mut inputs = TaxInputs {
            w2_wages_monthly: vec![dec!(1000); 12],
            ..Default::default()
        };
        inputs.docs_primary = true;
        store
            .put_tax_inputs(2025, &serde_json::to_value(&inputs).unwrap())
            .await
            .unwrap();

        // Confirmed authoritative W-2 says 24,000.
        store
            .insert_tax_fact(
                2025,
                FactType::W2Wages,
                Some(dec!(24000)),
                None,
                None,
                Some("W2"),
                true,
                true,
            )
            .await
            .unwrap();
        let _ = acct;

        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 12, 31)),
            true,
        )
        .await
        .unwrap();
        assert_eq!(dashboard.summary.ordinary_breakdown.w2_wages, dec!(24000));
        assert_eq!(
            dashboard.sources.get("w2_wages_total"),
            Some(&SourceKind::Docs)
        );
        assert!(dashboard.summary.docs_present);

        // With overrides off, the investor number stands.
        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 12, 31)),
            false,
        )
        .await
        .unwrap();
        assert_eq!(dashboard.summary.ordinary_breakdown.w2_wages, dec!(12000));
        assert_eq!(
            dashboard.sources.get("w2_wages_total"),
            Some(&SourceKind::Investor)
        );
    }

    #[tokio::test]
    async fn interest_disagreement_is_additive() {
        let (store, config, _tp, acct) = test_env().await;

        // Ledger interest: 600 for the year via INT transactions.
        db_ops::insert_transaction(
            store.pool(),
            &NewTransaction {
                account_id: acct,
                date: d(2025, 3, 10),
                txn_type: TxnType::Int,
                ticker: None,
                qty: None,
                amount: dec!(600),
                links: TxnLinks {
                    description: Some("CREDIT INTEREST".to_string()),
                    ..Default::default()
                },
            },
        )
        .await
        .unwrap();

        // A 1099-INT covering a different bank reports 5,000.
        store
            .insert_tax_fact(
                2025,
                FactType::Interest,
                Some(dec!(5000)),
                None,
                None,
                Some("1099-INT"),
                true,
                true,
            )
            .await
            .unwrap();

        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 12, 31)),
            true,
        )
        .await
        .unwrap();
        assert_eq!(
            dashboard.sources.get("interest_total"),
            Some(&SourceKind::DocsPlusInvestor)
        );
        assert_eq!(dashboard.summary.ordinary_breakdown.interest, dec!(5600));
    }

    #[tokio::test]
    async fn manual_override_beats_documents() {
        let (store, config, _tp, _acct) = test_env().await;

        let mut inputs = TaxInputs::default();
        inputs
            .tax_manual_overrides
            .insert("w2_wages_total".to_string(), serde_json::json!(36000));
        store
            .put_tax_inputs(2025, &serde_json::to_value(&inputs).unwrap())
            .await
            .unwrap();
        store
            .insert_tax_fact(
                2025,
                FactType::W2Wages,
                Some(dec!(24000)),
                None,
                None,
                Some("W2"),
                true,
                true,
            )
            .await
            .unwrap();

        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 12, 31)),
            true,
        )
        .await
        .unwrap();
        assert_eq!(dashboard.summary.ordinary_breakdown.w2_wages, dec!(36000));
        assert_eq!(
            dashboard.sources.get("w2_wages_total"),
            Some(&SourceKind::Manual)
        );
    }

    #[tokio::test]
    async fn unconfirmed_facts_are_invisible() {
        let (store, config, _tp, _acct) = test_env().await;
        store
            .insert_tax_fact(
                2025,
                FactType::W2Wages,
                Some(dec!(24000)),
                None,
                None,
                Some("W2"),
                false,
                true,
            )
            .await
            .unwrap();

        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 12, 31)),
            true,
        )
        .await
        .unwrap();
        assert!(!dashboard.summary.docs_present);
        assert_eq!(
            dashboard.sources.get("w2_wages_total"),
            Some(&SourceKind::Investor)
        );
    }

    #[tokio::test]
    async fn monthly_rows_accumulate_and_flag_shortfalls() {
        let (store, config, _tp, _acct) = test_env().await;
        let inputs = TaxInputs {
            w2_wages_monthly: vec![dec!(10000); 12],
            last_year_total_tax: dec!(12000),
            ..Default::default()
        };
        store
            .put_tax_inputs(2025, &serde_json::to_value(&inputs).unwrap())
            .await
            .unwrap();

        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 6, 30)),
            true,
        )
        .await
        .unwrap();

        assert_eq!(dashboard.monthly.len(), 12);
        assert_eq!(dashboard.monthly[0].ordinary_ytd, dec!(10000));
        assert_eq!(dashboard.monthly[11].ordinary_ytd, dec!(120000));
        // Nothing was paid: both safe-harbor and shortfall flags fire.
        let flags = &dashboard.monthly[5].flags;
        assert!(flags.contains(&"behind safe harbor".to_string()));
        assert!(flags.contains(&"withholding shortfall".to_string()));
        assert_eq!(dashboard.summary.safe_harbor_status, "behind");
        assert!(dashboard.summary.total_tax > Decimal::ZERO);
    }

    #[tokio::test]
    async fn missing_brackets_degrade_with_warning() {
        let (store, config, _tp, _acct) = test_env().await;
        let mut profile = store.get_or_create_tax_profile(2025).await.unwrap();
        profile.filing_status = FilingStatus::Single;
        store.update_tax_profile(&profile).await.unwrap();

        let dashboard = build_tax_dashboard(
            &store,
            &config,
            2025,
            DashboardScope::Household,
            Some(d(2025, 12, 31)),
            true,
        )
        .await
        .unwrap();
        assert!(dashboard
            .warnings
            .iter()
            .any(|w| w.contains("no bracket table")));
        assert_eq!(dashboard.summary.ordinary_tax, Decimal::ZERO);
    }
}
