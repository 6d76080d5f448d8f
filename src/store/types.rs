use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxpayerType {
    Trust,
    Personal,
}

impl TaxpayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaxpayerType::Trust => "TRUST",
            TaxpayerType::Personal => "PERSONAL",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRUST" => TaxpayerType::Trust,
            _ => TaxpayerType::Personal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxpayerEntity {
    pub id: i64,
    pub name: String,
    pub entity_type: TaxpayerType,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Taxable,
    Ira,
    Other,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Taxable => "TAXABLE",
            AccountType::Ira => "IRA",
            AccountType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "TAXABLE" => AccountType::Taxable,
            "IRA" => AccountType::Ira,
            _ => AccountType::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub broker: String,
    pub account_type: AccountType,
    pub taxpayer_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstituteGroup {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub id: i64,
    pub ticker: String,
    pub name: String,
    pub asset_class: String,
    pub expense_ratio: f64,
    pub substitute_group_id: Option<i64>,
    pub metadata: Value,
}

/// Canonical transaction types, ordered by specificity: `Other` is strictly
/// less specific than every named type, and upserts may only move a row from
/// `Other` toward a named type (never back).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnType {
    Buy,
    Sell,
    Div,
    Int,
    Fee,
    Withholding,
    Transfer,
    Other,
}

impl TxnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnType::Buy => "BUY",
            TxnType::Sell => "SELL",
            TxnType::Div => "DIV",
            TxnType::Int => "INT",
            TxnType::Fee => "FEE",
            TxnType::Withholding => "WITHHOLDING",
            TxnType::Transfer => "TRANSFER",
            TxnType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => TxnType::Buy,
            "SELL" => TxnType::Sell,
            "DIV" => TxnType::Div,
            "INT" => TxnType::Int,
            "FEE" => TxnType::Fee,
            "WITHHOLDING" => TxnType::Withholding,
            "TRANSFER" => TxnType::Transfer,
            _ => TxnType::Other,
        }
    }

    pub fn is_specific(&self) -> bool {
        !matches!(self, TxnType::Other)
    }
}

/// Provider-side linkage and audit detail carried on every transaction.
/// Kept as a typed struct (serialized to the `links` JSON column) instead of
/// a stringly-keyed map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxnLinks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_txn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basis_total: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquisition_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
}

impl TxnLinks {
    /// Upper-cased description + additional detail, the text the keyword
    /// heuristics run over.
    pub fn text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(d) = self.description.as_deref() {
            parts.push(d);
        }
        if let Some(a) = self.additional_detail.as_deref() {
            parts.push(a);
        }
        parts.join(" ").to_ascii_uppercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    pub date: NaiveDate,
    pub txn_type: TxnType,
    pub ticker: Option<String>,
    pub qty: Option<Decimal>,
    pub amount: Decimal,
    pub links: TxnLinks,
}

/// A transaction about to be inserted (no id yet).
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: i64,
    pub date: NaiveDate,
    pub txn_type: TxnType,
    pub ticker: Option<String>,
    pub qty: Option<Decimal>,
    pub amount: Decimal,
    pub links: TxnLinks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomeType {
    Dividend,
    Interest,
    Withholding,
    Fee,
    Other,
}

impl IncomeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncomeType::Dividend => "DIVIDEND",
            IncomeType::Interest => "INTEREST",
            IncomeType::Withholding => "WITHHOLDING",
            IncomeType::Fee => "FEE",
            IncomeType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIVIDEND" => IncomeType::Dividend,
            "INTEREST" => IncomeType::Interest,
            "WITHHOLDING" => IncomeType::Withholding,
            "FEE" => IncomeType::Fee,
            _ => IncomeType::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeEvent {
    pub id: i64,
    pub account_id: i64,
    pub date: NaiveDate,
    pub income_type: IncomeType,
    pub ticker: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashBalance {
    pub id: i64,
    pub account_id: i64,
    pub as_of_date: NaiveDate,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Active,
    Disabled,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Disabled => "DISABLED",
            ConnectionStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => ConnectionStatus::Active,
            "DISABLED" => ConnectionStatus::Disabled,
            _ => ConnectionStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnection {
    pub id: i64,
    pub name: String,
    pub provider: String,
    pub broker: String,
    pub connector: Option<String>,
    pub taxpayer_id: i64,
    pub status: ConnectionStatus,
    pub metadata: Value,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub last_successful_txn_end: Option<NaiveDate>,
    pub txn_earliest_available: Option<NaiveDate>,
    pub holdings_last_asof: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub coverage_status: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Partial,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Partial => "PARTIAL",
            SyncStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => SyncStatus::Success,
            "PARTIAL" => SyncStatus::Partial,
            _ => SyncStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "FULL",
            SyncMode::Incremental => "INCREMENTAL",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "FULL" => SyncMode::Full,
            _ => SyncMode::Incremental,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub connection_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub mode: SyncMode,
    pub actor: String,
    pub requested_start: Option<NaiveDate>,
    pub requested_end: Option<NaiveDate>,
    pub effective_start: Option<NaiveDate>,
    pub effective_end: Option<NaiveDate>,
    pub pages_fetched: i64,
    pub txn_count: i64,
    pub new_count: i64,
    pub dupes_count: i64,
    pub parse_fail_count: i64,
    pub missing_symbol_count: i64,
    pub error: Option<String>,
    pub coverage: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAccountMap {
    pub id: i64,
    pub connection_id: i64,
    pub provider_account_id: String,
    pub account_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTransactionMap {
    pub id: i64,
    pub connection_id: i64,
    pub provider_txn_id: String,
    pub transaction_id: i64,
}

/// One position row inside a holdings snapshot payload. `is_total` rows carry
/// account/statement valuation only and are never counted as positions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoldingItem {
    pub provider_account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_basis_total: Option<Decimal>,
    #[serde(default)]
    pub is_total: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoldingsPayload {
    pub items: Vec<HoldingItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cash: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalHoldingSnapshot {
    pub id: i64,
    pub connection_id: i64,
    pub as_of: DateTime<Utc>,
    pub derived: bool,
    pub payload: HoldingsPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFileIngest {
    pub id: i64,
    pub connection_id: i64,
    pub kind: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_bytes: Option<i64>,
    pub imported_at: DateTime<Utc>,
    pub start_date_hint: Option<NaiveDate>,
    pub end_date_hint: Option<NaiveDate>,
}

/// Broker-supplied closed-lot row (e.g. a flex FIFO performance row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerLotClosure {
    pub id: i64,
    pub connection_id: i64,
    pub provider_account_id: String,
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub open_date_raw: Option<String>,
    pub quantity_closed: Decimal,
    pub cost_basis: Option<Decimal>,
    pub realized_pl: Option<Decimal>,
    pub proceeds: Option<Decimal>,
    pub trade_id: Option<String>,
    pub source_file_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSymbolSummary {
    pub id: i64,
    pub connection_id: i64,
    pub provider_account_id: String,
    pub symbol: String,
    pub as_of_date: NaiveDate,
    pub quantity: Option<Decimal>,
    pub cost_basis: Option<Decimal>,
    pub proceeds: Option<Decimal>,
    pub realized_pl: Option<Decimal>,
    pub source_file_hash: String,
    pub source_row: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotSource {
    Reconstructed,
    Authoritative,
}

impl LotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotSource::Reconstructed => "RECONSTRUCTED",
            LotSource::Authoritative => "AUTHORITATIVE",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTHORITATIVE" => LotSource::Authoritative,
            _ => LotSource::Reconstructed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxLot {
    pub id: i64,
    pub taxpayer_id: i64,
    pub account_id: i64,
    pub security_id: i64,
    pub acquired_date: NaiveDate,
    pub quantity_open: Decimal,
    pub basis_open: Option<Decimal>,
    pub source: LotSource,
    pub created_from_txn_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Term {
    St,
    Lt,
    Unknown,
}

impl Term {
    pub fn as_str(&self) -> &'static str {
        match self {
            Term::St => "ST",
            Term::Lt => "LT",
            Term::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ST" => Term::St,
            "LT" => Term::Lt,
            _ => Term::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotDisposal {
    pub id: i64,
    /// None for gains realized without a sale row, e.g. merger cash in lieu
    /// exceeding the remaining basis.
    pub sell_txn_id: Option<i64>,
    /// None when the sale could not be matched to any open lot (missing
    /// history); such disposals carry term UNKNOWN and no basis.
    pub tax_lot_id: Option<i64>,
    pub quantity_sold: Decimal,
    pub proceeds_allocated: Decimal,
    pub basis_allocated: Option<Decimal>,
    pub realized_gain: Option<Decimal>,
    pub term: Term,
    pub as_of_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WashStatus {
    Applied,
    Flagged,
}

impl WashStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WashStatus::Applied => "APPLIED",
            WashStatus::Flagged => "FLAGGED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "FLAGGED" => WashStatus::Flagged,
            _ => WashStatus::Applied,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WashSaleAdjustment {
    pub id: i64,
    pub loss_sale_txn_id: i64,
    pub replacement_buy_txn_id: Option<i64>,
    pub replacement_lot_id: Option<i64>,
    pub deferred_loss: Decimal,
    pub basis_increase: Decimal,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub status: WashStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorporateActionType {
    Split,
    ReverseSplit,
    Merger,
    Other(String),
}

impl CorporateActionType {
    pub fn as_str(&self) -> &str {
        match self {
            CorporateActionType::Split => "SPLIT",
            CorporateActionType::ReverseSplit => "REVERSE_SPLIT",
            CorporateActionType::Merger => "MERGER",
            CorporateActionType::Other(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPLIT" => CorporateActionType::Split,
            "REVERSE_SPLIT" => CorporateActionType::ReverseSplit,
            "MERGER" => CorporateActionType::Merger,
            other => CorporateActionType::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorporateActionEvent {
    pub id: i64,
    pub taxpayer_id: i64,
    pub account_id: Option<i64>,
    pub security_id: Option<i64>,
    pub action_date: NaiveDate,
    pub action_type: CorporateActionType,
    pub ratio: Option<Decimal>,
    pub applied: bool,
    pub apply_notes: Option<String>,
    pub details: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagCategory {
    IraDistribution,
    IraWithholding,
    EstimatedTaxPayment,
    W2Withholding,
    TrustDistribution,
    BusinessIncome,
    BusinessExpense,
}

impl TagCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagCategory::IraDistribution => "IRA_DISTRIBUTION",
            TagCategory::IraWithholding => "IRA_WITHHOLDING",
            TagCategory::EstimatedTaxPayment => "ESTIMATED_TAX_PAYMENT",
            TagCategory::W2Withholding => "W2_WITHHOLDING",
            TagCategory::TrustDistribution => "TRUST_DISTRIBUTION",
            TagCategory::BusinessIncome => "BUSINESS_INCOME",
            TagCategory::BusinessExpense => "BUSINESS_EXPENSE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IRA_DISTRIBUTION" => Some(TagCategory::IraDistribution),
            "IRA_WITHHOLDING" => Some(TagCategory::IraWithholding),
            "ESTIMATED_TAX_PAYMENT" => Some(TagCategory::EstimatedTaxPayment),
            "W2_WITHHOLDING" => Some(TagCategory::W2Withholding),
            "TRUST_DISTRIBUTION" => Some(TagCategory::TrustDistribution),
            "BUSINESS_INCOME" => Some(TagCategory::BusinessIncome),
            "BUSINESS_EXPENSE" => Some(TagCategory::BusinessExpense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxTag {
    pub id: i64,
    pub transaction_id: i64,
    pub category: TagCategory,
    pub note: Option<String>,
}

/// Extracted tax-document fact types the dashboard consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactType {
    W2Wages,
    W2Withholding,
    IraDistributions,
    IraDistributionsGross,
    IraWithholding,
    Interest,
    DividendsOrdinary,
    DividendsQualified,
    CapGainDist,
    K1Ordinary,
    K1Interest,
    K1Dividends,
    K1Rental,
    K1Other,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::W2Wages => "W2_WAGES",
            FactType::W2Withholding => "W2_WITHHOLDING",
            FactType::IraDistributions => "IRA_DISTRIBUTIONS",
            FactType::IraDistributionsGross => "IRA_DISTRIBUTIONS_GROSS",
            FactType::IraWithholding => "IRA_WITHHOLDING",
            FactType::Interest => "INTEREST",
            FactType::DividendsOrdinary => "DIVIDENDS_ORDINARY",
            FactType::DividendsQualified => "DIVIDENDS_QUALIFIED",
            FactType::CapGainDist => "CAP_GAIN_DIST",
            FactType::K1Ordinary => "K1_ORDINARY",
            FactType::K1Interest => "K1_INTEREST",
            FactType::K1Dividends => "K1_DIVIDENDS",
            FactType::K1Rental => "K1_RENTAL",
            FactType::K1Other => "K1_OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "W2_WAGES" => Some(FactType::W2Wages),
            "W2_WITHHOLDING" => Some(FactType::W2Withholding),
            "IRA_DISTRIBUTIONS" => Some(FactType::IraDistributions),
            "IRA_DISTRIBUTIONS_GROSS" => Some(FactType::IraDistributionsGross),
            "IRA_WITHHOLDING" => Some(FactType::IraWithholding),
            "INTEREST" => Some(FactType::Interest),
            "DIVIDENDS_ORDINARY" => Some(FactType::DividendsOrdinary),
            "DIVIDENDS_QUALIFIED" => Some(FactType::DividendsQualified),
            "CAP_GAIN_DIST" => Some(FactType::CapGainDist),
            "K1_ORDINARY" => Some(FactType::K1Ordinary),
            "K1_INTEREST" => Some(FactType::K1Interest),
            "K1_DIVIDENDS" => Some(FactType::K1Dividends),
            "K1_RENTAL" => Some(FactType::K1Rental),
            "K1_OTHER" => Some(FactType::K1Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxFact {
    pub id: i64,
    pub tax_year: i32,
    pub fact_type: FactType,
    pub amount: Option<Decimal>,
    pub amount_monthly: Option<Vec<f64>>,
    pub owner_entity: Option<String>,
    pub doc_type: Option<String>,
    pub confirmed: bool,
    pub authoritative: bool,
    pub is_corrected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilingStatus {
    Mfj,
    Mfs,
    Single,
    Hoh,
}

impl FilingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilingStatus::Mfj => "MFJ",
            FilingStatus::Mfs => "MFS",
            FilingStatus::Single => "SINGLE",
            FilingStatus::Hoh => "HOH",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "MFS" => FilingStatus::Mfs,
            "SINGLE" => FilingStatus::Single,
            "HOH" => FilingStatus::Hoh,
            _ => FilingStatus::Mfj,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeductionsMode {
    Standard,
    Itemized,
}

impl DeductionsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeductionsMode::Standard => "standard",
            DeductionsMode::Itemized => "itemized",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "itemized" => DeductionsMode::Itemized,
            _ => DeductionsMode::Standard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxProfile {
    pub id: i64,
    pub year: i32,
    pub filing_status: FilingStatus,
    pub state_code: Option<String>,
    pub deductions_mode: DeductionsMode,
    pub itemized_amount: Option<Decimal>,
    pub household_size: i64,
    pub dependents_count: i64,
    pub trust_income_taxable_to_user: bool,
}
