use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AppResult;
use crate::store::Store;

/// A dated estimated-tax payment entered by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatedPayment {
    pub date: NaiveDate,
    pub amount: Decimal,
}

/// Per-year manual inputs to the dashboard. Stored as one JSON blob per
/// year; every field has a default so partially-filled rows normalize
/// cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxInputs {
    /// Manual monthly net profit of the household side business.
    pub business_net_profit_monthly: Vec<Decimal>,
    /// Expense ratio used to synthesize net profit from tagged gross income.
    pub business_expense_ratio: f64,
    pub w2_wages_monthly: Vec<Decimal>,
    pub w2_withholding_monthly: Vec<Decimal>,
    pub trust_passthrough_monthly: Vec<Decimal>,
    pub trust_fees_monthly: Vec<Decimal>,
    pub ira_withholding_override: Option<Decimal>,
    pub ira_distributions_override_monthly: Vec<Decimal>,
    pub estimated_payments: Vec<EstimatedPayment>,
    pub aca_premium_monthly: Vec<Decimal>,
    pub aca_aptc_monthly: Vec<Decimal>,
    pub aca_enabled: bool,
    /// Prefer confirmed document facts over investor-derived sums.
    pub docs_primary: bool,
    /// Per-category manual overrides: scalar totals or 12-entry lists.
    pub tax_manual_overrides: HashMap<String, Value>,
    pub state_tax_rate: f64,
    pub qualified_dividend_pct: f64,
    pub niit_enabled: bool,
    pub niit_rate: f64,
    pub last_year_total_tax: Decimal,
    pub safe_harbor_multiplier: f64,
    pub magi_override: Option<Decimal>,
    /// Deep-merged over the year's parameter file.
    pub tax_parameter_overrides: Option<Value>,
}

impl Default for TaxInputs {
    fn default() -> Self {
        Self {
            business_net_profit_monthly: zero_months(),
            business_expense_ratio: 0.3,
            w2_wages_monthly: zero_months(),
            w2_withholding_monthly: zero_months(),
            trust_passthrough_monthly: zero_months(),
            trust_fees_monthly: zero_months(),
            ira_withholding_override: None,
            ira_distributions_override_monthly: zero_months(),
            estimated_payments: Vec::new(),
            aca_premium_monthly: zero_months(),
            aca_aptc_monthly: zero_months(),
            aca_enabled: true,
            docs_primary: true,
            tax_manual_overrides: HashMap::new(),
            state_tax_rate: 0.0,
            qualified_dividend_pct: 0.0,
            niit_enabled: true,
            niit_rate: 0.038,
            last_year_total_tax: Decimal::ZERO,
            safe_harbor_multiplier: 1.0,
            magi_override: None,
            tax_parameter_overrides: None,
        }
    }
}

pub fn zero_months() -> Vec<Decimal> {
    vec![Decimal::ZERO; 12]
}

/// Truncate or zero-pad to exactly twelve entries.
pub fn clamp_month_list(values: &[Decimal]) -> Vec<Decimal> {
    let mut out: Vec<Decimal> = values.iter().copied().take(12).collect();
    out.resize(12, Decimal::ZERO);
    out
}

pub fn clamp_month_value(value: &Value) -> Vec<Decimal> {
    match value {
        Value::Array(items) => {
            let decimals: Vec<Decimal> = items
                .iter()
                .map(|v| serde_json::from_value::<Decimal>(v.clone()).unwrap_or_default())
                .collect();
            clamp_month_list(&decimals)
        }
        other => {
            let total: Decimal = serde_json::from_value(other.clone()).unwrap_or_default();
            vec![total / Decimal::from(12); 12]
        }
    }
}

impl TaxInputs {
    /// Clamp vectors and ratios into their valid ranges.
    pub fn normalize(mut self) -> Self {
        self.business_net_profit_monthly = clamp_month_list(&self.business_net_profit_monthly);
        self.w2_wages_monthly = clamp_month_list(&self.w2_wages_monthly);
        self.w2_withholding_monthly = clamp_month_list(&self.w2_withholding_monthly);
        self.trust_passthrough_monthly = clamp_month_list(&self.trust_passthrough_monthly);
        self.trust_fees_monthly = clamp_month_list(&self.trust_fees_monthly);
        self.ira_distributions_override_monthly =
            clamp_month_list(&self.ira_distributions_override_monthly);
        self.aca_premium_monthly = clamp_month_list(&self.aca_premium_monthly);
        self.aca_aptc_monthly = clamp_month_list(&self.aca_aptc_monthly);
        self.business_expense_ratio = self.business_expense_ratio.clamp(0.0, 1.0);
        self.qualified_dividend_pct = self.qualified_dividend_pct.clamp(0.0, 1.0);
        if self.safe_harbor_multiplier <= 0.0 {
            self.safe_harbor_multiplier = 1.0;
        }
        self
    }

    pub fn manual_override(&self, key: &str) -> Option<&Value> {
        self.tax_manual_overrides.get(key)
    }
}

/// Load the year's inputs, creating defaults on first touch.
pub async fn get_or_create_tax_inputs(store: &Store, year: i32) -> AppResult<TaxInputs> {
    match store.get_tax_inputs(year).await? {
        Some(raw) => {
            let inputs: TaxInputs = serde_json::from_value(raw).unwrap_or_default();
            Ok(inputs.normalize())
        }
        None => {
            let inputs = TaxInputs::default();
            store
                .put_tax_inputs(year, &serde_json::to_value(&inputs)?)
                .await?;
            Ok(inputs)
        }
    }
}
