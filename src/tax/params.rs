use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::EngineConfig;
use crate::store::FilingStatus;

/// One marginal bracket; `up_to = None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bracket {
    pub up_to: Option<Decimal>,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilingConfig {
    pub standard_deduction: Decimal,
    pub ordinary_brackets: Vec<Bracket>,
    pub ltcg_brackets: Vec<Bracket>,
    pub additional_medicare_threshold: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeTaxConfig {
    pub ss_rate: Decimal,
    pub medicare_rate: Decimal,
    pub additional_medicare_rate: Decimal,
    pub ss_wage_base: Decimal,
}

impl Default for SeTaxConfig {
    fn default() -> Self {
        Self {
            ss_rate: Decimal::new(124, 3),
            medicare_rate: Decimal::new(29, 3),
            additional_medicare_rate: Decimal::new(9, 3),
            ss_wage_base: Decimal::new(168_600, 0),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FplConfig {
    pub base: Decimal,
    pub per_additional: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildCreditConfig {
    pub per_child: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxParams {
    pub filing_status: HashMap<String, FilingConfig>,
    pub se_tax: SeTaxConfig,
    pub fpl: FplConfig,
    pub child_credit: ChildCreditConfig,
}

impl TaxParams {
    pub fn filing(&self, status: FilingStatus) -> Option<&FilingConfig> {
        self.filing_status.get(status.as_str())
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Load the year's parameter file, falling back to the configured default
/// year, then to built-in defaults. Caller overrides are deep-merged on top.
pub fn load_tax_params(config: &EngineConfig, year: i32, overrides: Option<&Value>) -> TaxParams {
    let year_path = config.tax_params_dir.join(format!("{year}.json"));
    let fallback_path = config
        .tax_params_dir
        .join(format!("{}.json", config.tax_params_fallback_year));
    let path: &Path = if year_path.exists() {
        &year_path
    } else {
        &fallback_path
    };

    let mut raw: Value = match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(?path, error = %e, "unparseable tax params, using defaults");
            Value::Object(Default::default())
        }),
        Err(_) => {
            warn!(?path, "tax params file missing, using defaults");
            Value::Object(Default::default())
        }
    };
    if let Some(overrides) = overrides {
        deep_merge(&mut raw, overrides);
    }
    serde_json::from_value(raw).unwrap_or_else(|e| {
        warn!(error = %e, "tax params did not deserialize, using defaults");
        TaxParams::default()
    })
}

/// Piecewise marginal tax over ordinary brackets.
pub fn apply_brackets(amount: Decimal, brackets: &[Bracket]) -> Decimal {
    if amount <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let mut taxable = amount;
    let mut prev_limit = Decimal::ZERO;
    let mut tax = Decimal::ZERO;
    for bracket in brackets {
        let chunk = match bracket.up_to {
            None => taxable,
            Some(limit) => taxable.min((limit - prev_limit).max(Decimal::ZERO)),
        };
        if chunk > Decimal::ZERO {
            tax += chunk * bracket.rate;
            taxable -= chunk;
        }
        if let Some(limit) = bracket.up_to {
            prev_limit = limit;
        }
        if taxable <= Decimal::ZERO {
            break;
        }
    }
    tax
}

/// LTCG brackets stack above ordinary taxable income: each bracket's usable
/// capacity is what ordinary income has not already consumed.
pub fn apply_ltcg_brackets(
    ordinary_taxable: Decimal,
    ltcg_taxable: Decimal,
    brackets: &[Bracket],
) -> Decimal {
    if ltcg_taxable <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let mut remaining = ltcg_taxable;
    let mut used = Decimal::ZERO;
    let mut tax = Decimal::ZERO;
    for bracket in brackets {
        let chunk = match bracket.up_to {
            None => remaining,
            Some(limit) => {
                let capacity = (limit - ordinary_taxable - used).max(Decimal::ZERO);
                remaining.min(capacity)
            }
        };
        if chunk <= Decimal::ZERO {
            if bracket.up_to.is_none() {
                break;
            }
            continue;
        }
        tax += chunk * bracket.rate;
        remaining -= chunk;
        used += chunk;
        if remaining <= Decimal::ZERO {
            break;
        }
    }
    tax
}

/// Self-employment tax plus the half-of-SE-tax deduction.
pub fn compute_se_tax(
    net_profit: Decimal,
    params: &TaxParams,
    filing_status: FilingStatus,
) -> (Decimal, Decimal) {
    if net_profit <= Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let se_base = net_profit * Decimal::new(9235, 4);
    let cfg = &params.se_tax;
    let ss_tax = se_base.min(cfg.ss_wage_base) * cfg.ss_rate;
    let medicare_tax = se_base * cfg.medicare_rate;
    let threshold = params
        .filing(filing_status)
        .and_then(|f| f.additional_medicare_threshold)
        .unwrap_or_else(|| Decimal::new(200_000, 0));
    let additional = (se_base - threshold).max(Decimal::ZERO) * cfg.additional_medicare_rate;
    let se_tax = ss_tax + medicare_tax + additional;
    let se_deduction = se_tax / Decimal::TWO;
    (se_tax, se_deduction)
}

#[derive(Debug, Clone, Default)]
pub struct TaxBreakdown {
    pub ordinary_taxable: Decimal,
    pub ltcg_taxable: Decimal,
    pub ordinary_tax: Decimal,
    pub ltcg_tax: Decimal,
    pub niit_tax: Decimal,
    pub qualified_dividends: Decimal,
    pub nonqualified_dividends: Decimal,
}

#[allow(clippy::too_many_arguments)]
pub fn compute_tax_breakdown(
    ordinary_core: Decimal,
    st_gains: Decimal,
    lt_gains: Decimal,
    dividends: Decimal,
    qualified_dividend_pct: Decimal,
    deductions: Decimal,
    se_deduction: Decimal,
    filing_status: FilingStatus,
    params: &TaxParams,
    niit_enabled: bool,
    niit_rate: Decimal,
) -> TaxBreakdown {
    let empty = FilingConfig::default();
    let filing = params.filing(filing_status).unwrap_or(&empty);

    let qualified_dividends = dividends * qualified_dividend_pct;
    let nonqualified_dividends = (dividends - qualified_dividends).max(Decimal::ZERO);

    let ordinary_base = ordinary_core + st_gains + nonqualified_dividends;
    let ltcg_base = lt_gains + qualified_dividends;

    let deduction_total = (deductions + se_deduction).max(Decimal::ZERO);
    let ordinary_taxable = (ordinary_base - deduction_total).max(Decimal::ZERO);
    let leftover_deduction = (deduction_total - ordinary_base).max(Decimal::ZERO);
    let ltcg_taxable = (ltcg_base - leftover_deduction).max(Decimal::ZERO);

    let ordinary_tax = apply_brackets(ordinary_taxable, &filing.ordinary_brackets);
    let ltcg_tax = apply_ltcg_brackets(ordinary_taxable, ltcg_taxable, &filing.ltcg_brackets);

    let niit_tax = if niit_enabled {
        (st_gains + lt_gains + dividends).max(Decimal::ZERO) * niit_rate
    } else {
        Decimal::ZERO
    };

    TaxBreakdown {
        ordinary_taxable,
        ltcg_taxable,
        ordinary_tax,
        ltcg_tax,
        niit_tax,
        qualified_dividends,
        nonqualified_dividends,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn brackets(defs: &[(Option<i64>, &str)]) -> Vec<Bracket> {
        defs.iter()
            .map(|(up_to, rate)| Bracket {
                up_to: up_to.map(Decimal::from),
                rate: rate.parse().unwrap(),
            })
            .collect()
    }

    fn mfj_params() -> TaxParams {
        let mut filing_status = HashMap::new();
        filing_status.insert(
            "MFJ".to_string(),
            FilingConfig {
                standard_deduction: dec!(29200),
                ordinary_brackets: brackets(&[
                    (Some(23200), "0.10"),
                    (Some(94300), "0.12"),
                    (None, "0.22"),
                ]),
                ltcg_brackets: brackets(&[
                    (Some(94050), "0.0"),
                    (Some(583750), "0.15"),
                    (None, "0.20"),
                ]),
                additional_medicare_threshold: Some(dec!(250000)),
            },
        );
        TaxParams {
            filing_status,
            ..Default::default()
        }
    }

    #[test]
    fn ordinary_brackets_are_marginal() {
        let params = mfj_params();
        let filing = params.filing(FilingStatus::Mfj).unwrap();
        // 30,000 = 23,200 @ 10% + 6,800 @ 12%.
        let tax = apply_brackets(dec!(30000), &filing.ordinary_brackets);
        assert_eq!(tax, dec!(2320) + dec!(816));
    }

    #[test]
    fn ltcg_brackets_stack_above_ordinary_income() {
        let params = mfj_params();
        let filing = params.filing(FilingStatus::Mfj).unwrap();
        // Ordinary income has eaten 90,000 of the 94,050 zero band; only
        // 4,050 of the gain rides free.
        let tax = apply_ltcg_brackets(dec!(90000), dec!(10000), &filing.ltcg_brackets);
        assert_eq!(tax, dec!(5950) * dec!(0.15));
    }

    #[test]
    fn deduction_leftover_flows_to_ltcg() {
        let params = mfj_params();
        let breakdown = compute_tax_breakdown(
            dec!(10000),
            Decimal::ZERO,
            dec!(50000),
            Decimal::ZERO,
            Decimal::ZERO,
            dec!(29200),
            Decimal::ZERO,
            FilingStatus::Mfj,
            &params,
            false,
            Decimal::ZERO,
        );
        assert_eq!(breakdown.ordinary_taxable, Decimal::ZERO);
        // 19,200 of unused deduction shields the gain.
        assert_eq!(breakdown.ltcg_taxable, dec!(30800));
    }

    #[test]
    fn qualified_split_routes_dividends() {
        let params = mfj_params();
        let breakdown = compute_tax_breakdown(
            dec!(100000),
            dec!(5000),
            dec!(20000),
            dec!(10000),
            dec!(0.6),
            Decimal::ZERO,
            Decimal::ZERO,
            FilingStatus::Mfj,
            &params,
            true,
            dec!(0.038),
        );
        assert_eq!(breakdown.qualified_dividends, dec!(6000));
        assert_eq!(breakdown.nonqualified_dividends, dec!(4000));
        // NIIT base is all investment income.
        assert_eq!(breakdown.niit_tax, dec!(35000) * dec!(0.038));
    }

    #[test]
    fn se_tax_halves_into_deduction() {
        let params = mfj_params();
        let (se_tax, se_deduction) =
            compute_se_tax(dec!(50000), &params, FilingStatus::Mfj);
        let base = dec!(50000) * dec!(0.9235);
        let expected = base * dec!(0.124) + base * dec!(0.029);
        assert_eq!(se_tax, expected);
        assert_eq!(se_deduction, expected / dec!(2));
    }

    #[test]
    fn missing_filing_config_degrades_to_zero_tax() {
        let params = TaxParams::default();
        let breakdown = compute_tax_breakdown(
            dec!(100000),
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
            FilingStatus::Mfj,
            &params,
            false,
            Decimal::ZERO,
        );
        assert_eq!(breakdown.ordinary_tax, Decimal::ZERO);
        assert_eq!(breakdown.ordinary_taxable, dec!(100000));
    }

    #[test]
    fn params_files_load_with_fallback_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("2025.json"),
            r#"{
                "filing_status": {
                    "MFJ": {
                        "standard_deduction": 29200,
                        "ordinary_brackets": [{"up_to": null, "rate": 0.22}],
                        "ltcg_brackets": [{"up_to": null, "rate": 0.15}]
                    }
                },
                "fpl": {"base": 15060, "per_additional": 5380}
            }"#,
        )
        .unwrap();
        let config = EngineConfig {
            tax_params_dir: dir.path().to_path_buf(),
            tax_params_fallback_year: 2025,
            ..Default::default()
        };

        // 2026 has no file: falls back to 2025.
        let params = load_tax_params(&config, 2026, None);
        assert_eq!(
            params.filing(FilingStatus::Mfj).unwrap().standard_deduction,
            dec!(29200)
        );

        let overrides = serde_json::json!({
            "filing_status": {"MFJ": {"standard_deduction": 30000}}
        });
        let params = load_tax_params(&config, 2026, Some(&overrides));
        assert_eq!(
            params.filing(FilingStatus::Mfj).unwrap().standard_deduction,
            dec!(30000)
        );
    }
}
