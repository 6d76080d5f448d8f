use std::collections::HashSet;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::AppResult;
use crate::store::{FactType, Store, TaxFact};

/// Source of confirmed tax-document facts. The engine only ever sees facts
/// that are confirmed and authoritative; extraction and review live outside.
#[async_trait]
pub trait DocumentFactStore: Send + Sync {
    async fn facts_for_year(&self, year: i32) -> AppResult<Vec<TaxFact>>;
}

#[async_trait]
impl DocumentFactStore for Store {
    async fn facts_for_year(&self, year: i32) -> AppResult<Vec<TaxFact>> {
        self.confirmed_facts_for_year(year).await
    }
}

/// Per-category document totals plus the set of fact types actually present.
/// The dashboard's precedence logic keys off `sources`: a zero total with
/// the fact type present still counts as "documents say zero".
#[derive(Debug, Clone, Default)]
pub struct DocOverrides {
    pub w2_wages_total: Decimal,
    pub w2_withholding_total: Decimal,
    pub ira_distributions_total: Decimal,
    pub ira_distributions_gross_total: Decimal,
    pub ira_withholding_total: Decimal,
    pub interest_total: Decimal,
    pub dividends_ordinary_total: Decimal,
    pub dividends_qualified_total: Decimal,
    pub cap_gain_dist_total: Decimal,
    pub k1_total: Decimal,
    pub sources: HashSet<FactType>,
}

impl DocOverrides {
    pub fn any_present(&self) -> bool {
        !self.sources.is_empty()
    }
}

/// Dashboard category keys and the fact types that satisfy them.
pub fn fact_types_for_category(key: &str) -> &'static [FactType] {
    match key {
        "w2_wages_total" => &[FactType::W2Wages],
        "w2_withholding_total" => &[FactType::W2Withholding],
        "ira_distributions_total" => &[FactType::IraDistributions, FactType::IraDistributionsGross],
        "ira_withholding_total" => &[FactType::IraWithholding],
        "interest_total" => &[FactType::Interest],
        "dividends_ordinary_total" => &[FactType::DividendsOrdinary],
        "dividends_qualified_total" => &[FactType::DividendsQualified],
        "cap_gain_dist_total" => &[FactType::CapGainDist],
        "k1_total" => &[
            FactType::K1Ordinary,
            FactType::K1Interest,
            FactType::K1Dividends,
            FactType::K1Rental,
            FactType::K1Other,
        ],
        _ => &[],
    }
}

/// Fold confirmed facts into category totals. Corrected documents supersede
/// their originals upstream, so summation here is a plain fold.
pub fn aggregate_doc_overrides(facts: &[TaxFact]) -> DocOverrides {
    let mut out = DocOverrides::default();
    for fact in facts {
        let amount = fact.amount.unwrap_or(Decimal::ZERO);
        out.sources.insert(fact.fact_type);
        match fact.fact_type {
            FactType::W2Wages => out.w2_wages_total += amount,
            FactType::W2Withholding => out.w2_withholding_total += amount,
            FactType::IraDistributions => out.ira_distributions_total += amount,
            FactType::IraDistributionsGross => out.ira_distributions_gross_total += amount,
            FactType::IraWithholding => out.ira_withholding_total += amount,
            FactType::Interest => out.interest_total += amount,
            FactType::DividendsOrdinary => out.dividends_ordinary_total += amount,
            FactType::DividendsQualified => out.dividends_qualified_total += amount,
            FactType::CapGainDist => out.cap_gain_dist_total += amount,
            FactType::K1Ordinary
            | FactType::K1Interest
            | FactType::K1Dividends
            | FactType::K1Rental
            | FactType::K1Other => out.k1_total += amount,
        }
    }
    out
}

impl DocOverrides {
    pub fn present(&self, category_key: &str) -> bool {
        fact_types_for_category(category_key)
            .iter()
            .any(|ft| self.sources.contains(ft))
    }

    pub fn total_for(&self, category_key: &str) -> Decimal {
        match category_key {
            "w2_wages_total" => self.w2_wages_total,
            "w2_withholding_total" => self.w2_withholding_total,
            "ira_distributions_total" => self.ira_distributions_total,
            "ira_withholding_total" => self.ira_withholding_total,
            "interest_total" => self.interest_total,
            "dividends_ordinary_total" => self.dividends_ordinary_total,
            "dividends_qualified_total" => self.dividends_qualified_total,
            "cap_gain_dist_total" => self.cap_gain_dist_total,
            "k1_total" => self.k1_total,
            _ => Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fact(fact_type: FactType, amount: Decimal) -> TaxFact {
        TaxFact {
            id: 0,
            tax_year: 2025,
            fact_type,
            amount: Some(amount),
            amount_monthly: None,
            owner_entity: None,
            doc_type: None,
            confirmed: true,
            authoritative: true,
            is_corrected: false,
        }
    }

    #[test]
    fn aggregates_by_category_and_tracks_presence() {
        let facts = vec![
            fact(FactType::W2Wages, dec!(24000)),
            fact(FactType::W2Wages, dec!(6000)),
            fact(FactType::K1Ordinary, dec!(100)),
            fact(FactType::K1Rental, dec!(50)),
        ];
        let overrides = aggregate_doc_overrides(&facts);
        assert_eq!(overrides.w2_wages_total, dec!(30000));
        assert_eq!(overrides.k1_total, dec!(150));
        assert!(overrides.present("w2_wages_total"));
        assert!(overrides.present("k1_total"));
        assert!(!overrides.present("interest_total"));
        assert_eq!(overrides.total_for("w2_wages_total"), dec!(30000));
    }

    #[test]
    fn empty_facts_mean_no_presence() {
        let overrides = aggregate_doc_overrides(&[]);
        assert!(!overrides.any_present());
        assert!(!overrides.present("w2_wages_total"));
    }
}
