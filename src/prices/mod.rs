use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub date: NaiveDate,
    pub price: Decimal,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Cached end-of-day prices. Missing prices are not an error; callers fall
/// back to snapshot market values.
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn latest_price(&self, ticker: &str, as_of: NaiveDate) -> AppResult<Option<PriceQuote>>;
}

/// One CSV per ticker under a prices directory: `date,price` rows, with an
/// optional `fetched_at` column stamped by the fetcher.
pub struct CsvPriceStore {
    dir: PathBuf,
}

impl CsvPriceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PriceStore for CsvPriceStore {
    async fn latest_price(&self, ticker: &str, as_of: NaiveDate) -> AppResult<Option<PriceQuote>> {
        let path = self.dir.join(format!("{}.csv", ticker.to_ascii_uppercase()));
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(_) => return Ok(None),
        };
        let col = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
        let (date_col, price_col) = match (col("date"), col("price")) {
            (Some(d), Some(p)) => (d, p),
            _ => return Ok(None),
        };
        let fetched_col = col("fetched_at");

        let mut best: Option<PriceQuote> = None;
        for record in reader.records().flatten() {
            let date = record
                .get(date_col)
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok());
            let price = record
                .get(price_col)
                .and_then(|s| Decimal::from_str(s.trim()).ok());
            let (date, price) = match (date, price) {
                (Some(d), Some(p)) => (d, p),
                _ => continue,
            };
            if date > as_of {
                continue;
            }
            let fetched_at = fetched_col
                .and_then(|idx| record.get(idx))
                .and_then(|s| s.trim().parse::<DateTime<Utc>>().ok());
            if best.as_ref().map_or(true, |b| date > b.date) {
                best = Some(PriceQuote {
                    date,
                    price,
                    fetched_at,
                });
            }
        }
        Ok(best)
    }
}
