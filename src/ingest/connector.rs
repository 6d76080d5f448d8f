use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use super::types::{
    HoldingsUnit, ProviderAccount, RawClosureRow, RawSymbolSummaryRow, RawTxnRow,
    TransactionsBatch, TransactionsUnit,
};
use crate::errors::AppError;
use crate::store::HoldingItem;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<AdapterError> for AppError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unauthorized => AppError::Unauthorized("connector".to_string()),
            AdapterError::RateLimited { retry_after_secs } => {
                AppError::RateLimited { retry_after_secs }
            }
            AdapterError::Transient(msg) => AppError::Transient(msg),
            AdapterError::Fatal(msg) => AppError::Fatal(msg),
        }
    }
}

/// Outbound contract of every connector. Implementations return
/// provider-shaped payload units with stable per-row ids where the provider
/// supplies them; everything else is the sync runner's job.
#[async_trait]
pub trait ConnectorAdapter: Send + Sync {
    async fn fetch_accounts(&self) -> Result<Vec<ProviderAccount>, AdapterError>;

    async fn fetch_transactions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        cursor: Option<&str>,
    ) -> Result<TransactionsBatch, AdapterError>;

    async fn fetch_holdings(&self) -> Result<Vec<HoldingsUnit>, AdapterError>;
}

pub(crate) fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Money cell parser tolerant of broker CSV habits: currency signs, comma
/// grouping and parenthesized negatives.
pub(crate) fn parse_money(raw: &str) -> Option<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value } else { value })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%m/%d/%Y"))
        .ok()
}

fn get<'a>(record: &'a csv::StringRecord, headers: &csv::StringRecord, name: &str) -> &'a str {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
        .and_then(|idx| record.get(idx))
        .unwrap_or("")
        .trim()
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Offline connector: a directory of exported CSV files. Files are
/// content-addressed; re-running a sync over the same directory is a no-op.
///
/// Recognized file name patterns:
/// * `transactions_*.csv`: activity rows
/// * `closures_*.csv`: broker closed-lot rows
/// * `symbol_summary_*.csv`: broker per-symbol realized summaries
/// * `positions_*.csv`: holdings plus an optional cash section
pub struct OfflineCsvConnector {
    data_dir: PathBuf,
}

impl OfflineCsvConnector {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn list_files(&self, prefix: &str) -> Result<Vec<PathBuf>, AdapterError> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.data_dir)
            .map_err(|e| AdapterError::Fatal(format!("data dir {:?}: {e}", self.data_dir)))?;
        for entry in entries {
            let entry = entry.map_err(|e| AdapterError::Transient(e.to_string()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && name.ends_with(".csv") {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_file(path: &Path) -> Result<(String, String), AdapterError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdapterError::Fatal(format!("read {path:?}: {e}")))?;
        let hash = content_hash(content.as_bytes());
        Ok((content, hash))
    }

    pub(crate) fn parse_transactions_unit(name: &str, content: &str, hash: &str) -> TransactionsUnit {
        let mut unit = TransactionsUnit {
            unit_name: name.to_string(),
            unit_hash: hash.to_string(),
            ..Default::default()
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => {
                warn!(file = name, error = %e, "unreadable csv header");
                unit.parse_failures += 1;
                return unit;
            }
        };
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => {
                    unit.parse_failures += 1;
                    continue;
                }
            };
            let account = get(&record, &headers, "account_id");
            let date = parse_date(get(&record, &headers, "date"));
            let amount = parse_money(get(&record, &headers, "amount"));
            if account.is_empty() || date.is_none() || amount.is_none() {
                unit.parse_failures += 1;
                continue;
            }
            if let Some(d) = date {
                unit.start_hint = Some(unit.start_hint.map_or(d, |s| s.min(d)));
                unit.end_hint = Some(unit.end_hint.map_or(d, |e| e.max(d)));
            }
            unit.rows.push(RawTxnRow {
                provider_account_id: account.to_string(),
                date,
                raw_type: non_empty(get(&record, &headers, "type")),
                description: non_empty(get(&record, &headers, "description")),
                additional_detail: non_empty(get(&record, &headers, "detail")),
                symbol: non_empty(get(&record, &headers, "symbol")),
                qty: parse_money(get(&record, &headers, "qty")),
                amount,
                currency: non_empty(get(&record, &headers, "currency")),
                provider_txn_id: non_empty(get(&record, &headers, "txn_id")),
            });
        }
        unit
    }

    fn parse_closures_unit(name: &str, content: &str, hash: &str) -> TransactionsUnit {
        let mut unit = TransactionsUnit {
            unit_name: name.to_string(),
            unit_hash: hash.to_string(),
            ..Default::default()
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(_) => {
                unit.parse_failures += 1;
                return unit;
            }
        };
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => {
                    unit.parse_failures += 1;
                    continue;
                }
            };
            let trade_date = parse_date(get(&record, &headers, "trade_date"));
            let qty = parse_money(get(&record, &headers, "quantity"));
            let symbol = get(&record, &headers, "symbol");
            match (trade_date, qty) {
                (Some(trade_date), Some(quantity_closed)) if !symbol.is_empty() => {
                    unit.closures.push(RawClosureRow {
                        provider_account_id: get(&record, &headers, "account_id").to_string(),
                        symbol: symbol.to_string(),
                        trade_date,
                        open_date_raw: non_empty(get(&record, &headers, "open_date")),
                        quantity_closed,
                        cost_basis: parse_money(get(&record, &headers, "cost_basis")),
                        realized_pl: parse_money(get(&record, &headers, "realized_pl")),
                        proceeds: parse_money(get(&record, &headers, "proceeds")),
                        trade_id: non_empty(get(&record, &headers, "trade_id")),
                    });
                }
                _ => unit.parse_failures += 1,
            }
        }
        unit
    }

    fn parse_symbol_summary_unit(name: &str, content: &str, hash: &str) -> TransactionsUnit {
        let mut unit = TransactionsUnit {
            unit_name: name.to_string(),
            unit_hash: hash.to_string(),
            ..Default::default()
        };
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(_) => {
                unit.parse_failures += 1;
                return unit;
            }
        };
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => {
                    unit.parse_failures += 1;
                    continue;
                }
            };
            let as_of = parse_date(get(&record, &headers, "as_of"));
            let symbol = get(&record, &headers, "symbol");
            match as_of {
                Some(as_of_date) if !symbol.is_empty() => {
                    unit.symbol_summaries.push(RawSymbolSummaryRow {
                        provider_account_id: get(&record, &headers, "account_id").to_string(),
                        symbol: symbol.to_string(),
                        as_of_date,
                        quantity: parse_money(get(&record, &headers, "quantity")),
                        cost_basis: parse_money(get(&record, &headers, "cost_basis")),
                        proceeds: parse_money(get(&record, &headers, "proceeds")),
                        realized_pl: parse_money(get(&record, &headers, "realized_pl")),
                    });
                }
                _ => unit.parse_failures += 1,
            }
        }
        unit
    }

    pub(crate) fn parse_positions_unit(name: &str, content: &str, hash: &str) -> HoldingsUnit {
        let mut items: Vec<HoldingItem> = Vec::new();
        let mut cash: Vec<(String, NaiveDate, Decimal)> = Vec::new();
        let mut parse_failures = 0u64;
        let mut latest: Option<NaiveDate> = None;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());
        if let Some(headers) = reader.headers().ok().cloned() {
            for record in reader.records() {
                let record = match record {
                    Ok(r) => r,
                    Err(_) => {
                        parse_failures += 1;
                        continue;
                    }
                };
                let account = get(&record, &headers, "account_id").to_string();
                let as_of = parse_date(get(&record, &headers, "as_of"));
                if account.is_empty() || as_of.is_none() {
                    parse_failures += 1;
                    continue;
                }
                let as_of_date = as_of.unwrap_or_default();
                latest = Some(latest.map_or(as_of_date, |d| d.max(as_of_date)));
                let section = get(&record, &headers, "section").to_ascii_uppercase();
                match section.as_str() {
                    "CASH" => {
                        if let Some(amount) = parse_money(get(&record, &headers, "market_value")) {
                            cash.push((account, as_of_date, amount));
                        } else {
                            parse_failures += 1;
                        }
                    }
                    "TOTAL" => items.push(HoldingItem {
                        provider_account_id: account,
                        symbol: None,
                        qty: None,
                        market_value: parse_money(get(&record, &headers, "market_value")),
                        cost_basis_total: None,
                        is_total: true,
                    }),
                    _ => items.push(HoldingItem {
                        provider_account_id: account,
                        symbol: non_empty(get(&record, &headers, "symbol")),
                        qty: parse_money(get(&record, &headers, "qty")),
                        market_value: parse_money(get(&record, &headers, "market_value")),
                        cost_basis_total: parse_money(get(&record, &headers, "cost_basis")),
                        is_total: false,
                    }),
                }
            }
        } else {
            parse_failures += 1;
        }

        let as_of_date = latest.unwrap_or_else(|| Utc::now().date_naive());
        let as_of = Utc
            .from_utc_datetime(&as_of_date.and_hms_opt(0, 0, 0).unwrap_or_default());
        HoldingsUnit {
            unit_name: name.to_string(),
            unit_hash: hash.to_string(),
            as_of,
            items,
            cash,
            parse_failures,
        }
    }
}

#[async_trait]
impl ConnectorAdapter for OfflineCsvConnector {
    async fn fetch_accounts(&self) -> Result<Vec<ProviderAccount>, AdapterError> {
        // Offline exports carry no account directory; mappings are seeded
        // by hand in setup.
        Ok(Vec::new())
    }

    async fn fetch_transactions(
        &self,
        _start: NaiveDate,
        _end: NaiveDate,
        _cursor: Option<&str>,
    ) -> Result<TransactionsBatch, AdapterError> {
        let mut units = Vec::new();
        for path in self.list_files("transactions_")? {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            let name = name.unwrap_or_else(|| path.display().to_string());
            let (content, hash) = Self::read_file(&path)?;
            units.push(Self::parse_transactions_unit(&name, &content, &hash));
        }
        for path in self.list_files("closures_")? {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            let name = name.unwrap_or_else(|| path.display().to_string());
            let (content, hash) = Self::read_file(&path)?;
            units.push(Self::parse_closures_unit(&name, &content, &hash));
        }
        for path in self.list_files("symbol_summary_")? {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            let name = name.unwrap_or_else(|| path.display().to_string());
            let (content, hash) = Self::read_file(&path)?;
            units.push(Self::parse_symbol_summary_unit(&name, &content, &hash));
        }
        Ok(TransactionsBatch {
            units,
            next_cursor: None,
        })
    }

    async fn fetch_holdings(&self) -> Result<Vec<HoldingsUnit>, AdapterError> {
        let mut units = Vec::new();
        for path in self.list_files("positions_")? {
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            let name = name.unwrap_or_else(|| path.display().to_string());
            let (content, hash) = Self::read_file(&path)?;
            units.push(Self::parse_positions_unit(&name, &content, &hash));
        }
        Ok(units)
    }
}

/// Web connector for flex-style report services: request a reference code,
/// then download the generated statement. The downloaded body uses the same
/// CSV shapes as the offline connector.
pub struct FlexWebConnector {
    base_url: String,
    token: String,
    query_id: String,
    client: reqwest::Client,
}

impl FlexWebConnector {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, query_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            query_id: query_id.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status.as_u16() {
            401 | 403 => Err(AdapterError::Unauthorized),
            429 => {
                let retry_after_secs = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Err(AdapterError::RateLimited { retry_after_secs })
            }
            500..=599 => Err(AdapterError::Transient(format!("server error {status}"))),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(AdapterError::Fatal(format!("{status}: {body}")))
            }
        }
    }

    async fn get_text(&self, url: &str) -> Result<String, AdapterError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .text()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))
    }
}

#[derive(serde::Deserialize)]
struct FlexReference {
    reference_code: String,
}

#[async_trait]
impl ConnectorAdapter for FlexWebConnector {
    async fn fetch_accounts(&self) -> Result<Vec<ProviderAccount>, AdapterError> {
        let url = format!("{}/flex/accounts?token={}", self.base_url, self.token);
        let body = self.get_text(&url).await?;
        serde_json::from_str(&body).map_err(|e| AdapterError::Fatal(format!("accounts: {e}")))
    }

    async fn fetch_transactions(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        _cursor: Option<&str>,
    ) -> Result<TransactionsBatch, AdapterError> {
        let request_url = format!(
            "{}/flex/request?token={}&query={}&start={}&end={}",
            self.base_url, self.token, self.query_id, start, end
        );
        let body = self.get_text(&request_url).await?;
        let reference: FlexReference = serde_json::from_str(&body)
            .map_err(|e| AdapterError::Fatal(format!("flex request: {e}")))?;

        let statement_url = format!(
            "{}/flex/statement?token={}&ref={}",
            self.base_url, self.token, reference.reference_code
        );
        let statement = self.get_text(&statement_url).await?;
        let hash = content_hash(statement.as_bytes());
        let name = format!("flexweb-{}", reference.reference_code);
        let unit = OfflineCsvConnector::parse_transactions_unit(&name, &statement, &hash);
        Ok(TransactionsBatch {
            units: vec![unit],
            next_cursor: None,
        })
    }

    async fn fetch_holdings(&self) -> Result<Vec<HoldingsUnit>, AdapterError> {
        let url = format!(
            "{}/flex/positions?token={}&query={}",
            self.base_url, self.token, self.query_id
        );
        let body = self.get_text(&url).await?;
        let hash = content_hash(body.as_bytes());
        Ok(vec![OfflineCsvConnector::parse_positions_unit(
            "flexweb-positions",
            &body,
            &hash,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn money_parser_handles_broker_habits() {
        assert_eq!(parse_money("1,234.56"), Some(dec!(1234.56)));
        assert_eq!(parse_money("(3.00)"), Some(dec!(-3.00)));
        assert_eq!(parse_money("$-20,000"), Some(dec!(-20000)));
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("n/a"), None);
    }

    #[test]
    fn transactions_unit_parses_rows_and_date_hints() {
        let content = "\
account_id,date,type,description,symbol,qty,amount,currency,txn_id
U1,2025-01-02,Buy,BUY AAPL,AAPL,10,(1000.00),USD,T-1
U1,2025-02-01,Deposit,Contribution,,,1000.00,USD,CF-1
U1,bad-date,Sell,SELL AAPL,AAPL,-5,750.00,USD,T-2
";
        let unit = OfflineCsvConnector::parse_transactions_unit("t.csv", content, "h");
        assert_eq!(unit.rows.len(), 2);
        assert_eq!(unit.parse_failures, 1);
        assert_eq!(unit.start_hint, NaiveDate::from_ymd_opt(2025, 1, 2));
        assert_eq!(unit.end_hint, NaiveDate::from_ymd_opt(2025, 2, 1));
        assert_eq!(unit.rows[0].amount, Some(dec!(-1000.00)));
        assert_eq!(unit.rows[0].provider_txn_id.as_deref(), Some("T-1"));
    }

    #[test]
    fn positions_unit_separates_cash_totals_and_positions() {
        let content = "\
account_id,as_of,section,symbol,qty,market_value,cost_basis
U1,2025-12-19,POSITION,VTI,10,2500.00,2000.00
U1,2025-12-19,TOTAL,,,99999.00,
U1,2025-12-19,CASH,,,250.00,
";
        let unit = OfflineCsvConnector::parse_positions_unit("p.csv", content, "h");
        assert_eq!(unit.items.len(), 2);
        assert_eq!(unit.cash.len(), 1);
        assert_eq!(unit.cash[0].2, dec!(250.00));
        let totals: Vec<_> = unit.items.iter().filter(|i| i.is_total).collect();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].market_value, Some(dec!(99999.00)));
    }

    #[tokio::test]
    async fn flex_web_maps_http_statuses_to_structured_errors() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/flex/request");
            then.status(401);
        });
        let connector = FlexWebConnector::new(server.base_url(), "tok", "q1");
        let err = connector
            .fetch_transactions(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Unauthorized));
    }

    #[tokio::test]
    async fn flex_web_two_step_fetch_parses_statement() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/flex/request");
            then.status(200).body(r#"{"reference_code":"R42"}"#);
        });
        server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/flex/statement")
                .query_param("ref", "R42");
            then.status(200).body(
                "account_id,date,type,description,symbol,qty,amount,currency,txn_id\n\
                 U1,2025-03-03,Dividend,CASH DIV AAPL,AAPL,,12.34,USD,D-9\n",
            );
        });

        let connector = FlexWebConnector::new(server.base_url(), "tok", "q1");
        let batch = connector
            .fetch_transactions(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(batch.units.len(), 1);
        assert_eq!(batch.units[0].rows.len(), 1);
        assert_eq!(batch.units[0].rows[0].provider_txn_id.as_deref(), Some("D-9"));
    }
}
