use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use watch_core::{FetchError, PriceSource, Sample};

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Live quote client backed by the Yahoo Finance chart API.
///
/// One HTTP round trip per call, no retries — the watch loop owns retry
/// policy.
#[derive(Clone)]
pub struct QuoteClient {
    client: reqwest::Client,
}

/// One historical daily close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePrice {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

/// Chart lookback window for historical closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    OneDay,
    FiveDays,
    OneMonth,
    SixMonths,
    OneYear,
    FiveYears,
}

impl HistoryRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryRange::OneDay => "1d",
            HistoryRange::FiveDays => "5d",
            HistoryRange::OneMonth => "1mo",
            HistoryRange::SixMonths => "6mo",
            HistoryRange::OneYear => "1y",
            HistoryRange::FiveYears => "5y",
        }
    }
}

impl std::str::FromStr for HistoryRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1d" => Ok(HistoryRange::OneDay),
            "5d" => Ok(HistoryRange::FiveDays),
            "1mo" => Ok(HistoryRange::OneMonth),
            "6mo" => Ok(HistoryRange::SixMonths),
            "1y" => Ok(HistoryRange::OneYear),
            "5y" => Ok(HistoryRange::FiveYears),
            other => Err(format!(
                "unknown range '{}' (expected 1d, 5d, 1mo, 6mo, 1y or 5y)",
                other
            )),
        }
    }
}

/// Exchange-suffixed Yahoo symbol: `.NS` for NSE, `.BO` for BSE, bare
/// otherwise.
fn yahoo_symbol(ticker: &str, exchange: &str) -> String {
    match exchange.to_ascii_uppercase().as_str() {
        "NSE" => format!("{}.NS", ticker),
        "BSE" => format!("{}.BO", ticker),
        _ => ticker.to_string(),
    }
}

fn chart_result(json: &serde_json::Value) -> Result<&serde_json::Value, FetchError> {
    json.get("chart")
        .and_then(|v| v.get("result"))
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| FetchError::MissingData("no chart result in response".to_string()))
}

/// Pull `meta.regularMarketPrice` out of a chart response.
fn parse_live_price(json: &serde_json::Value) -> Result<f64, FetchError> {
    chart_result(json)?
        .get("meta")
        .and_then(|v| v.get("regularMarketPrice"))
        .and_then(|v| v.as_f64())
        .ok_or_else(|| FetchError::MissingData("no regularMarketPrice in response".to_string()))
}

/// Pull (timestamp, close) pairs out of a chart response. Gaps (null closes)
/// are skipped.
fn parse_close_prices(json: &serde_json::Value) -> Result<Vec<ClosePrice>, FetchError> {
    let result = chart_result(json)?;

    let timestamps = result
        .get("timestamp")
        .and_then(|v| v.as_array())
        .ok_or_else(|| FetchError::MissingData("no timestamps in response".to_string()))?;

    let closes = result
        .get("indicators")
        .and_then(|v| v.get("quote"))
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("close"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| FetchError::MissingData("no close prices in response".to_string()))?;

    let mut prices = Vec::new();
    for (ts, close) in timestamps.iter().zip(closes.iter()) {
        if let (Some(ts), Some(close)) = (ts.as_i64(), close.as_f64()) {
            let timestamp = DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| FetchError::Parse(format!("invalid timestamp {}", ts)))?;
            prices.push(ClosePrice { timestamp, close });
        }
    }
    Ok(prices)
}

impl QuoteClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn get_chart(
        &self,
        symbol: &str,
        range: &str,
        interval: &str,
    ) -> Result<serde_json::Value, FetchError> {
        let url = format!(
            "{}/{}?range={}&interval={}",
            CHART_URL, symbol, range, interval
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(format!(
                "chart request for {} returned {}",
                symbol, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// Fetch the live price for one symbol.
    pub async fn quote(&self, ticker: &str, exchange: &str) -> Result<Sample, FetchError> {
        let symbol = yahoo_symbol(ticker, exchange);
        let json = self.get_chart(&symbol, "1d", "1m").await?;
        let price = parse_live_price(&json)?;
        tracing::debug!("Quote {}: {:.2}", symbol, price);
        Ok(Sample {
            price,
            timestamp: Utc::now(),
        })
    }

    /// Fetch daily closes over the given range.
    pub async fn daily_history(
        &self,
        ticker: &str,
        exchange: &str,
        range: HistoryRange,
    ) -> Result<Vec<ClosePrice>, FetchError> {
        let symbol = yahoo_symbol(ticker, exchange);
        let json = self.get_chart(&symbol, range.as_str(), "1d").await?;
        parse_close_prices(&json)
    }
}

impl Default for QuoteClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceSource for QuoteClient {
    async fn fetch(&self, ticker: &str, exchange: &str) -> Result<Sample, FetchError> {
        self.quote(ticker, exchange).await
    }
}
