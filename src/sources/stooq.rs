use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::Serialize;
use tracing::{debug, error};

use super::{fetch_text, http_client};
use crate::{
    config::SourceConfig,
    error::FetchError,
    rate_limit::{shared_limiter, RateLimiter},
};

pub const SOURCE_NAME: &str = "stooq";
pub const CSV_URL: &str = "https://stooq.com/q/d/l/";
const DAILY_LIMIT_MARKER: &str = "Exceeded the daily hits limit";

static DAILY_LIMIT_HIT: AtomicBool = AtomicBool::new(false);

/// Whether Stooq refused a request for the rest of the day.
pub fn daily_limit_hit() -> bool {
    DAILY_LIMIT_HIT.load(Ordering::Relaxed)
}

pub fn reset_daily_limit() {
    DAILY_LIMIT_HIT.store(false, Ordering::Relaxed);
}

/// Latest daily bar of a symbol, with the change against the previous bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StooqQuote {
    pub symbol: String,
    pub date: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: f64,
    pub daily_change: Option<f64>,
    pub daily_change_pct: Option<f64>,
}

/// Parses Stooq's daily CSV. Returns `None` when there is no closing price
/// on the last row.
pub fn parse_daily_csv(text: &str, symbol: &str) -> Option<StooqQuote> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.trim().as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .ok()?
        .iter()
        .map(|header| header.to_lowercase())
        .collect();

    let rows: Vec<HashMap<String, String>> = reader
        .records()
        .filter_map(Result::ok)
        .map(|record| {
            headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect()
        })
        .collect();

    let field = |row: &HashMap<String, String>, key: &str| -> Option<f64> {
        row.get(key).and_then(|value| value.parse::<f64>().ok())
    };

    let last = rows.last()?;
    let close = field(last, "close")?;

    let previous_close = rows
        .len()
        .checked_sub(2)
        .and_then(|index| field(&rows[index], "close"))
        .filter(|prev| *prev > 0.0);
    let daily_change = previous_close.map(|prev| close - prev);
    let daily_change_pct = previous_close.map(|prev| (close - prev) / prev * 100.0);

    Some(StooqQuote {
        symbol: symbol.to_string(),
        date: last.get("date").cloned().unwrap_or_default(),
        open: field(last, "open"),
        high: field(last, "high"),
        low: field(last, "low"),
        close,
        volume: field(last, "volume").unwrap_or(0.0),
        daily_change,
        daily_change_pct,
    })
}

#[derive(Debug, Clone)]
pub struct StooqClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl StooqClient {
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: http_client(config.request_timeout())?,
            limiter: shared_limiter(SOURCE_NAME, config.min_interval()),
        })
    }

    /// Latest quote for a Stooq symbol such as `aapl.us`. `Ok(None)` when the
    /// CSV carries no usable close.
    pub async fn quote(&self, symbol: &str) -> Result<Option<StooqQuote>, FetchError> {
        if daily_limit_hit() {
            return Err(FetchError::DailyLimit(SOURCE_NAME));
        }

        let request = self.client.get(CSV_URL).query(&[("s", symbol), ("i", "d")]);
        let text = fetch_text(&self.limiter, SOURCE_NAME, request).await?;

        if text.contains(DAILY_LIMIT_MARKER) {
            DAILY_LIMIT_HIT.store(true, Ordering::Relaxed);
            error!(symbol, "stooq daily limit exceeded");
            return Err(FetchError::DailyLimit(SOURCE_NAME));
        }

        let quote = parse_daily_csv(&text, symbol);
        debug!(symbol, close = ?quote.as_ref().map(|q| q.close), "stooq quote");
        Ok(quote)
    }

    pub async fn close_price(&self, symbol: &str) -> Result<Option<f64>, FetchError> {
        Ok(self.quote(symbol).await?.map(|quote| quote.close))
    }
}
