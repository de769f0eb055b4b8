use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tracing::debug;

use super::{fetch_json, http_client};
use crate::{
    config::SourceConfig,
    error::FetchError,
    rate_limit::{shared_limiter, RateLimiter},
};

pub const SOURCE_NAME: &str = "coingecko";
pub const FREE_API_BASE: &str = "https://api.coingecko.com/api/v3";
pub const PRO_API_BASE: &str = "https://pro-api.coingecko.com/api/v3";
pub const API_KEY_HEADER: &str = "x-cg-pro-api-key";

const FREE_TIER_INTERVAL: Duration = Duration::from_secs(2);
const PRO_TIER_INTERVAL: Duration = Duration::from_millis(100);

/// One row of `/coins/markets`. Only the fields ground truth reads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoinMarket {
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub current_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CoinGeckoClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    api_key: Option<String>,
}

impl CoinGeckoClient {
    /// Free tier when `api_key` is `None`, pro tier otherwise.
    pub fn new(api_key: Option<String>, config: &SourceConfig) -> Result<Self, FetchError> {
        let api_key = api_key.filter(|key| !key.trim().is_empty());
        let limiter = match api_key {
            Some(_) => shared_limiter("coingecko-pro", PRO_TIER_INTERVAL),
            None => shared_limiter(SOURCE_NAME, config.min_interval().max(FREE_TIER_INTERVAL)),
        };
        Ok(Self {
            client: http_client(config.request_timeout())?,
            limiter,
            api_key,
        })
    }

    pub fn base_url(&self) -> &'static str {
        if self.api_key.is_some() {
            PRO_API_BASE
        } else {
            FREE_API_BASE
        }
    }

    /// Market rows for a comma-separated id list, priced in `vs_currency`.
    pub async fn coin_markets(&self, coin_ids: &str, vs_currency: &str) -> Result<Vec<CoinMarket>, FetchError> {
        let url = format!("{}/coins/markets", self.base_url());
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("vs_currency", vs_currency),
                ("ids", coin_ids),
                ("order", "market_cap_desc"),
                ("sparkline", "false"),
            ]);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let body = fetch_json(&self.limiter, SOURCE_NAME, request).await?;
        serde_json::from_value(body).map_err(|err| FetchError::Decode {
            source_name: SOURCE_NAME,
            message: err.to_string(),
        })
    }

    /// USD price of one coin. `Ok(None)` when the coin is listed without a price.
    pub async fn usd_price(&self, coin_id: &str) -> Result<Option<f64>, FetchError> {
        let markets = self.coin_markets(coin_id, "usd").await?;
        let Some(first) = markets.into_iter().next() else {
            return Err(FetchError::NotFound(format!("coin {coin_id}")));
        };
        debug!(coin = coin_id, price = ?first.current_price, "coingecko price");
        Ok(first.current_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_selects_pro_base() {
        let config = SourceConfig::new(2_000, 1);
        let free = CoinGeckoClient::new(None, &config).unwrap();
        let blank = CoinGeckoClient::new(Some("  ".into()), &config).unwrap();
        let pro = CoinGeckoClient::new(Some("key".into()), &config).unwrap();

        assert_eq!(free.base_url(), FREE_API_BASE);
        assert_eq!(blank.base_url(), FREE_API_BASE);
        assert_eq!(pro.base_url(), PRO_API_BASE);
    }

    #[test]
    fn market_rows_decode_with_missing_price() {
        let rows: Vec<CoinMarket> = serde_json::from_str(
            r#"[{"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 64000.5},
                {"id": "ghost", "current_price": null}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].current_price, Some(64000.5));
        assert_eq!(rows[1].current_price, None);
    }
}
