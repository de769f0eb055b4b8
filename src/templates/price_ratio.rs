use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{first_number, GeneratedQuestion, QuestionTemplate, ValidationResult};
use crate::{
    config::ArenaConfig,
    error::FetchError,
    ground_truth::{FetchStrategy, GroundTruthResult, TriggerConfig, UrlWithParamsTrigger},
    sources::{coingecko::CoinGeckoClient, stooq::StooqClient},
};

pub const TEMPLATE_NAME: &str = "hybrid_price_ratio";
pub const DEFAULT_TOLERANCE_PCT: f64 = 10.0;
const STOCK_DOMAIN: &str = "stooq.com";

const PATTERNS: [&str; 4] = [
    "How many shares of {stock} could you buy with 1 {crypto}?",
    "If you sold 1 {crypto}, how many shares of {stock} could you afford?",
    "How many {stock} shares equal the value of 1 {crypto}?",
    "With 1 {crypto}, how many {stock} shares could you purchase?",
];

static RE_EXPECTED_SHARES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.?\d*)\s*shares").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoAsset {
    pub coin_id: &'static str,
    pub symbol: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockAsset {
    /// Stooq symbol, e.g. `aapl.us`.
    pub symbol: &'static str,
    pub ticker: &'static str,
    pub name: &'static str,
}

const fn crypto(coin_id: &'static str, symbol: &'static str, name: &'static str) -> CryptoAsset {
    CryptoAsset { coin_id, symbol, name }
}

const fn stock(symbol: &'static str, ticker: &'static str, name: &'static str) -> StockAsset {
    StockAsset { symbol, ticker, name }
}

pub const CRYPTOS: [CryptoAsset; 15] = [
    crypto("bitcoin", "BTC", "Bitcoin"),
    crypto("ethereum", "ETH", "Ethereum"),
    crypto("solana", "SOL", "Solana"),
    crypto("ripple", "XRP", "XRP"),
    crypto("cardano", "ADA", "Cardano"),
    crypto("dogecoin", "DOGE", "Dogecoin"),
    crypto("polkadot", "DOT", "Polkadot"),
    crypto("avalanche-2", "AVAX", "Avalanche"),
    crypto("chainlink", "LINK", "Chainlink"),
    crypto("litecoin", "LTC", "Litecoin"),
    crypto("near", "NEAR", "NEAR Protocol"),
    crypto("uniswap", "UNI", "Uniswap"),
    crypto("bittensor", "TAO", "Bittensor"),
    crypto("render-token", "RENDER", "Render"),
    crypto("aave", "AAVE", "Aave"),
];

pub const STOCKS: [StockAsset; 15] = [
    stock("aapl.us", "AAPL", "Apple"),
    stock("msft.us", "MSFT", "Microsoft"),
    stock("googl.us", "GOOGL", "Alphabet"),
    stock("amzn.us", "AMZN", "Amazon"),
    stock("nvda.us", "NVDA", "NVIDIA"),
    stock("meta.us", "META", "Meta"),
    stock("tsla.us", "TSLA", "Tesla"),
    stock("jpm.us", "JPM", "JPMorgan Chase"),
    stock("v.us", "V", "Visa"),
    stock("wmt.us", "WMT", "Walmart"),
    stock("ko.us", "KO", "Coca-Cola"),
    stock("dis.us", "DIS", "Disney"),
    stock("nke.us", "NKE", "Nike"),
    stock("intc.us", "INTC", "Intel"),
    stock("amd.us", "AMD", "AMD"),
];

/// USD prices from two independent sources.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// `Ok(None)` when the coin is listed without a price.
    async fn crypto_usd_price(&self, coin_id: &str) -> Result<Option<f64>, FetchError>;

    /// Latest close. `Ok(None)` when the source has no usable close.
    async fn stock_close_price(&self, symbol: &str) -> Result<Option<f64>, FetchError>;
}

/// CoinGecko for crypto, Stooq for stocks.
#[derive(Debug, Clone)]
pub struct MarketFeed {
    coingecko: CoinGeckoClient,
    stooq: StooqClient,
}

impl MarketFeed {
    pub fn new(coingecko: CoinGeckoClient, stooq: StooqClient) -> Self {
        Self { coingecko, stooq }
    }

    pub fn from_config(config: &ArenaConfig) -> Result<Self, FetchError> {
        let sources = &config.sources;
        Ok(Self::new(
            CoinGeckoClient::new(sources.coingecko_api_key.clone(), &sources.coingecko)?,
            StooqClient::new(&sources.stooq)?,
        ))
    }
}

#[async_trait]
impl PriceFeed for MarketFeed {
    async fn crypto_usd_price(&self, coin_id: &str) -> Result<Option<f64>, FetchError> {
        self.coingecko.usd_price(coin_id).await
    }

    async fn stock_close_price(&self, symbol: &str) -> Result<Option<f64>, FetchError> {
        self.stooq.close_price(symbol).await
    }
}

/// "How many shares of a stock does one coin buy?" Crypto price from
/// CoinGecko, stock price from Stooq, scored with a percentage tolerance.
pub struct PriceRatioTemplate<F> {
    feed: F,
    tolerance_pct: f64,
}

impl<F: PriceFeed> PriceRatioTemplate<F> {
    pub fn new(feed: F) -> Self {
        Self {
            feed,
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
        }
    }

    pub fn with_tolerance_pct(mut self, tolerance_pct: f64) -> Self {
        self.tolerance_pct = tolerance_pct;
        self
    }

    pub fn tolerance_pct(&self) -> f64 {
        self.tolerance_pct
    }

    fn price_or_result(
        label: &str,
        fetched: Result<Option<f64>, FetchError>,
    ) -> Result<f64, GroundTruthResult> {
        match fetched {
            Ok(Some(price)) => Ok(price),
            Ok(None) => Err(GroundTruthResult::retry(format!("Could not fetch {label} price"))),
            Err(err) => Err(GroundTruthResult::from_fetch_error(&format!("{label} price"), &err)),
        }
    }
}

fn info_str<'a>(info: &'a Value, key: &str) -> &'a str {
    info.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn expected_ratio(value: &Value) -> Option<f64> {
    if let Some(ratio) = value.get("ratio").and_then(Value::as_f64) {
        return Some(ratio);
    }
    let display = value.get("display").and_then(Value::as_str).or_else(|| value.as_str())?;
    RE_EXPECTED_SHARES
        .captures(display)
        .and_then(|caps| caps.get(1))
        .and_then(|found| found.as_str().parse().ok())
}

#[async_trait]
impl<F: PriceFeed> QuestionTemplate for PriceRatioTemplate<F> {
    fn name(&self) -> &'static str {
        TEMPLATE_NAME
    }

    fn generate(&self, seed: u64) -> GeneratedQuestion {
        let mut rng = StdRng::seed_from_u64(seed);
        let coin = CRYPTOS.choose(&mut rng).copied().unwrap_or(CRYPTOS[0]);
        let equity = STOCKS.choose(&mut rng).copied().unwrap_or(STOCKS[0]);
        let pattern = PATTERNS.choose(&mut rng).copied().unwrap_or(PATTERNS[0]);

        let question_text = pattern
            .replace("{crypto}", coin.name)
            .replace("{stock}", equity.name);

        let mut variables = Map::new();
        variables.insert(
            "crypto".to_string(),
            json!({"coin_id": coin.coin_id, "symbol": coin.symbol, "name": coin.name}),
        );
        variables.insert(
            "stock".to_string(),
            json!({"symbol": equity.symbol, "ticker": equity.ticker, "name": equity.name}),
        );

        GeneratedQuestion {
            question_text,
            start_url: format!("https://www.coingecko.com/en/coins/{}", coin.coin_id),
            variables,
            validation_info: json!({
                "crypto_id": coin.coin_id,
                "crypto_name": coin.name,
                "crypto_symbol": coin.symbol,
                "stock_symbol": equity.symbol,
                "stock_ticker": equity.ticker,
                "stock_name": equity.name,
            }),
            template_name: TEMPLATE_NAME.to_string(),
            expected_steps: 10,
        }
    }

    fn validation_rules(&self, validation_info: &Value) -> String {
        let crypto_name = validation_info
            .get("crypto_name")
            .and_then(Value::as_str)
            .unwrap_or("the crypto");
        let stock_name = validation_info
            .get("stock_name")
            .and_then(Value::as_str)
            .unwrap_or("the stock");
        let tolerance = self.tolerance_pct;

        format!(
            "Task-Specific Rules (Hybrid - Price Ratio Calculation):\n\
             - Calculate how many {stock_name} shares can be bought with 1 {crypto_name}\n\
             - Requires getting {crypto_name} price from CoinGecko\n\
             - Requires getting {stock_name} price from Stooq\n\
             - Score 1.0: Result within {tolerance}% tolerance (accounts for price fluctuation during task)\n\
             - Score 0.0: Result differs by more than {tolerance}%\n\
             - Accept integer or decimal answers (e.g., 4, 4.5, \"about 4 shares\")"
        )
    }

    async fn ground_truth(&self, validation_info: &Value) -> GroundTruthResult {
        let crypto_id = info_str(validation_info, "crypto_id");
        let stock_symbol = info_str(validation_info, "stock_symbol");
        if crypto_id.is_empty() || stock_symbol.is_empty() {
            return GroundTruthResult::fail("Missing crypto_id or stock_symbol");
        }

        let crypto_price = match Self::price_or_result("crypto", self.feed.crypto_usd_price(crypto_id).await) {
            Ok(price) => price,
            Err(result) => return result,
        };
        let stock_price = match Self::price_or_result("stock", self.feed.stock_close_price(stock_symbol).await) {
            Ok(price) => price,
            Err(result) => return result,
        };

        if stock_price <= 0.0 {
            return GroundTruthResult::fail("Invalid stock price");
        }

        let ratio = ((crypto_price / stock_price) * 100.0).round() / 100.0;
        debug!(crypto_id, stock_symbol, crypto_price, stock_price, ratio, "price ratio ground truth");
        GroundTruthResult::ok(json!({
            "ratio": ratio,
            "crypto_price": crypto_price,
            "stock_price": stock_price,
            "display": format!("{ratio:.2} shares (${crypto_price:.2} / ${stock_price:.2})"),
        }))
    }

    fn validate_answer(&self, answer: &str, ground_truth: &GroundTruthResult) -> ValidationResult {
        let value = match ground_truth {
            GroundTruthResult::Ok { value } => value,
            other => {
                let reason = other.reason().unwrap_or_default();
                return ValidationResult::failed(None, answer, format!("Ground truth unavailable: {reason}"));
            }
        };
        let expected_value = Some(value.clone());

        let Some(expected) = expected_ratio(value) else {
            return ValidationResult::failed(expected_value, answer, "Could not parse expected ratio");
        };
        let Some(actual) = first_number(answer) else {
            return ValidationResult::failed(expected_value, answer, "Could not find numeric value in answer");
        };
        if expected == 0.0 {
            return ValidationResult::failed(expected_value, answer, "Expected ratio is zero");
        }

        let diff_pct = (actual - expected).abs() / expected * 100.0;
        let tolerance = self.tolerance_pct;
        if diff_pct <= tolerance {
            ValidationResult {
                score: 1.0,
                is_correct: true,
                expected: expected_value,
                actual: answer.to_string(),
                details: format!("Within {tolerance}% tolerance (diff: {diff_pct:.1}%)"),
            }
        } else {
            ValidationResult::failed(
                expected_value,
                answer,
                format!("Outside tolerance (diff: {diff_pct:.1}%)"),
            )
        }
    }

    fn ground_truth_trigger(&self, validation_info: &Value) -> Option<TriggerConfig> {
        let trigger = UrlWithParamsTrigger::new([STOCK_DOMAIN])
            .with_param_value("s", info_str(validation_info, "stock_symbol"));
        Some(TriggerConfig::new(trigger).with_strategy(FetchStrategy::First))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FixedFeed {
        crypto: Result<Option<f64>, u16>,
        stock: Result<Option<f64>, u16>,
        calls: AtomicUsize,
    }

    impl FixedFeed {
        fn prices(crypto: f64, stock: f64) -> Self {
            Self {
                crypto: Ok(Some(crypto)),
                stock: Ok(Some(stock)),
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn to_fetch(result: &Result<Option<f64>, u16>) -> Result<Option<f64>, FetchError> {
        match result {
            Ok(price) => Ok(*price),
            Err(404) => Err(FetchError::NotFound("asset".into())),
            Err(status) => Err(FetchError::Status {
                source_name: "fixed",
                status: *status,
            }),
        }
    }

    #[async_trait]
    impl PriceFeed for FixedFeed {
        async fn crypto_usd_price(&self, _coin_id: &str) -> Result<Option<f64>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            to_fetch(&self.crypto)
        }

        async fn stock_close_price(&self, _symbol: &str) -> Result<Option<f64>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            to_fetch(&self.stock)
        }
    }

    fn info() -> Value {
        json!({"crypto_id": "bitcoin", "stock_symbol": "aapl.us", "crypto_name": "Bitcoin", "stock_name": "Apple"})
    }

    #[test]
    fn generation_is_deterministic_per_seed() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0));
        let first = template.generate(42);
        let again = template.generate(42);
        assert_eq!(first, again);

        let info = &first.validation_info;
        let coin = CRYPTOS.iter().find(|c| c.coin_id == info["crypto_id"]).unwrap();
        let equity = STOCKS.iter().find(|s| s.symbol == info["stock_symbol"]).unwrap();
        assert_eq!(first.start_url, format!("https://www.coingecko.com/en/coins/{}", coin.coin_id));
        assert!(first.question_text.contains(coin.name));
        assert!(first.question_text.contains(equity.name));
        assert_eq!(info["stock_ticker"], json!(equity.ticker));
        assert_eq!(first.expected_steps, 10);
        assert_eq!(first.template_name, TEMPLATE_NAME);
    }

    #[test]
    fn seeds_cover_several_pairs() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0));
        let distinct: std::collections::HashSet<String> =
            (0..50).map(|seed| template.generate(seed).question_text).collect();
        assert!(distinct.len() > 10);
    }

    #[tokio::test]
    async fn ratio_is_rounded_to_cents() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(64_000.0, 189.5));
        let result = template.ground_truth(&info()).await;
        let value = result.value().unwrap();
        assert_eq!(value["ratio"], json!(337.73));
        assert_eq!(value["display"], json!("337.73 shares ($64000.00 / $189.50)"));
    }

    #[tokio::test]
    async fn missing_ids_fail_without_fetching() {
        let feed = FixedFeed::prices(1.0, 1.0);
        let template = PriceRatioTemplate::new(feed);
        let result = template.ground_truth(&json!({"crypto_id": "bitcoin"})).await;
        assert_eq!(result, GroundTruthResult::fail("Missing crypto_id or stock_symbol"));
        assert_eq!(template.feed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn source_failures_map_to_retry_or_fail() {
        let mut feed = FixedFeed::prices(1.0, 1.0);
        feed.crypto = Ok(None);
        let result = PriceRatioTemplate::new(feed).ground_truth(&info()).await;
        assert_eq!(result, GroundTruthResult::retry("Could not fetch crypto price"));

        let mut feed = FixedFeed::prices(1.0, 1.0);
        feed.stock = Err(503);
        assert!(PriceRatioTemplate::new(feed).ground_truth(&info()).await.is_retry());

        let mut feed = FixedFeed::prices(1.0, 1.0);
        feed.stock = Err(404);
        let result = PriceRatioTemplate::new(feed).ground_truth(&info()).await;
        assert!(matches!(result, GroundTruthResult::Fail { .. }));

        let result = PriceRatioTemplate::new(FixedFeed::prices(1.0, 0.0))
            .ground_truth(&info())
            .await;
        assert_eq!(result, GroundTruthResult::fail("Invalid stock price"));
    }

    #[test]
    fn tolerance_scoring() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0));
        let truth = GroundTruthResult::ok(json!({"ratio": 4.0}));

        let close = template.validate_answer("about 4.3 shares", &truth);
        assert_eq!(close.score, 1.0);
        assert!(close.is_correct);
        assert_eq!(close.details, "Within 10% tolerance (diff: 7.5%)");

        let far = template.validate_answer("5.0", &truth);
        assert_eq!(far.score, 0.0);
        assert_eq!(far.details, "Outside tolerance (diff: 25.0%)");

        let none = template.validate_answer("no idea", &truth);
        assert_eq!(none.details, "Could not find numeric value in answer");
    }

    #[test]
    fn tolerance_is_configurable_and_display_form_is_parsed() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0)).with_tolerance_pct(5.0);
        let truth = GroundTruthResult::ok(json!("4.00 shares ($400.00 / $100.00)"));
        assert_eq!(template.validate_answer("4.3", &truth).score, 0.0);
        assert_eq!(template.validate_answer("4.1", &truth).score, 1.0);
        assert!(template.validation_rules(&info()).contains("within 5% tolerance"));
    }

    #[test]
    fn unavailable_or_zero_ground_truth_scores_zero() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0));
        let unavailable = template.validate_answer("4", &GroundTruthResult::retry("stooq down"));
        assert_eq!(unavailable.details, "Ground truth unavailable: stooq down");
        assert!(unavailable.expected.is_none());

        let zero = template.validate_answer("4", &GroundTruthResult::ok(json!({"ratio": 0.0})));
        assert_eq!(zero.details, "Expected ratio is zero");
    }

    #[test]
    fn trigger_waits_for_the_stock_page() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0));
        let config = template.ground_truth_trigger(&info()).unwrap();
        assert_eq!(config.strategy, FetchStrategy::First);
        assert!(config.trigger.matches("https://stooq.com/q/?s=aapl.us"));
        assert!(!config.trigger.matches("https://stooq.com/q/?s=msft.us"));
        assert!(!config.trigger.matches("https://www.coingecko.com/en/coins/bitcoin"));
        assert!(!config.trigger.matches("https://stooq.com.attacker.example/q/?s=aapl.us"));
    }

    #[test]
    fn short_symbols_do_not_fire_on_longer_ones() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(1.0, 1.0));
        let visa = json!({"crypto_id": "bitcoin", "stock_symbol": "v.us"});
        let config = template.ground_truth_trigger(&visa).unwrap();
        assert!(config.trigger.matches("https://stooq.com/q/?s=v.us"));
        assert!(!config.trigger.matches("https://stooq.com/q/?s=nv.us"));
    }

    #[tokio::test]
    async fn live_validation_fetches_then_scores() {
        let template = PriceRatioTemplate::new(FixedFeed::prices(400.0, 100.0));
        let result = template.validate_live("4 shares", &info()).await;
        assert!(result.is_correct);
    }
}
