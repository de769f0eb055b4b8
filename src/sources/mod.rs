//! HTTP clients for the authoritative data sources ground truth is read from.

pub mod coingecko;
pub mod stooq;

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::{error::FetchError, rate_limit::RateLimiter};

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, FetchError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Waits on `limiter`, sends `request` and returns the body of a 2xx reply.
pub(crate) async fn fetch_text(
    limiter: &RateLimiter,
    source_name: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<String, FetchError> {
    limiter.wait().await;
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        warn!(source = source_name, status = status.as_u16(), "data source returned an error status");
        return Err(FetchError::Status {
            source_name,
            status: status.as_u16(),
        });
    }
    Ok(response.text().await?)
}

pub(crate) async fn fetch_json(
    limiter: &RateLimiter,
    source_name: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<Value, FetchError> {
    let body = fetch_text(limiter, source_name, request).await?;
    serde_json::from_str(&body).map_err(|err| FetchError::Decode {
        source_name,
        message: err.to_string(),
    })
}
