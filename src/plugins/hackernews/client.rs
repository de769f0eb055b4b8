use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::SourceConfig,
    error::FetchError,
    rate_limit::{shared_limiter, RateLimiter},
    sources::{fetch_json, http_client},
};

pub const SOURCE_NAME: &str = "hackernews";
pub const API_BASE: &str = "https://hacker-news.firebaseio.com/v0";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const LIST_LIMIT: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoryList {
    Top,
    Ask,
    Show,
    Jobs,
}

impl StoryList {
    pub fn endpoint(self) -> &'static str {
        match self {
            StoryList::Top => "/topstories.json",
            StoryList::Ask => "/askstories.json",
            StoryList::Show => "/showstories.json",
            StoryList::Jobs => "/jobstories.json",
        }
    }

    /// Category name as it appears in the site path.
    pub fn category(self) -> Option<&'static str> {
        match self {
            StoryList::Top => None,
            StoryList::Ask => Some("ask"),
            StoryList::Show => Some("show"),
            StoryList::Jobs => Some("jobs"),
        }
    }
}

/// Read access to Hacker News items. `items_batch` fans out in chunks of
/// `batch_size`; chunks run one after another.
#[async_trait]
pub trait HackerNewsApi: Send + Sync {
    async fn story_ids(&self, list: StoryList, limit: usize) -> Result<Vec<u64>, FetchError>;

    async fn item(&self, id: u64) -> Result<Option<Value>, FetchError>;

    async fn user(&self, username: &str) -> Result<Option<Value>, FetchError>;

    fn batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }

    /// Items that could not be fetched are left out.
    async fn items_batch(&self, ids: &[u64]) -> BTreeMap<u64, Value> {
        let mut items = BTreeMap::new();
        for chunk in ids.chunks(self.batch_size().max(1)) {
            let fetched = join_all(chunk.iter().map(|id| self.item(*id))).await;
            for (id, result) in chunk.iter().zip(fetched) {
                match result {
                    Ok(Some(item)) => {
                        items.insert(*id, item);
                    }
                    Ok(None) => debug!(id, "item missing"),
                    Err(err) => warn!(id, error = %err, "item fetch failed"),
                }
            }
        }
        items
    }
}

/// The official Firebase API, gated by the process-wide Hacker News limiter.
#[derive(Debug, Clone)]
pub struct FirebaseClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    batch_size: usize,
}

impl FirebaseClient {
    pub fn new(config: &SourceConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: http_client(config.request_timeout())?,
            limiter: shared_limiter(SOURCE_NAME, config.min_interval()),
            base_url: API_BASE.to_string(),
            batch_size: config.batch_size.max(1),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get(&self, endpoint: &str) -> Result<Value, FetchError> {
        let url = format!("{}{endpoint}", self.base_url);
        fetch_json(&self.limiter, SOURCE_NAME, self.client.get(url)).await
    }
}

#[async_trait]
impl HackerNewsApi for FirebaseClient {
    async fn story_ids(&self, list: StoryList, limit: usize) -> Result<Vec<u64>, FetchError> {
        let body = self.get(list.endpoint()).await?;
        let Value::Array(ids) = body else {
            return Err(FetchError::Decode {
                source_name: SOURCE_NAME,
                message: format!("{} did not return a list", list.endpoint()),
            });
        };
        Ok(ids.iter().filter_map(Value::as_u64).take(limit).collect())
    }

    async fn item(&self, id: u64) -> Result<Option<Value>, FetchError> {
        let body = self.get(&format!("/item/{id}.json")).await?;
        Ok(body.is_object().then_some(body))
    }

    async fn user(&self, username: &str) -> Result<Option<Value>, FetchError> {
        let encoded = percent_encoding::utf8_percent_encode(username, percent_encoding::NON_ALPHANUMERIC);
        let body = self.get(&format!("/user/{encoded}.json")).await?;
        Ok(body.is_object().then_some(body))
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
