#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use liveweb_arena::{
    plugins::hackernews::{HackerNewsApi, StoryList},
    templates::PriceFeed,
    BrowserAction, BrowserError, BrowserObservation, BrowserSession, FetchError,
};
use serde_json::{json, Value};

/// Serves a fixed set of pages. Unknown URLs fail navigation.
pub struct SiteBrowser {
    pages: HashMap<String, BrowserObservation>,
    current: Mutex<BrowserObservation>,
    pub visited: Mutex<Vec<String>>,
}

impl SiteBrowser {
    pub fn new() -> Self {
        let mut browser = Self {
            pages: HashMap::new(),
            current: Mutex::new(BrowserObservation::blank()),
            visited: Mutex::new(Vec::new()),
        };
        browser.add_page(BrowserObservation::blank());
        browser
    }

    pub fn with_page(mut self, url: &str, title: &str, tree: &str) -> Self {
        self.add_page(BrowserObservation::new(url, title, tree));
        self
    }

    fn add_page(&mut self, obs: BrowserObservation) {
        self.pages.insert(obs.url.clone(), obs);
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl BrowserSession for SiteBrowser {
    async fn goto(&self, url: &str) -> Result<BrowserObservation, BrowserError> {
        let Some(page) = self.pages.get(url) else {
            return Err(BrowserError::Navigation {
                url: url.to_string(),
                message: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            });
        };
        self.visited.lock().unwrap().push(url.to_string());
        *self.current.lock().unwrap() = page.clone();
        Ok(page.clone())
    }

    async fn execute_action(&self, action: &BrowserAction) -> Result<BrowserObservation, BrowserError> {
        match action {
            BrowserAction::Goto { url } => self.goto(url).await,
            BrowserAction::Click { selector } => match selector.strip_prefix("a[href=") {
                Some(rest) => self.goto(rest.trim_end_matches(']')).await,
                None => Err(BrowserError::Execution(format!("no element matches {selector}"))),
            },
            BrowserAction::Stop { .. } => Err(BrowserError::Execution("stop is not executable".into())),
            _ => Ok(self.current.lock().unwrap().clone()),
        }
    }
}

/// In-memory Hacker News with configurable story listings.
#[derive(Default)]
pub struct FakeHackerNews {
    lists: HashMap<StoryList, Vec<u64>>,
    items: HashMap<u64, Value>,
}

impl FakeHackerNews {
    /// Adds a front-page story.
    pub fn with_story(self, id: u64, title: &str, url: &str) -> Self {
        self.with_listed_story(StoryList::Top, id, title, url)
    }

    pub fn with_listed_story(mut self, list: StoryList, id: u64, title: &str, url: &str) -> Self {
        self.lists.entry(list).or_default().push(id);
        self.items
            .insert(id, json!({"id": id, "type": "story", "title": title, "url": url, "score": 100}));
        self
    }
}

#[async_trait]
impl HackerNewsApi for FakeHackerNews {
    async fn story_ids(&self, list: StoryList, limit: usize) -> Result<Vec<u64>, FetchError> {
        let ids = self.lists.get(&list).map(Vec::as_slice).unwrap_or_default();
        Ok(ids.iter().copied().take(limit).collect())
    }

    async fn item(&self, id: u64) -> Result<Option<Value>, FetchError> {
        Ok(self.items.get(&id).cloned())
    }

    async fn user(&self, _username: &str) -> Result<Option<Value>, FetchError> {
        Ok(None)
    }
}

/// Constant prices; counts lookups.
pub struct FixedPrices {
    pub crypto: f64,
    pub stock: f64,
    pub lookups: Mutex<usize>,
}

impl FixedPrices {
    pub fn new(crypto: f64, stock: f64) -> Self {
        Self {
            crypto,
            stock,
            lookups: Mutex::new(0),
        }
    }
}

#[async_trait]
impl PriceFeed for FixedPrices {
    async fn crypto_usd_price(&self, _coin_id: &str) -> Result<Option<f64>, FetchError> {
        *self.lookups.lock().unwrap() += 1;
        Ok(Some(self.crypto))
    }

    async fn stock_close_price(&self, _symbol: &str) -> Result<Option<f64>, FetchError> {
        *self.lookups.lock().unwrap() += 1;
        Ok(Some(self.stock))
    }
}

pub fn reply(thought: &str, action_type: &str, params: Value) -> String {
    json!({"thought": thought, "action": {"type": action_type, "params": params}}).to_string()
}
