pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

pub use client::{FirebaseClient, HackerNewsApi, StoryList};

use self::client::LIST_LIMIT;
use super::{host_matches, host_of, EvalContext, ExternalUrlRegistry, Plugin};
use crate::{
    error::FetchError,
    ground_truth::{FetchStrategy, TriggerConfig, UrlPatternTrigger},
};

pub const PLUGIN_NAME: &str = "hackernews";
/// Links anywhere under this domain are never whitelisted as external.
const YC_DOMAIN: &str = "ycombinator.com";
const ALLOWED_DOMAINS: &[&str] = &["news.ycombinator.com"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum HnPage {
    Item(u64),
    User(String),
    Listing(StoryList),
    Unknown,
}

/// `None` for URLs outside Hacker News.
fn classify(url: &str) -> Option<HnPage> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str().unwrap_or_default();
    if !ALLOWED_DOMAINS.iter().any(|domain| host_matches(host, domain)) {
        return None;
    }

    let path = parsed.path().trim_matches('/');
    let id = parsed
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned());

    let page = match (path, id) {
        ("item", Some(id)) => id.parse().map(HnPage::Item).unwrap_or(HnPage::Unknown),
        ("user", Some(id)) if !id.is_empty() => HnPage::User(id),
        ("ask", _) => HnPage::Listing(StoryList::Ask),
        ("show", _) => HnPage::Listing(StoryList::Show),
        ("jobs", _) => HnPage::Listing(StoryList::Jobs),
        ("" | "news" | "newest" | "front", _) => HnPage::Listing(StoryList::Top),
        _ => HnPage::Unknown,
    };
    Some(page)
}

/// Whitelists every off-site story link of a listing payload.
fn extract_external_urls(registry: &mut ExternalUrlRegistry, data: &Value) -> usize {
    let Some(stories) = data.get("stories").and_then(Value::as_object) else {
        return 0;
    };
    let mut added = 0;
    for story in stories.values() {
        let Some(link) = story.get("url").and_then(Value::as_str) else {
            continue;
        };
        if host_matches(&host_of(link), YC_DOMAIN) {
            continue;
        }
        if registry.insert(link, story.clone()) {
            added += 1;
        }
    }
    added
}

pub struct HackerNewsPlugin {
    api: Arc<dyn HackerNewsApi>,
}

impl HackerNewsPlugin {
    pub fn new(api: Arc<dyn HackerNewsApi>) -> Self {
        Self { api }
    }

    async fn listing_data(&self, list: StoryList) -> Result<Value, FetchError> {
        let ids = self.api.story_ids(list, LIST_LIMIT).await?;
        if ids.is_empty() {
            let label = list.category().unwrap_or("top");
            return Err(FetchError::NotFound(format!("{label} stories")));
        }

        let mut items = self.api.items_batch(&ids).await;
        let mut stories = Map::new();
        for (rank, id) in ids.iter().enumerate() {
            let Some(mut story) = items.remove(id) else {
                continue;
            };
            if let Some(fields) = story.as_object_mut() {
                fields.insert("rank".to_string(), json!(rank + 1));
            }
            stories.insert(id.to_string(), story);
        }

        let mut data = json!({ "stories": stories });
        if let Some(category) = list.category() {
            data["category"] = json!(category);
        }
        Ok(data)
    }

    async fn user_data(&self, username: &str) -> Result<Value, FetchError> {
        let user = self
            .api
            .user(username)
            .await?
            .ok_or_else(|| FetchError::NotFound(format!("user {username}")))?;
        let submissions: Vec<Value> = user
            .get("submitted")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().take(LIST_LIMIT).cloned().collect())
            .unwrap_or_default();
        Ok(json!({ "user": user, "submissions": submissions }))
    }

    fn external_url_data(&self, ctx: &EvalContext, url: &str) -> Value {
        let mut data = json!({ "url": url, "is_external": true });
        let story = ctx
            .registry(PLUGIN_NAME)
            .and_then(|registry| registry.source_record(url));
        if let Some(story) = story {
            data["hn_story_id"] = story.get("id").cloned().unwrap_or(Value::Null);
            data["hn_story_title"] = story.get("title").cloned().unwrap_or(Value::Null);
            data["hn_story_rank"] = story.get("rank").cloned().unwrap_or(Value::Null);
        }
        data
    }

    fn is_legitimate_external_url(&self, ctx: &EvalContext, url: &str) -> bool {
        ctx.registry(PLUGIN_NAME)
            .is_some_and(|registry| registry.is_legitimate(url))
    }
}

#[async_trait]
impl Plugin for HackerNewsPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn allowed_domains(&self) -> &[&'static str] {
        ALLOWED_DOMAINS
    }

    fn usage_hint(&self) -> String {
        "Use news.ycombinator.com to find information. Story links on Hacker News may be \
         followed to their external sites."
            .to_string()
    }

    fn get_blocked_patterns(&self) -> Vec<String> {
        vec![
            "*hacker-news.firebaseio.com*".to_string(),
            "*hn.algolia.com*".to_string(),
        ]
    }

    fn needs_api_data(&self, ctx: &EvalContext, url: &str) -> bool {
        match classify(url) {
            None => self.is_legitimate_external_url(ctx, url),
            Some(HnPage::Unknown) => false,
            Some(_) => true,
        }
    }

    async fn fetch_api_data(&self, ctx: &mut EvalContext, url: &str) -> Result<Value, FetchError> {
        let Some(page) = classify(url) else {
            return Ok(self.external_url_data(ctx, url));
        };

        match page {
            HnPage::Item(id) => self
                .api
                .item(id)
                .await?
                .ok_or_else(|| FetchError::NotFound(format!("item {id}"))),
            HnPage::User(username) => self.user_data(&username).await,
            HnPage::Listing(list) => {
                let data = self.listing_data(list).await?;
                let added = extract_external_urls(ctx.registry_mut(PLUGIN_NAME), &data);
                debug!(url, added, "whitelisted external story links");
                Ok(data)
            }
            HnPage::Unknown => Ok(json!({})),
        }
    }

    fn is_url_allowed(&self, ctx: &EvalContext, url: &str) -> bool {
        self.owns_url(url) || self.is_legitimate_external_url(ctx, url)
    }

    fn ground_truth_trigger(&self, _validation_info: &Value) -> Option<TriggerConfig> {
        Some(
            TriggerConfig::new(UrlPatternTrigger::new().with_domains(ALLOWED_DOMAINS.iter().copied()))
                .with_strategy(FetchStrategy::First),
        )
    }
}
