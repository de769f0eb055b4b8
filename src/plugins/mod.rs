//! Content-source plugins and the per-evaluation anti-cheat state they share.

pub mod hackernews;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use url::Url;

use crate::{error::FetchError, ground_truth::TriggerConfig};

/// A content source the agent may browse, able to supply verifiable data for
/// the pages it recognizes.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn allowed_domains(&self) -> &[&'static str];

    fn usage_hint(&self) -> String {
        format!("Use {} to find information.", self.allowed_domains().join(", "))
    }

    /// `*`-globs the navigation gate should deny outright.
    fn get_blocked_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    fn needs_api_data(&self, ctx: &EvalContext, url: &str) -> bool;

    /// Authoritative payload for `url`. Listing pages also whitelist their
    /// outbound links in `ctx`.
    async fn fetch_api_data(&self, ctx: &mut EvalContext, url: &str) -> Result<Value, FetchError>;

    fn is_url_allowed(&self, ctx: &EvalContext, url: &str) -> bool;

    fn ground_truth_trigger(&self, _validation_info: &Value) -> Option<TriggerConfig> {
        None
    }

    fn owns_url(&self, url: &str) -> bool {
        let host = host_of(url);
        self.allowed_domains()
            .iter()
            .any(|domain| host_matches(&host, domain))
    }

    fn is_blocked(&self, url: &str) -> bool {
        self.get_blocked_patterns()
            .iter()
            .any(|pattern| glob_match(pattern, url))
    }
}

/// Mutable state of one evaluation. Each concurrent evaluation owns its own
/// context, so whitelists never leak between runs.
#[derive(Debug, Default)]
pub struct EvalContext {
    registries: HashMap<String, ExternalUrlRegistry>,
    api_data: BTreeMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self, plugin: &str) -> Option<&ExternalUrlRegistry> {
        self.registries.get(plugin)
    }

    pub fn registry_mut(&mut self, plugin: &str) -> &mut ExternalUrlRegistry {
        self.registries.entry(plugin.to_string()).or_default()
    }

    pub fn record_api_data(&mut self, url: impl Into<String>, data: Value) {
        self.api_data.insert(url.into(), data);
    }

    pub fn api_data(&self, url: &str) -> Option<&Value> {
        self.api_data.get(url)
    }

    pub fn collected(&self) -> &BTreeMap<String, Value> {
        &self.api_data
    }

    /// Ends the evaluation: drops every whitelist and collected payload.
    pub fn clear(&mut self) {
        self.registries.clear();
        self.api_data.clear();
    }
}

/// External URLs discovered in fetched source data, keyed by URL, each with
/// the record that linked it, plus the set of their bare domains.
#[derive(Debug, Clone, Default)]
pub struct ExternalUrlRegistry {
    urls: BTreeMap<String, Value>,
    domains: BTreeSet<String>,
}

impl ExternalUrlRegistry {
    /// Returns `false` when `url` has no usable host.
    pub fn insert(&mut self, url: &str, source_record: Value) -> bool {
        let Some(domain) = registry_domain(url) else {
            return false;
        };
        self.urls.insert(url.to_string(), source_record);
        self.domains.insert(domain);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn domains(&self) -> &BTreeSet<String> {
        &self.domains
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.urls.keys().map(String::as_str)
    }

    /// Exact, then trailing-slash variants, then normalized form, then domain.
    pub fn is_legitimate(&self, url: &str) -> bool {
        if self.lookup_url(url).is_some() {
            return true;
        }
        registry_domain(url).is_some_and(|domain| self.domains.contains(&domain))
    }

    /// The record that linked `url`, using the same tolerance as
    /// [`is_legitimate`](Self::is_legitimate). The domain tier returns the
    /// first record linking anywhere on that domain.
    pub fn source_record(&self, url: &str) -> Option<&Value> {
        if let Some(record) = self.lookup_url(url) {
            return Some(record);
        }
        let domain = registry_domain(url)?;
        self.urls
            .iter()
            .find(|(stored, _)| registry_domain(stored).as_deref() == Some(domain.as_str()))
            .map(|(_, record)| record)
    }

    pub fn clear(&mut self) {
        self.urls.clear();
        self.domains.clear();
    }

    fn lookup_url(&self, url: &str) -> Option<&Value> {
        let trimmed = url.trim_end_matches('/');
        if let Some(record) = self
            .urls
            .get(url)
            .or_else(|| self.urls.get(trimmed))
            .or_else(|| self.urls.get(&format!("{trimmed}/")))
        {
            return Some(record);
        }

        let normalized = normalize_for_matching(url);
        self.urls
            .iter()
            .find(|(stored, _)| normalize_for_matching(stored) == normalized)
            .map(|(_, record)| record)
    }
}

/// Lowercased host of `url`, or an empty string when it has none.
pub fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        .unwrap_or_default()
}

/// `host` is `domain` itself or one of its subdomains.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.').to_lowercase();
    if host.is_empty() || domain.is_empty() {
        return false;
    }
    let host = host.to_lowercase();
    host == domain
        || host
            .strip_suffix(domain.as_str())
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Bare domain used for the domain whitelist: lowercase, no port, no `www.`.
pub fn registry_domain(url: &str) -> Option<String> {
    let host = host_of(url);
    let domain = host.strip_prefix("www.").unwrap_or(&host);
    (!domain.is_empty()).then(|| domain.to_string())
}

/// `domain[:port]/path` with scheme, query and fragment dropped, `www.`
/// stripped and no trailing slash.
pub fn normalize_for_matching(url: &str) -> String {
    let lowered = url.to_lowercase();
    match Url::parse(&lowered) {
        Ok(parsed) if parsed.has_host() => {
            let host = parsed.host_str().unwrap_or_default();
            let host = host.strip_prefix("www.").unwrap_or(host);
            let port = parsed.port().map(|port| format!(":{port}")).unwrap_or_default();
            format!("{host}{port}{}", parsed.path().trim_end_matches('/'))
        }
        _ => lowered.trim_end_matches('/').to_string(),
    }
}

/// Case-insensitive match with `*` as the only wildcard.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?is)^{body}$")).is_ok_and(|re| re.is_match(text))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry_with(url: &str) -> ExternalUrlRegistry {
        let mut registry = ExternalUrlRegistry::default();
        assert!(registry.insert(url, json!({"id": 1, "title": "Story"})));
        registry
    }

    #[test]
    fn scheme_www_and_slash_variants_are_legitimate() {
        let registry = registry_with("https://x.example/a");

        assert!(registry.is_legitimate("https://x.example/a"));
        assert!(registry.is_legitimate("https://x.example/a/"));
        assert!(registry.is_legitimate("http://www.x.example/a/"));
        assert!(registry.is_legitimate("https://X.EXAMPLE/a?utm=1#top"));
    }

    #[test]
    fn same_domain_fallback_but_unknown_domains_refused() {
        let registry = registry_with("https://www.x.example/a");

        assert!(registry.is_legitimate("https://x.example/landing/after/redirect"));
        assert!(!registry.is_legitimate("https://y.example/a"));
        assert!(!registry.is_legitimate("not a url"));
        assert_eq!(registry.domains().iter().collect::<Vec<_>>(), vec!["x.example"]);
    }

    #[test]
    fn source_record_resolves_through_each_tier() {
        let mut registry = ExternalUrlRegistry::default();
        registry.insert("https://blog.example/post/", json!({"id": 7}));
        registry.insert("https://docs.example/guide", json!({"id": 8}));

        assert_eq!(registry.source_record("https://blog.example/post"), Some(&json!({"id": 7})));
        assert_eq!(registry.source_record("http://www.docs.example/guide/"), Some(&json!({"id": 8})));
        assert_eq!(registry.source_record("https://docs.example/other"), Some(&json!({"id": 8})));
        assert_eq!(registry.source_record("https://nope.example/"), None);
    }

    #[test]
    fn inserting_hostless_urls_is_rejected() {
        let mut registry = ExternalUrlRegistry::default();
        assert!(!registry.insert("mailto:someone", json!({})));
        assert!(registry.is_empty());
    }

    #[test]
    fn port_is_dropped_from_whitelisted_domain() {
        let registry = registry_with("https://x.example:8443/a");
        assert!(registry.domains().contains("x.example"));
        assert!(registry.is_legitimate("https://x.example/b"));
    }

    #[test]
    fn context_clear_drops_everything() {
        let mut ctx = EvalContext::new();
        ctx.registry_mut("hackernews").insert("https://x.example/", json!({}));
        ctx.record_api_data("https://news.ycombinator.com/", json!({"stories": {}}));

        ctx.clear();

        assert!(ctx.registry("hackernews").is_none());
        assert!(ctx.collected().is_empty());
    }

    #[test]
    fn host_matching_is_exact_or_subdomain() {
        assert!(host_matches("news.ycombinator.com", "news.ycombinator.com"));
        assert!(host_matches("NEWS.ycombinator.com", "ycombinator.com"));
        assert!(host_matches("www.stooq.com", "stooq.com"));
        assert!(!host_matches("news.ycombinator.com.evil.example", "news.ycombinator.com"));
        assert!(!host_matches("notstooq.com", "stooq.com"));
        assert!(!host_matches("", "stooq.com"));
    }

    #[test]
    fn glob_patterns_match_wildcards() {
        assert!(glob_match("*hacker-news.firebaseio.com*", "https://hacker-news.firebaseio.com/v0/item/1.json"));
        assert!(glob_match("*hn.algolia.com*", "https://HN.algolia.com/api/v1/search"));
        assert!(!glob_match("*hn.algolia.com*", "https://news.ycombinator.com/"));
        assert!(glob_match("https://a.example/?", "https://a.example/?"));
        assert!(!glob_match("https://a.example/?", "https://a.example/x"));
    }
}
