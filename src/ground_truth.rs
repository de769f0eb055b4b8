//! When to snapshot ground truth during a trajectory, and what was captured.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    agent_loop::NavigationHook,
    browser::BLANK_PAGE,
    error::FetchError,
    plugins::{host_matches, EvalContext, Plugin},
    scoring::Subtask,
    templates::QuestionTemplate,
};

pub const DEFAULT_MIN_FETCH_INTERVAL: Duration = Duration::from_secs(120);

/// Tri-state fetch outcome. `Retry` means a later attempt may succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroundTruthResult {
    Ok { value: Value },
    Fail { reason: String },
    Retry { reason: String },
}

impl GroundTruthResult {
    pub fn ok(value: Value) -> Self {
        GroundTruthResult::Ok { value }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        GroundTruthResult::Fail { reason: reason.into() }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        GroundTruthResult::Retry { reason: reason.into() }
    }

    pub fn from_fetch_error(context: &str, err: &FetchError) -> Self {
        let reason = format!("{context}: {err}");
        if err.is_transient() {
            Self::retry(reason)
        } else {
            Self::fail(reason)
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, GroundTruthResult::Ok { .. })
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, GroundTruthResult::Retry { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            GroundTruthResult::Ok { value } => Some(value),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GroundTruthResult::Ok { .. } => None,
            GroundTruthResult::Fail { reason } | GroundTruthResult::Retry { reason } => Some(reason),
        }
    }
}

pub trait GroundTruthTrigger: fmt::Debug + Send + Sync {
    fn matches(&self, url: &str) -> bool;

    fn description(&self) -> String;
}

fn is_blank(url: &str) -> bool {
    url.is_empty() || url == BLANK_PAGE
}

/// Lowercased, percent-decoded, with `+` read as a space.
fn normalize_for_contains(text: &str) -> String {
    percent_encoding::percent_decode_str(&text.replace('+', " "))
        .decode_utf8_lossy()
        .to_lowercase()
}

fn host_in(parsed: &Url, domains: &[String]) -> bool {
    let host = parsed.host_str().unwrap_or_default();
    domains.iter().any(|domain| host_matches(host, domain))
}

/// Every configured condition must hold. A domain also covers its
/// subdomains, so `stooq.com` matches `www.stooq.com`.
#[derive(Debug, Clone, Default)]
pub struct UrlPatternTrigger {
    domains: Vec<String>,
    path_contains: Option<String>,
    url_regex: Option<Regex>,
    url_contains: Option<String>,
}

impl UrlPatternTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_path_contains(mut self, fragment: impl Into<String>) -> Self {
        self.path_contains = Some(fragment.into());
        self
    }

    pub fn with_url_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.url_regex = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Empty fragments are ignored.
    pub fn with_url_contains(mut self, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        self.url_contains = (!fragment.is_empty()).then_some(fragment);
        self
    }
}

impl GroundTruthTrigger for UrlPatternTrigger {
    fn matches(&self, url: &str) -> bool {
        if is_blank(url) {
            return false;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };

        if !self.domains.is_empty() && !host_in(&parsed, &self.domains) {
            return false;
        }
        if let Some(fragment) = &self.path_contains {
            if !parsed.path().contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(re) = &self.url_regex {
            if !re.is_match(url) {
                return false;
            }
        }
        if let Some(fragment) = &self.url_contains {
            if !normalize_for_contains(url).contains(&normalize_for_contains(fragment)) {
                return false;
            }
        }
        true
    }

    fn description(&self) -> String {
        let mut parts = Vec::new();
        if !self.domains.is_empty() {
            parts.push(format!("domains={:?}", self.domains));
        }
        if let Some(fragment) = &self.path_contains {
            parts.push(format!("path_contains={fragment}"));
        }
        if let Some(re) = &self.url_regex {
            parts.push(format!("regex={}", re.as_str()));
        }
        if let Some(fragment) = &self.url_contains {
            parts.push(format!("url_contains={fragment}"));
        }
        format!("UrlPatternTrigger({})", parts.join(", "))
    }
}

/// Domain, path fragment and a set of query parameters that must be present,
/// optionally with a fixed value (compared case-insensitively).
#[derive(Debug, Clone)]
pub struct UrlWithParamsTrigger {
    domains: Vec<String>,
    required_path: Option<String>,
    required_params: Vec<String>,
    param_values: Vec<(String, String)>,
}

impl UrlWithParamsTrigger {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
            required_path: None,
            required_params: Vec::new(),
            param_values: Vec::new(),
        }
    }

    pub fn with_required_path(mut self, path: impl Into<String>) -> Self {
        self.required_path = Some(path.into());
        self
    }

    pub fn with_required_param(mut self, param: impl Into<String>) -> Self {
        self.required_params.push(param.into());
        self
    }

    /// Empty values are ignored.
    pub fn with_param_value(mut self, param: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.param_values.push((param.into(), value));
        }
        self
    }
}

impl GroundTruthTrigger for UrlWithParamsTrigger {
    fn matches(&self, url: &str) -> bool {
        if is_blank(url) {
            return false;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };

        if !host_in(&parsed, &self.domains) {
            return false;
        }
        if let Some(path) = &self.required_path {
            if !parsed.path().contains(path.as_str()) {
                return false;
            }
        }
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        let has_param = |param: &str| pairs.iter().any(|(key, _)| key == param);
        let has_value = |param: &str, value: &str| {
            pairs
                .iter()
                .any(|(key, actual)| key == param && actual.trim().eq_ignore_ascii_case(value.trim()))
        };
        self.required_params.iter().all(|param| has_param(param))
            && self
                .param_values
                .iter()
                .all(|(param, value)| has_value(param, value))
    }

    fn description(&self) -> String {
        format!(
            "UrlWithParamsTrigger(domains={:?}, path={})",
            self.domains,
            self.required_path.as_deref().unwrap_or("*")
        )
    }
}

/// Fires when any member fires.
#[derive(Debug, Clone, Default)]
pub struct CompositeTrigger {
    triggers: Vec<Arc<dyn GroundTruthTrigger>>,
}

impl CompositeTrigger {
    pub fn new(triggers: Vec<Arc<dyn GroundTruthTrigger>>) -> Self {
        Self { triggers }
    }

    pub fn with_trigger(mut self, trigger: impl GroundTruthTrigger + 'static) -> Self {
        self.triggers.push(Arc::new(trigger));
        self
    }
}

impl GroundTruthTrigger for CompositeTrigger {
    fn matches(&self, url: &str) -> bool {
        self.triggers.iter().any(|trigger| trigger.matches(url))
    }

    fn description(&self) -> String {
        let inner: Vec<String> = self.triggers.iter().map(|t| t.description()).collect();
        format!("CompositeTrigger(OR: [{}])", inner.join(", "))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Keep the first successful snapshot.
    #[default]
    First,
    /// Refetch on later matches and keep the latest.
    Last,
    /// Keep every distinct value, for range validation.
    All,
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub trigger: Arc<dyn GroundTruthTrigger>,
    pub strategy: FetchStrategy,
    /// Only applies to `Last` and `All`.
    pub min_fetch_interval: Duration,
}

impl TriggerConfig {
    pub fn new(trigger: impl GroundTruthTrigger + 'static) -> Self {
        Self {
            trigger: Arc::new(trigger),
            strategy: FetchStrategy::First,
            min_fetch_interval: DEFAULT_MIN_FETCH_INTERVAL,
        }
    }

    pub fn with_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_min_fetch_interval(mut self, interval: Duration) -> Self {
        self.min_fetch_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GroundTruthFetch {
    pub url: String,
    pub result: GroundTruthResult,
    pub fetched_at: Instant,
}

/// Fetch history of one question. `Retry` fetches are kept for the record
/// but do not count as triggering.
#[derive(Debug, Clone)]
pub struct GroundTruthState {
    pub strategy: FetchStrategy,
    pub min_fetch_interval: Duration,
    fetches: Vec<GroundTruthFetch>,
}

impl GroundTruthState {
    pub fn new(strategy: FetchStrategy, min_fetch_interval: Duration) -> Self {
        Self {
            strategy,
            min_fetch_interval,
            fetches: Vec::new(),
        }
    }

    pub fn record(&mut self, url: impl Into<String>, result: GroundTruthResult) {
        self.fetches.push(GroundTruthFetch {
            url: url.into(),
            result,
            fetched_at: Instant::now(),
        });
    }

    pub fn fetches(&self) -> &[GroundTruthFetch] {
        &self.fetches
    }

    fn settled(&self) -> impl Iterator<Item = &GroundTruthFetch> {
        self.fetches.iter().filter(|fetch| !fetch.result.is_retry())
    }

    pub fn triggered(&self) -> bool {
        self.settled().next().is_some()
    }

    pub fn should_fetch_again(&self) -> bool {
        let Some(last) = self.settled().last() else {
            return true;
        };
        match self.strategy {
            FetchStrategy::First => false,
            FetchStrategy::Last | FetchStrategy::All => {
                last.fetched_at.elapsed() >= self.min_fetch_interval
            }
        }
    }

    /// First or last successful value, or for `All` an array of distinct
    /// successful values in fetch order.
    pub fn ground_truth(&self) -> Option<Value> {
        let mut values = self.fetches.iter().filter_map(|fetch| fetch.result.value());
        match self.strategy {
            FetchStrategy::First => values.next().cloned(),
            FetchStrategy::Last => values.last().cloned(),
            FetchStrategy::All => {
                let mut seen = HashSet::new();
                let unique: Vec<Value> = values
                    .filter(|value| seen.insert(value.to_string()))
                    .cloned()
                    .collect();
                (!unique.is_empty()).then_some(Value::Array(unique))
            }
        }
    }

    /// Numeric (min, max) over the collected values. Only for `All`.
    pub fn ground_truth_range(&self) -> Option<(f64, f64)> {
        if self.strategy != FetchStrategy::All {
            return None;
        }
        let Some(Value::Array(values)) = self.ground_truth() else {
            return None;
        };
        values
            .iter()
            .filter_map(|value| match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .fold(None, |range, v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((f64::min(lo, v), f64::max(hi, v))),
            })
    }

    /// Strategy value when any fetch succeeded, otherwise the latest failure.
    pub fn result(&self) -> GroundTruthResult {
        if let Some(value) = self.ground_truth() {
            return GroundTruthResult::ok(value);
        }
        self.fetches
            .last()
            .map(|fetch| fetch.result.clone())
            .unwrap_or_else(|| GroundTruthResult::retry("ground truth was never fetched"))
    }
}

struct TrackedQuestion {
    template: Arc<dyn QuestionTemplate>,
    validation_info: Value,
    trigger: Option<Arc<dyn GroundTruthTrigger>>,
    state: GroundTruthState,
}

struct CollectorState {
    ctx: EvalContext,
    questions: BTreeMap<String, TrackedQuestion>,
}

/// Per-evaluation collector. Feeds plugin data into its own [`EvalContext`]
/// and snapshots template ground truth when triggers fire.
pub struct GroundTruthCollector {
    plugins: Vec<Arc<dyn Plugin>>,
    state: Mutex<CollectorState>,
}

impl GroundTruthCollector {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins,
            state: Mutex::new(CollectorState {
                ctx: EvalContext::new(),
                questions: BTreeMap::new(),
            }),
        }
    }

    /// Registers a question under `tag`. Questions without a trigger are
    /// only fetched by [`finalize`](Self::finalize).
    pub async fn track(
        &self,
        tag: impl Into<String>,
        template: Arc<dyn QuestionTemplate>,
        validation_info: Value,
    ) {
        let config = template.ground_truth_trigger(&validation_info);
        let (trigger, state) = match config {
            Some(config) => (
                Some(config.trigger),
                GroundTruthState::new(config.strategy, config.min_fetch_interval),
            ),
            None => (
                None,
                GroundTruthState::new(FetchStrategy::First, DEFAULT_MIN_FETCH_INTERVAL),
            ),
        };
        let tag = tag.into();
        debug!(tag = %tag, trigger = ?trigger.as_ref().map(|t| t.description()), "tracking question");
        self.state.lock().await.questions.insert(
            tag,
            TrackedQuestion {
                template,
                validation_info,
                trigger,
                state,
            },
        );
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Whether some plugin accepts `url` under this evaluation's whitelist.
    pub async fn is_url_allowed(&self, url: &str) -> bool {
        let state = self.state.lock().await;
        self.plugins.iter().any(|plugin| plugin.is_url_allowed(&state.ctx, url))
    }

    pub fn is_blocked(&self, url: &str) -> bool {
        self.plugins.iter().any(|plugin| plugin.is_blocked(url))
    }

    pub async fn api_data(&self, url: &str) -> Option<Value> {
        self.state.lock().await.ctx.api_data(url).cloned()
    }

    pub async fn collected_urls(&self) -> Vec<String> {
        self.state.lock().await.ctx.collected().keys().cloned().collect()
    }

    /// Tags whose trigger has fired with a settled result.
    pub async fn triggered_tags(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .questions
            .iter()
            .filter(|(_, question)| question.state.triggered())
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Tracked questions in tag order, ready for scoring.
    pub async fn subtasks(&self) -> Vec<Subtask> {
        let state = self.state.lock().await;
        state
            .questions
            .iter()
            .map(|(tag, question)| {
                Subtask::new(tag.clone(), question.template.name(), question.validation_info.clone())
            })
            .collect()
    }

    /// Current per-tag results without fetching anything.
    pub async fn results(&self) -> BTreeMap<String, GroundTruthResult> {
        let state = self.state.lock().await;
        state
            .questions
            .iter()
            .map(|(tag, question)| (tag.clone(), question.state.result()))
            .collect()
    }

    /// Fetches ground truth for questions that never triggered, returns every
    /// question's result and clears the evaluation context.
    pub async fn finalize(&self) -> BTreeMap<String, GroundTruthResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        for (tag, question) in state.questions.iter_mut() {
            if question.state.triggered() {
                continue;
            }
            info!(tag = %tag, "fallback ground truth fetch");
            let result = question.template.ground_truth(&question.validation_info).await;
            question.state.record("fallback", result);
        }

        let results = state
            .questions
            .iter()
            .map(|(tag, question)| (tag.clone(), question.state.result()))
            .collect();
        state.ctx.clear();
        results
    }

    async fn collect_plugin_data(&self, ctx: &mut EvalContext, url: &str) -> Result<(), FetchError> {
        let mut first_error = None;
        for plugin in &self.plugins {
            if !plugin.is_url_allowed(ctx, url) || !plugin.needs_api_data(ctx, url) {
                continue;
            }
            match plugin.fetch_api_data(ctx, url).await {
                Ok(data) => {
                    debug!(plugin = plugin.name(), url, "collected api data");
                    ctx.record_api_data(url, data);
                }
                Err(err) => {
                    warn!(plugin = plugin.name(), url, error = %err, "api data fetch failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl NavigationHook for GroundTruthCollector {
    async fn on_navigation(&self, url: &str) -> Result<(), FetchError> {
        if is_blank(url) {
            return Ok(());
        }
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let plugin_result = self.collect_plugin_data(&mut state.ctx, url).await;

        for (tag, question) in state.questions.iter_mut() {
            let Some(trigger) = &question.trigger else {
                continue;
            };
            if !trigger.matches(url) || !question.state.should_fetch_again() {
                continue;
            }
            let result = question.template.ground_truth(&question.validation_info).await;
            info!(tag = %tag, url, ok = result.is_ok(), retry = result.is_retry(), "ground truth trigger fired");
            question.state.record(url, result);
        }

        plugin_result
    }
}
