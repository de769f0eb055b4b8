use std::sync::atomic::{AtomicUsize, Ordering};

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    action::{ActionKind, ActionPrecedence, BrowserAction},
    browser::BrowserObservation,
    task::{CompositeTask, TrajectoryStep},
};

pub const DEFAULT_MAX_RECENT_STEPS: usize = 5;
pub const UNKNOWN_ACTION_WAIT_SECONDS: f64 = 0.5;

const NO_ACTIONS_YET: &str = "(no actions yet)";

const SYSTEM_TEMPLATE: &str = r#"You are a web automation agent that interacts with real websites to complete tasks.

You have access to a browser and can navigate to any website to gather information.
{{#if hints}}

## Available Information Sources

{{#each hints}}
{{this}}

{{/each}}
{{/if}}
## Task

{{task}}

{{protocol}}"#;

const STEP_TEMPLATE: &str = r#"## Current Page State

URL: {{url}}
Title: {{title}}

### Accessibility Tree
```
{{tree}}
```

### Recent Actions
{{recent}}

**Step {{current_step}}/{{max_steps}}** ({{remaining}} steps remaining)
{{#if last_step}}

**THIS IS YOUR LAST STEP!** You MUST use the "stop" action now and provide your best answers based on the information you have gathered. Do not attempt any other action.
{{/if}}

What is your next action? Remember: output ONLY a JSON object, no markdown or extra text."#;

const ACTION_PROTOCOL: &str = r#"## Action Protocol

Respond with exactly one JSON object:

{"thought": "<your reasoning>", "action": {"type": "<action_type>", "params": {...}}}

## Available Actions

- goto: {"type": "goto", "params": {"url": "https://example.com"}}
- click: {"type": "click", "params": {"selector": "button.submit"}}
- type: {"type": "type", "params": {"selector": "input#search", "text": "query", "press_enter": true}}
- press: {"type": "press", "params": {"key": "Enter"}}
- scroll: {"type": "scroll", "params": {"direction": "down", "amount": 300}}
- wait: {"type": "wait", "params": {"seconds": 2}}
- click_role: {"type": "click_role", "params": {"role": "button", "name": "Search"}}
- type_role: {"type": "type_role", "params": {"role": "textbox", "name": "Search", "text": "query", "press_enter": true}}
- stop: {"type": "stop", "params": {"format": "json", "final": {"answers": {"answer1": "value1"}}}}

## Tips

- Decide which website to visit first, then use "goto" to open it.
- Listing pages can be stale or rounded. Visit detail pages for precise values.
- When every question is answered, use "stop" with your answers.

## IMPORTANT

- Output ONLY a single JSON object.
- Do NOT wrap it in markdown code blocks.
- Do NOT include any text before or after the JSON."#;

static PROMPTS: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_template_string("system", SYSTEM_TEMPLATE)
        .expect("built-in system prompt template");
    hb.register_template_string("step", STEP_TEMPLATE)
        .expect("built-in step prompt template");
    hb
});

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());

static RE_THINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>(.*?)</think>").unwrap());

#[derive(Debug, thiserror::Error)]
#[error("prompt render error: {0}")]
pub struct PromptError(#[from] handlebars::RenderError);

/// Which rung of the repair ladder produced the decoded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTier {
    Direct,
    FencedBlock,
    BraceScan,
    ClosedTruncation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub thought: Option<String>,
    pub action: Option<BrowserAction>,
    pub tier: RepairTier,
}

#[derive(Serialize)]
struct SystemPromptData<'a> {
    hints: Vec<&'a str>,
    task: &'a str,
    protocol: &'a str,
}

#[derive(Serialize)]
struct StepPromptData<'a> {
    url: &'a str,
    title: &'a str,
    tree: &'a str,
    recent: String,
    current_step: usize,
    max_steps: usize,
    remaining: usize,
    last_step: bool,
}

/// Prompt assembly and reply decoding. Performs no I/O.
#[derive(Debug)]
pub struct AgentPolicy {
    max_recent_steps: usize,
    precedence: ActionPrecedence,
    json_repair_count: AtomicUsize,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECENT_STEPS)
    }
}

impl AgentPolicy {
    pub fn new(max_recent_steps: usize) -> Self {
        Self {
            max_recent_steps,
            precedence: ActionPrecedence::default(),
            json_repair_count: AtomicUsize::new(0),
        }
    }

    pub fn with_precedence(mut self, precedence: ActionPrecedence) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn max_recent_steps(&self) -> usize {
        self.max_recent_steps
    }

    /// Replies that needed any repair since the last reset.
    pub fn json_repair_count(&self) -> usize {
        self.json_repair_count.load(Ordering::Relaxed)
    }

    pub fn reset_repair_count(&self) {
        self.json_repair_count.store(0, Ordering::Relaxed);
    }

    pub fn build_system_prompt(&self, task: &CompositeTask) -> Result<String, PromptError> {
        let data = SystemPromptData {
            hints: task.plugin_hints.values().map(String::as_str).collect(),
            task: &task.combined_intent,
            protocol: ACTION_PROTOCOL,
        };
        Ok(PROMPTS.render("system", &data)?)
    }

    /// `current_step` is 1-based.
    pub fn build_step_prompt(
        &self,
        obs: &BrowserObservation,
        trajectory: &[TrajectoryStep],
        current_step: usize,
        max_steps: usize,
    ) -> Result<String, PromptError> {
        let remaining = max_steps.saturating_sub(current_step);
        let data = StepPromptData {
            url: &obs.url,
            title: &obs.title,
            tree: &obs.accessibility_tree,
            recent: self.recent_actions(trajectory),
            current_step,
            max_steps,
            remaining,
            last_step: remaining == 0,
        };
        Ok(PROMPTS.render("step", &data)?)
    }

    fn recent_actions(&self, trajectory: &[TrajectoryStep]) -> String {
        let tail_start = trajectory.len().saturating_sub(self.max_recent_steps);
        let recent = &trajectory[tail_start..];
        if recent.is_empty() {
            return NO_ACTIONS_YET.to_string();
        }
        recent
            .iter()
            .map(TrajectoryStep::summary)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Decodes a raw model reply. `None` means no tier recovered a JSON object.
    pub fn parse_response(&self, raw: &str) -> Option<ParsedResponse> {
        let (object, tier) = match parse_object(raw.trim()) {
            Some(object) => (object, RepairTier::Direct),
            None => {
                self.json_repair_count.fetch_add(1, Ordering::Relaxed);
                repair_object(raw)?
            }
        };
        debug!(?tier, "decoded model reply");

        let thought = object
            .get("thought")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                RE_THINK
                    .captures(raw)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().trim().to_string())
            })
            .filter(|thought| !thought.is_empty());

        let action = self.decode_action(&object);
        Some(ParsedResponse { thought, action, tier })
    }

    fn decode_action(&self, object: &Map<String, Value>) -> Option<BrowserAction> {
        let empty = Map::new();
        let (raw_type, params) = match object.get("action")? {
            Value::Object(action) if action.is_empty() => return None,
            Value::Object(action) => (
                action.get("type").and_then(Value::as_str).unwrap_or_default(),
                action.get("params").and_then(Value::as_object).unwrap_or(&empty),
            ),
            // {"action": "goto", "params": {...}}
            Value::String(name) if !name.trim().is_empty() => (
                name.as_str(),
                object.get("params").and_then(Value::as_object).unwrap_or(&empty),
            ),
            _ => return None,
        };

        let Some(kind) = ActionKind::resolve(raw_type, self.precedence) else {
            warn!(action_type = raw_type, "unknown action type, substituting wait");
            return Some(BrowserAction::wait(UNKNOWN_ACTION_WAIT_SECONDS));
        };
        if kind.as_str() != raw_type {
            debug!(action_type = raw_type, resolved = %kind, "recovered action type");
        }

        match BrowserAction::from_params(kind, params) {
            Ok(action) => Some(action),
            Err(err) => {
                warn!(error = %err, "rejected action parameters");
                None
            }
        }
    }
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Tiers after the direct parse, strictly in order of permissiveness.
fn repair_object(raw: &str) -> Option<(Map<String, Value>, RepairTier)> {
    for caps in RE_FENCED.captures_iter(raw) {
        if let Some(object) = caps.get(1).and_then(|body| parse_object(body.as_str())) {
            return Some((object, RepairTier::FencedBlock));
        }
    }

    // Depth-only spans first; quote-aware spans only recover what those miss.
    let (plain, _) = brace_spans(raw, false);
    let (quoted, truncated) = brace_spans(raw, true);
    if let Some(object) = longest_first(plain)
        .into_iter()
        .chain(longest_first(quoted))
        .find_map(parse_object)
    {
        return Some((object, RepairTier::BraceScan));
    }

    truncated
        .as_deref()
        .and_then(parse_object)
        .map(|object| (object, RepairTier::ClosedTruncation))
}

fn longest_first(mut spans: Vec<&str>) -> Vec<&str> {
    // Stable sort keeps left-to-right order among equal lengths.
    spans.sort_by(|a, b| b.len().cmp(&a.len()));
    spans
}

/// Every top-level `{...}` span, plus the unterminated tail (closed with the
/// missing braces) if the text ends inside an object. With `quote_aware`,
/// braces inside JSON strings are skipped; quotes are only tracked inside
/// objects so apostrophes in surrounding prose do not derail the scan.
fn brace_spans(text: &str, quote_aware: bool) -> (Vec<&str>, Option<String>) {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_str = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }

        match ch {
            '"' if quote_aware && depth > 0 => in_str = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    let truncated = match start {
        Some(s) if depth > 0 => {
            let mut closed = text[s..].to_string();
            if in_str {
                closed.push('"');
            }
            closed.push_str(&"}".repeat(depth));
            Some(closed)
        }
        _ => None,
    };

    (spans, truncated)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::task::StepOutcome;

    fn step(step_num: usize, url: &str) -> TrajectoryStep {
        TrajectoryStep {
            step_num,
            observation: BrowserObservation::blank(),
            thought: None,
            action: BrowserAction::goto(url),
            outcome: StepOutcome::Success,
            prompt: None,
            raw_response: None,
        }
    }

    #[test]
    fn direct_json_does_not_count_as_repair() {
        let policy = AgentPolicy::default();
        let parsed = policy
            .parse_response(r#"  {"thought": "open HN", "action": {"type": "goto", "params": {"url": "https://news.ycombinator.com"}}}  "#)
            .expect("parsed");

        assert_eq!(parsed.tier, RepairTier::Direct);
        assert_eq!(parsed.thought.as_deref(), Some("open HN"));
        assert_eq!(parsed.action, Some(BrowserAction::goto("https://news.ycombinator.com")));
        assert_eq!(policy.json_repair_count(), 0);
    }

    #[test]
    fn fenced_block_is_recovered_with_one_repair() {
        let policy = AgentPolicy::default();
        let raw = "Here you go:\n```json\n{\"thought\": \"t\", \"action\": {\"type\": \"press\", \"params\": {\"key\": \"Enter\"}}}\n```\n";
        let parsed = policy.parse_response(raw).expect("parsed");

        assert_eq!(parsed.tier, RepairTier::FencedBlock);
        assert_eq!(parsed.action, Some(BrowserAction::Press { key: "Enter".into() }));
        assert_eq!(policy.json_repair_count(), 1);
    }

    #[test]
    fn brace_scan_returns_the_only_parseable_span() {
        let policy = AgentPolicy::default();
        let valid = r#"{"action": {"type": "wait", "params": {"seconds": 3}}}"#;
        let garbage_long = "{this is not json at all, just a long rambling braced aside that goes on}";
        let garbage_short = "{x}";

        for raw in [
            format!("{garbage_long} then {valid} and {garbage_short}"),
            format!("{garbage_short} {valid} {garbage_long}"),
        ] {
            let parsed = policy.parse_response(&raw).expect("parsed");
            assert_eq!(parsed.tier, RepairTier::BraceScan);
            assert_eq!(parsed.action, Some(BrowserAction::wait(3.0)));
        }
    }

    #[test]
    fn brace_scan_prefers_longest_candidate() {
        let policy = AgentPolicy::default();
        let raw = r#"Draft {"action": {"type": "wait", "params": {}}} final {"action": {"type": "goto", "params": {"url": "https://stooq.com/q/?s=aapl.us"}}}"#;
        let parsed = policy.parse_response(raw).expect("parsed");
        assert_eq!(parsed.action, Some(BrowserAction::goto("https://stooq.com/q/?s=aapl.us")));
    }

    #[test]
    fn truncated_reply_is_closed_as_last_resort() {
        let policy = AgentPolicy::default();
        let raw = r#"<think>need the price</think> {"action": {"type": "goto", "params": {"url": "https://www.coingecko.com"}"#;
        let parsed = policy.parse_response(raw).expect("parsed");

        assert_eq!(parsed.tier, RepairTier::ClosedTruncation);
        assert_eq!(parsed.thought.as_deref(), Some("need the price"));
        assert_eq!(parsed.action, Some(BrowserAction::goto("https://www.coingecko.com")));
    }

    #[test]
    fn unparseable_reply_fails_but_counts_repair() {
        let policy = AgentPolicy::default();
        assert!(policy.parse_response("I will click the button now.").is_none());
        assert_eq!(policy.json_repair_count(), 1);
        policy.reset_repair_count();
        assert_eq!(policy.json_repair_count(), 0);
    }

    #[test]
    fn unknown_type_is_fuzzed_or_downgraded_to_wait() {
        let policy = AgentPolicy::default();

        let parsed = policy
            .parse_response(r##"{"action": {"type": "clicking", "params": {"selector": "#more"}}}"##)
            .expect("parsed");
        assert_eq!(parsed.action, Some(BrowserAction::Click { selector: "#more".into() }));

        let parsed = policy
            .parse_response(r#"{"action": {"type": "teleport", "params": {"to": "mars"}}}"#)
            .expect("parsed");
        assert_eq!(parsed.action, Some(BrowserAction::wait(UNKNOWN_ACTION_WAIT_SECONDS)));
    }

    #[test]
    fn missing_action_yields_thought_only() {
        let policy = AgentPolicy::default();
        let parsed = policy.parse_response(r#"{"thought": "thinking", "action": {}}"#).expect("parsed");
        assert_eq!(parsed.thought.as_deref(), Some("thinking"));
        assert!(parsed.action.is_none());

        let parsed = policy.parse_response(r#"{"thought": "still thinking"}"#).expect("parsed");
        assert!(parsed.action.is_none());
    }

    #[test]
    fn invalid_params_drop_the_action() {
        let policy = AgentPolicy::default();
        let parsed = policy
            .parse_response(r#"{"action": {"type": "goto", "params": {}}}"#)
            .expect("parsed");
        assert!(parsed.action.is_none());
    }

    #[test]
    fn system_prompt_lists_every_hint() {
        let policy = AgentPolicy::default();
        let task = CompositeTask {
            combined_intent: "How many shares of Apple could you buy with 1 Bitcoin?".into(),
            plugin_hints: BTreeMap::from([
                ("coingecko".to_string(), "Use coingecko.com for crypto prices.".to_string()),
                ("stooq".to_string(), "Use stooq.com for stock quotes.".to_string()),
            ]),
        };
        let prompt = policy.build_system_prompt(&task).unwrap();

        assert!(prompt.contains("## Available Information Sources"));
        assert!(prompt.contains("Use coingecko.com for crypto prices."));
        assert!(prompt.contains("Use stooq.com for stock quotes."));
        assert!(prompt.contains("How many shares of Apple"));
        assert!(prompt.contains(r#"{"thought": "<your reasoning>""#));

        let bare = policy.build_system_prompt(&CompositeTask::new("task")).unwrap();
        assert!(!bare.contains("Available Information Sources"));
    }

    #[test]
    fn step_prompt_shows_only_the_recent_tail() {
        let policy = AgentPolicy::new(2);
        let obs = BrowserObservation::new("https://news.ycombinator.com/", "Hacker News", "link \"past\"");
        let trajectory: Vec<_> = (0..4).map(|i| step(i, &format!("https://a.example/{i}"))).collect();

        let prompt = policy.build_step_prompt(&obs, &trajectory, 5, 10).unwrap();
        assert!(prompt.contains("URL: https://news.ycombinator.com/"));
        assert!(prompt.contains("link \"past\""));
        assert!(!prompt.contains("https://a.example/1"));
        assert!(prompt.contains(&format!("2: goto {} -> Success", json!({"url": "https://a.example/2"}))));
        assert!(prompt.contains("3: goto"));
        assert!(prompt.contains("**Step 5/10** (5 steps remaining)"));
        assert!(!prompt.contains("LAST STEP"));

        let first = policy.build_step_prompt(&obs, &[], 10, 10).unwrap();
        assert!(first.contains(NO_ACTIONS_YET));
        assert!(first.contains("THIS IS YOUR LAST STEP!"));
    }

    #[test]
    fn braces_inside_strings_do_not_split_quote_aware_spans() {
        let (spans, truncated) = brace_spans(r#"it's {"a": "}{"} done"#, true);
        assert_eq!(spans, vec![r#"{"a": "}{"}"#]);
        assert!(truncated.is_none());

        let policy = AgentPolicy::default();
        let parsed = policy
            .parse_response(r#"ok {"action": {"type": "click", "params": {"selector": "a:has-text('}')"}}} done"#)
            .expect("parsed");
        assert_eq!(parsed.action, Some(BrowserAction::Click { selector: "a:has-text('}')".into() }));
    }

    #[test]
    fn stray_quote_in_earlier_span_does_not_hide_later_ones() {
        let policy = AgentPolicy::default();
        let parsed = policy
            .parse_response(r#"Note {"a": "oops} then {"action": {"type": "wait", "params": {"seconds": 3}}}"#)
            .expect("parsed");
        assert_eq!(parsed.tier, RepairTier::BraceScan);
        assert_eq!(parsed.action, Some(BrowserAction::wait(3.0)));
    }
}
