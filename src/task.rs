use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{action::BrowserAction, browser::BrowserObservation};

/// Immutable task descriptor handed to the agent loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositeTask {
    pub combined_intent: String,
    /// Plugin name to usage hint. Ordered so prompts are reproducible.
    #[serde(default)]
    pub plugin_hints: BTreeMap<String, String>,
}

impl CompositeTask {
    pub fn new(combined_intent: impl Into<String>) -> Self {
        Self {
            combined_intent: combined_intent.into(),
            plugin_hints: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, plugin: impl Into<String>, hint: impl Into<String>) -> Self {
        self.plugin_hints.insert(plugin.into(), hint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    ParseFailed,
    ActionFailed(String),
    Completed,
    LlmError(String),
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Success => f.write_str("Success"),
            StepOutcome::ParseFailed => f.write_str("Parse failed, waiting"),
            StepOutcome::ActionFailed(cause) => write!(f, "Action failed: {cause}"),
            StepOutcome::Completed => f.write_str("Task completed"),
            StepOutcome::LlmError(cause) => write!(f, "LLM error: {cause}"),
        }
    }
}

/// One append-only trajectory record. `observation` is always the state the
/// agent saw before `action` ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step_num: usize,
    pub observation: BrowserObservation,
    pub thought: Option<String>,
    pub action: BrowserAction,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl TrajectoryStep {
    /// `step_num: type {params} -> result`
    pub fn summary(&self) -> String {
        format!("{}: {} -> {}", self.step_num, self.action, self.outcome)
    }
}
