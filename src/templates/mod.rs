//! Question templates: sample a task, then compute and score its ground truth.

pub mod price_ratio;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ground_truth::{GroundTruthResult, TriggerConfig};

pub use price_ratio::{MarketFeed, PriceFeed, PriceRatioTemplate};

static RE_FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+\.?\d*").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub question_text: String,
    pub start_url: String,
    pub variables: Map<String, Value>,
    /// Opaque to the agent. The only state carried into ground truth and scoring.
    pub validation_info: Value,
    pub template_name: String,
    /// Advisory.
    pub expected_steps: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub score: f64,
    pub is_correct: bool,
    pub expected: Option<Value>,
    pub actual: String,
    pub details: String,
}

impl ValidationResult {
    pub fn failed(expected: Option<Value>, actual: &str, details: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            is_correct: false,
            expected,
            actual: actual.to_string(),
            details: details.into(),
        }
    }
}

#[async_trait]
pub trait QuestionTemplate: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deterministic in `seed`.
    fn generate(&self, seed: u64) -> GeneratedQuestion;

    fn validation_rules(&self, validation_info: &Value) -> String;

    async fn ground_truth(&self, validation_info: &Value) -> GroundTruthResult;

    /// Scores `answer` against an already captured ground truth.
    fn validate_answer(&self, answer: &str, ground_truth: &GroundTruthResult) -> ValidationResult;

    fn ground_truth_trigger(&self, validation_info: &Value) -> Option<TriggerConfig>;

    /// Fetches ground truth now and scores against it.
    async fn validate_live(&self, answer: &str, validation_info: &Value) -> ValidationResult {
        let ground_truth = self.ground_truth(validation_info).await;
        self.validate_answer(answer, &ground_truth)
    }
}

/// First number in `text`, sign included, after dropping thousands separators.
pub fn first_number(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    RE_FIRST_NUMBER
        .find(&cleaned)
        .and_then(|found| found.as_str().parse().ok())
}

#[derive(Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<&'static str, Arc<dyn QuestionTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any template already registered under the same name.
    pub fn register(&mut self, template: Arc<dyn QuestionTemplate>) {
        self.templates.insert(template.name(), template);
    }

    pub fn with_template(mut self, template: Arc<dyn QuestionTemplate>) -> Self {
        self.register(template);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn QuestionTemplate>> {
        self.templates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.templates.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
