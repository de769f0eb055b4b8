//! Turns a run's final answer into per-subtask and aggregate scores.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::ArenaConfig,
    ground_truth::GroundTruthResult,
    templates::TemplateRegistry,
};

pub const DEFAULT_SUCCESS_THRESHOLD: f64 = 0.8;

static RE_ANSWER_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<answer(\d+)>(.*?)</answer(\d+)>").unwrap());

/// One question of a composite task, keyed by the answer tag the agent
/// must fill in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub answer_tag: String,
    pub template_name: String,
    pub validation_info: Value,
}

impl Subtask {
    pub fn new(answer_tag: impl Into<String>, template_name: impl Into<String>, validation_info: Value) -> Self {
        Self {
            answer_tag: answer_tag.into(),
            template_name: template_name.into(),
            validation_info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskScore {
    pub answer_tag: String,
    pub template_name: String,
    pub score: f64,
    pub is_correct: bool,
    pub expected: Option<Value>,
    pub actual: Option<String>,
    pub details: String,
}

impl SubtaskScore {
    fn zero(subtask: &Subtask, actual: Option<&str>, details: impl Into<String>) -> Self {
        Self {
            answer_tag: subtask.answer_tag.clone(),
            template_name: subtask.template_name.clone(),
            score: 0.0,
            is_correct: false,
            expected: None,
            actual: actual.map(str::to_string),
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub task_name: String,
    /// Mean of the subtask scores, 0.0 when there are none.
    pub score: f64,
    pub success: bool,
    pub subtask_scores: Vec<SubtaskScore>,
}

/// Extracts `answerN` values from a stop payload.
///
/// Accepts `{"answers": {"answer1": ..}}`, `{"answers": [{"id": 1, "value": ..}]}`,
/// top-level `answerN` keys, and as a fallback `<answerN>..</answerN>` tags in
/// a plain string or in the payload's `final_raw` field. Nulls are skipped.
pub fn parse_answers(final_answer: Option<&Value>) -> BTreeMap<String, String> {
    let Some(response) = final_answer else {
        return BTreeMap::new();
    };

    let answers = json_answers(response);
    if !answers.is_empty() {
        return answers;
    }
    match response {
        Value::String(text) => tag_answers(text),
        Value::Object(fields) => fields
            .get("final_raw")
            .and_then(Value::as_str)
            .map(tag_answers)
            .unwrap_or_default(),
        _ => BTreeMap::new(),
    }
}

fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn keyed_answers(fields: &serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    fields
        .iter()
        .filter(|(key, _)| key.starts_with("answer"))
        .filter_map(|(key, value)| answer_text(value).map(|text| (key.clone(), text)))
        .collect()
}

fn json_answers(response: &Value) -> BTreeMap<String, String> {
    let Some(fields) = response.as_object() else {
        return BTreeMap::new();
    };
    match fields.get("answers") {
        None => keyed_answers(fields),
        Some(Value::Object(answers)) => keyed_answers(answers),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let id = match item.get("id")? {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.trim().to_string(),
                    _ => return None,
                };
                let text = answer_text(item.get("value")?)?;
                Some((format!("answer{id}"), text))
            })
            .collect(),
        Some(_) => BTreeMap::new(),
    }
}

fn tag_answers(text: &str) -> BTreeMap<String, String> {
    RE_ANSWER_TAG
        .captures_iter(text)
        .filter(|caps| caps[1] == caps[3])
        .map(|caps| (format!("answer{}", &caps[1]), caps[2].trim().to_string()))
        .collect()
}

/// Validates each subtask's answer with its template and aggregates the mean.
pub struct Scorer {
    templates: TemplateRegistry,
    success_threshold: f64,
}

impl Scorer {
    pub fn new(templates: TemplateRegistry) -> Self {
        Self {
            templates,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }

    pub fn from_config(templates: TemplateRegistry, config: &ArenaConfig) -> Self {
        Self::new(templates).with_success_threshold(config.success_threshold)
    }

    pub fn with_success_threshold(mut self, threshold: f64) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn success_threshold(&self) -> f64 {
        self.success_threshold
    }

    /// Scores against the captured `ground_truth`. Subtasks with no captured
    /// result are validated live.
    pub async fn score(
        &self,
        subtasks: &[Subtask],
        answers: &BTreeMap<String, String>,
        ground_truth: &BTreeMap<String, GroundTruthResult>,
    ) -> EvaluationResult {
        let mut subtask_scores = Vec::with_capacity(subtasks.len());

        for subtask in subtasks {
            let Some(answer) = answers.get(&subtask.answer_tag) else {
                subtask_scores.push(SubtaskScore::zero(subtask, None, "No answer provided"));
                continue;
            };
            let Some(template) = self.templates.get(&subtask.template_name) else {
                warn!(template = %subtask.template_name, "no template registered for subtask");
                subtask_scores.push(SubtaskScore::zero(
                    subtask,
                    Some(answer),
                    format!("Template '{}' not found", subtask.template_name),
                ));
                continue;
            };

            let result = match ground_truth.get(&subtask.answer_tag) {
                Some(truth) => template.validate_answer(answer, truth),
                None => template.validate_live(answer, &subtask.validation_info).await,
            };
            debug!(tag = %subtask.answer_tag, score = result.score, details = %result.details, "subtask scored");
            subtask_scores.push(SubtaskScore {
                answer_tag: subtask.answer_tag.clone(),
                template_name: subtask.template_name.clone(),
                score: result.score,
                is_correct: result.is_correct,
                expected: result.expected,
                actual: Some(result.actual),
                details: result.details,
            });
        }

        let score = if subtask_scores.is_empty() {
            0.0
        } else {
            subtask_scores.iter().map(|s| s.score).sum::<f64>() / subtask_scores.len() as f64
        };

        EvaluationResult {
            task_name: format!("liveweb_arena:{}tasks", subtasks.len()),
            score,
            success: score >= self.success_threshold,
            subtask_scores,
        }
    }
}
