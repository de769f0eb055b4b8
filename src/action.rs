use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ActionError;

/// The closed set of action kinds the agent may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Goto,
    Click,
    Type,
    Press,
    Scroll,
    Wait,
    ClickRole,
    TypeRole,
    Stop,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::Goto,
        ActionKind::Click,
        ActionKind::Type,
        ActionKind::Press,
        ActionKind::Scroll,
        ActionKind::Wait,
        ActionKind::ClickRole,
        ActionKind::TypeRole,
        ActionKind::Stop,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::Goto => "goto",
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Press => "press",
            ActionKind::Scroll => "scroll",
            ActionKind::Wait => "wait",
            ActionKind::ClickRole => "click_role",
            ActionKind::TypeRole => "type_role",
            ActionKind::Stop => "stop",
        }
    }

    /// Exact, case-sensitive lookup.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Exact lookup first, then case-insensitive substring containment in
    /// either direction. When several kinds match, `precedence` decides.
    pub fn resolve(name: &str, precedence: ActionPrecedence) -> Option<Self> {
        if let Some(kind) = Self::from_name(name) {
            return Some(kind);
        }

        let lowered = name.trim().to_lowercase();
        if lowered.is_empty() {
            return None;
        }

        let candidates: Vec<ActionKind> = Self::ALL
            .into_iter()
            .filter(|kind| lowered.contains(kind.as_str()) || kind.as_str().contains(lowered.as_str()))
            .collect();

        precedence.pick(&lowered, &candidates)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tie-break among several action kinds that fuzzily match one unknown name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPrecedence {
    /// First match in `ActionKind::ALL` order.
    EnumerationOrder,
    /// Longest kind name wins, so `click_role_button` resolves to `click_role`
    /// rather than `click`. Ties fall back to enumeration order.
    #[default]
    LongestName,
    /// Highest normalized Levenshtein similarity to the raw name.
    Similarity,
}

impl ActionPrecedence {
    fn pick(self, lowered: &str, candidates: &[ActionKind]) -> Option<ActionKind> {
        match self {
            ActionPrecedence::EnumerationOrder => candidates.first().copied(),
            ActionPrecedence::LongestName => candidates.iter().copied().fold(None, |best, kind| {
                match best {
                    Some(current) if current.as_str().len() >= kind.as_str().len() => Some(current),
                    _ => Some(kind),
                }
            }),
            ActionPrecedence::Similarity => candidates.iter().copied().fold(None, |best, kind| {
                let score = strsim::normalized_levenshtein(lowered, kind.as_str());
                match best {
                    Some((current, best_score)) if best_score >= score => Some((current, best_score)),
                    _ => Some((kind, score)),
                }
            })
            .map(|(kind, _)| kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            "left" => Some(ScrollDirection::Left),
            "right" => Some(ScrollDirection::Right),
            _ => None,
        }
    }
}

pub const DEFAULT_SCROLL_AMOUNT: i64 = 300;
pub const DEFAULT_WAIT_SECONDS: f64 = 1.0;

/// A validated browser action. Serializes to the wire shape
/// `{"type": "...", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum BrowserAction {
    Goto {
        url: String,
    },
    Click {
        selector: String,
    },
    Type {
        selector: String,
        text: String,
        press_enter: bool,
    },
    Press {
        key: String,
    },
    Scroll {
        direction: ScrollDirection,
        amount: i64,
    },
    Wait {
        seconds: f64,
    },
    ClickRole {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    TypeRole {
        role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        text: String,
        press_enter: bool,
    },
    Stop {
        #[serde(rename = "final")]
        answer: Value,
    },
}

impl BrowserAction {
    pub fn goto(url: impl Into<String>) -> Self {
        BrowserAction::Goto { url: url.into() }
    }

    pub fn wait(seconds: f64) -> Self {
        BrowserAction::Wait { seconds }
    }

    pub fn stop(answer: Value) -> Self {
        BrowserAction::Stop { answer }
    }

    /// Validates the untyped parameter map for `kind` and builds the action.
    pub fn from_params(kind: ActionKind, params: &Map<String, Value>) -> Result<Self, ActionError> {
        let action = match kind {
            ActionKind::Goto => BrowserAction::Goto {
                url: required_str(kind, params, "url")?,
            },
            ActionKind::Click => BrowserAction::Click {
                selector: required_str(kind, params, "selector")?,
            },
            ActionKind::Type => BrowserAction::Type {
                selector: required_str(kind, params, "selector")?,
                text: required_text(kind, params, "text")?,
                press_enter: bool_param(kind, params, "press_enter")?.unwrap_or(false),
            },
            ActionKind::Press => BrowserAction::Press {
                key: required_str(kind, params, "key")?,
            },
            ActionKind::Scroll => {
                let direction = match optional_str(params, "direction") {
                    Some(raw) => ScrollDirection::parse(&raw).ok_or_else(|| ActionError::InvalidParams {
                        action: kind.as_str(),
                        message: format!("unknown scroll direction '{raw}'"),
                    })?,
                    None => ScrollDirection::Down,
                };
                let amount = number_param(kind, params, "amount")?
                    .map(|value| value.round() as i64)
                    .unwrap_or(DEFAULT_SCROLL_AMOUNT);
                BrowserAction::Scroll { direction, amount }
            }
            ActionKind::Wait => {
                let seconds = number_param(kind, params, "seconds")?.unwrap_or(DEFAULT_WAIT_SECONDS);
                if seconds < 0.0 {
                    return Err(ActionError::InvalidParams {
                        action: kind.as_str(),
                        message: format!("negative duration {seconds}"),
                    });
                }
                BrowserAction::Wait { seconds }
            }
            ActionKind::ClickRole => BrowserAction::ClickRole {
                role: required_str(kind, params, "role")?,
                name: optional_str(params, "name"),
            },
            ActionKind::TypeRole => BrowserAction::TypeRole {
                role: required_str(kind, params, "role")?,
                name: optional_str(params, "name"),
                text: required_text(kind, params, "text")?,
                press_enter: bool_param(kind, params, "press_enter")?.unwrap_or(false),
            },
            ActionKind::Stop => {
                let answer = match params.get("final") {
                    Some(value) if !is_empty_value(value) => value.clone(),
                    _ => Value::Object(params.clone()),
                };
                BrowserAction::Stop { answer }
            }
        };
        Ok(action)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            BrowserAction::Goto { .. } => ActionKind::Goto,
            BrowserAction::Click { .. } => ActionKind::Click,
            BrowserAction::Type { .. } => ActionKind::Type,
            BrowserAction::Press { .. } => ActionKind::Press,
            BrowserAction::Scroll { .. } => ActionKind::Scroll,
            BrowserAction::Wait { .. } => ActionKind::Wait,
            BrowserAction::ClickRole { .. } => ActionKind::ClickRole,
            BrowserAction::TypeRole { .. } => ActionKind::TypeRole,
            BrowserAction::Stop { .. } => ActionKind::Stop,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, BrowserAction::Stop { .. })
    }

    /// The `params` half of the wire shape.
    pub fn params(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("params").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for BrowserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.params())
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn optional_str(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_str(
    kind: ActionKind,
    params: &Map<String, Value>,
    key: &'static str,
) -> Result<String, ActionError> {
    optional_str(params, key).ok_or(ActionError::MissingParam {
        action: kind.as_str(),
        param: key,
    })
}

// Typed text may legitimately be empty (clearing a field), so only presence is checked.
fn required_text(
    kind: ActionKind,
    params: &Map<String, Value>,
    key: &'static str,
) -> Result<String, ActionError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ActionError::MissingParam {
            action: kind.as_str(),
            param: key,
        }),
    }
}

fn number_param(
    kind: ActionKind,
    params: &Map<String, Value>,
    key: &str,
) -> Result<Option<f64>, ActionError> {
    let invalid = |raw: &Value| ActionError::InvalidParams {
        action: kind.as_str(),
        message: format!("'{key}' is not a number: {raw}"),
    };
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(raw @ Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(raw)),
        Some(raw @ Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(raw)),
        Some(other) => Err(invalid(other)),
    }
}

fn bool_param(
    kind: ActionKind,
    params: &Map<String, Value>,
    key: &str,
) -> Result<Option<bool>, ActionError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" | "" => Ok(Some(false)),
            _ => Err(ActionError::InvalidParams {
                action: kind.as_str(),
                message: format!("'{key}' is not a boolean: {s}"),
            }),
        },
        Some(Value::Number(n)) => Ok(Some(n.as_f64().map_or(false, |v| v != 0.0))),
        Some(other) => Err(ActionError::InvalidParams {
            action: kind.as_str(),
            message: format!("'{key}' is not a boolean: {other}"),
        }),
    }
}
