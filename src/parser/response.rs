//! Response parser for splitting model output into thinking and action.
//!
//! The model is free to wrap its command in prose, XML-ish tags or JSON.
//! Parsing is a fixed, ordered list of [`Strategy`] values (first match wins)
//! followed by an ordered list of [`Recovery`] values that only run when the
//! chosen action does not already look like a command.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const FINISH_MARKER: &str = "finish(message=";
const DO_MARKER: &str = "do(action=";
const ANSWER_OPEN: &str = "<answer>";
const ANSWER_CLOSE: &str = "</answer>";

/// Reasoning markers removed from the thinking part of an `<answer>` reply.
const REASONING_MARKERS: [&str; 4] = [
    "<think>",
    "</think>",
    "<redacted_reasoning>",
    "</redacted_reasoning>",
];

/// Prefixes that mark an action as already well-formed.
const COMMAND_PREFIXES: [&str; 3] = ["{", "do(", "finish("];

static CALL_EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:do|finish)\([^)]*\)").expect("call expression regex"));

/// Model output split into reasoning and command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAction {
    pub thinking: String,
    pub action: String,
}

impl ParsedAction {
    fn new(thinking: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            action: action.into(),
        }
    }

    /// Whether the action starts like a command the agent understands.
    pub fn is_command(&self) -> bool {
        COMMAND_PREFIXES
            .iter()
            .any(|prefix| self.action.starts_with(prefix))
    }
}

/// One splitting rule. Rules are tried in [`STRATEGIES`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Split at the first occurrence of a call marker; the marker stays in the action.
    Marker(&'static str),
    /// `<answer>` tag, with reasoning markers stripped from the thinking part.
    AnswerTag,
    /// Whole content is the action.
    Raw,
}

/// Splitting rules in priority order.
pub const STRATEGIES: [Strategy; 4] = [
    Strategy::Marker(FINISH_MARKER),
    Strategy::Marker(DO_MARKER),
    Strategy::AnswerTag,
    Strategy::Raw,
];

impl Strategy {
    /// Apply this rule, returning `None` when it does not match.
    pub fn apply(&self, content: &str) -> Option<ParsedAction> {
        match self {
            Strategy::Marker(marker) => {
                let idx = content.find(marker)?;
                Some(ParsedAction::new(
                    content[..idx].trim(),
                    &content[idx..],
                ))
            }
            Strategy::AnswerTag => {
                let (before, after) = content.split_once(ANSWER_OPEN)?;
                let thinking = REASONING_MARKERS
                    .iter()
                    .fold(before.to_string(), |acc, marker| acc.replace(marker, ""));
                let answer = match after.rfind(ANSWER_CLOSE) {
                    Some(end) => &after[..end],
                    None => after,
                };
                Some(ParsedAction::new(thinking.trim(), answer.trim()))
            }
            Strategy::Raw => Some(ParsedAction::new("", content.trim())),
        }
    }
}

/// Fallback extraction used when the split action is not a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// First `do(...)` / `finish(...)` call anywhere in the content, case-insensitive.
    CallExpression,
    /// First balanced `{...}` literal that is valid JSON.
    JsonObject,
}

/// Recovery rules in priority order.
pub const RECOVERIES: [Recovery; 2] = [Recovery::CallExpression, Recovery::JsonObject];

impl Recovery {
    /// Search the full original content for a usable action.
    pub fn recover(&self, content: &str) -> Option<String> {
        match self {
            Recovery::CallExpression => CALL_EXPRESSION
                .find(content)
                .map(|m| m.as_str().to_string()),
            Recovery::JsonObject => json_candidates(content)
                .into_iter()
                .find(|candidate| serde_json::from_str::<Value>(candidate).is_ok())
                .map(str::to_string),
        }
    }
}

/// Collect every top-level balanced-brace span in `content`.
fn json_candidates(content: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = idx;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    candidates.push(&content[start..=idx]);
                }
            }
            _ => {}
        }
    }

    candidates
}

/// Parse raw model output into a [`ParsedAction`].
///
/// Never fails. Unrecognized input comes back as
/// `{ thinking: "", action: content.trim() }`.
pub fn parse(content: &str) -> ParsedAction {
    let mut parsed = STRATEGIES
        .iter()
        .find_map(|strategy| strategy.apply(content))
        .unwrap_or_else(|| ParsedAction::new("", content.trim()));

    if !parsed.is_command() {
        if let Some(action) = RECOVERIES
            .iter()
            .find_map(|recovery| recovery.recover(content))
        {
            tracing::debug!("Recovered action from unstructured reply: {}", action);
            parsed.action = action;
        }
    }

    parsed
}
