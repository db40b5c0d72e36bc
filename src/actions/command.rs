//! Classification of parsed action text into agent commands.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{looks_like_package, AppRegistry};

const DO_PREFIX: &str = "do(";
const FINISH_PREFIX: &str = "finish(";

/// Key under which a nested call's function name is stored.
pub const CALL_KEY: &str = "_call";

/// How a `finish(...)` call ended the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishOutcome {
    Success,
    Failure,
}

/// A `finish(...)` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishAction {
    pub message: Option<String>,
    pub outcome: FinishOutcome,
}

/// A `do(...)` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoAction {
    /// Action name, e.g. `Tap`, `Launch` or `open_app` for nested calls.
    pub name: String,
    /// Keyword arguments. Nested calls are objects carrying [`CALL_KEY`].
    pub args: Map<String, Value>,
    /// Action text as produced by the parser.
    pub raw: String,
}

/// App an action wants to operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetApp {
    pub package: String,
    pub name: Option<String>,
}

/// A command the agent loop can act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Do(DoAction),
    Finish(FinishAction),
    /// The model answered with nothing usable.
    Empty,
}

impl Action {
    /// Classify the action text of a parsed reply.
    ///
    /// Text that is neither a call nor a JSON object is read as the model
    /// answering in prose, i.e. a successful finish carrying that text.
    /// Blank text is [`Action::Empty`].
    pub fn classify(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Action::Empty;
        }

        if let Some(body) = call_body(text, FINISH_PREFIX) {
            let args = parse_kwargs(body);
            return Action::Finish(finish_from_args(&args));
        }

        if let Some(body) = call_body(text, DO_PREFIX) {
            let args = parse_kwargs(body);
            return Action::Do(DoAction {
                name: action_name(args.get("action")),
                args,
                raw: text.to_string(),
            });
        }

        if text.starts_with('{') {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
                return from_json(obj, text);
            }
        }

        Action::Finish(FinishAction {
            message: Some(text.to_string()),
            outcome: FinishOutcome::Success,
        })
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Action::Finish(_))
    }
}

impl DoAction {
    /// Resolve the app this action targets, if it names one.
    ///
    /// Looks at `package=`, then `app=`, then the `package=`/`app=`/`name=`
    /// arguments of any nested call.
    pub fn target_app(&self, registry: &AppRegistry) -> Option<TargetApp> {
        let direct = ["package", "app"]
            .iter()
            .find_map(|key| self.args.get(*key).and_then(Value::as_str));

        let nested = || {
            self.args
                .values()
                .filter_map(Value::as_object)
                .filter(|obj| obj.contains_key(CALL_KEY))
                .find_map(|obj| {
                    ["package", "app", "name"]
                        .iter()
                        .find_map(|key| obj.get(*key).and_then(Value::as_str))
                })
        };

        direct
            .or_else(nested)
            .filter(|value| !value.trim().is_empty())
            .map(|value| resolve_app(value.trim(), registry))
    }
}

fn resolve_app(value: &str, registry: &AppRegistry) -> TargetApp {
    if let Some(package) = registry.package_for(value) {
        return TargetApp {
            package: package.to_string(),
            name: Some(value.to_string()),
        };
    }
    if looks_like_package(value) {
        return TargetApp {
            package: value.to_string(),
            name: registry.name_for(value).map(str::to_string),
        };
    }
    // Unknown display name: the policy sees it verbatim.
    TargetApp {
        package: value.to_string(),
        name: Some(value.to_string()),
    }
}

fn action_name(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Object(obj)) => obj
            .get(CALL_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn from_json(obj: Map<String, Value>, raw: &str) -> Action {
    let kind = obj
        .get("action")
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if kind.eq_ignore_ascii_case("finish") {
        return Action::Finish(finish_from_args(&obj));
    }

    Action::Do(DoAction {
        name: kind,
        args: obj,
        raw: raw.to_string(),
    })
}

fn finish_from_args(args: &Map<String, Value>) -> FinishAction {
    let message = args.get("message").map(|value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    FinishAction {
        message,
        outcome: finish_outcome(args),
    }
}

/// A finish fails only through an explicit `success`/`ok` flag or `status`
/// value. The message text is never inspected.
fn finish_outcome(args: &Map<String, Value>) -> FinishOutcome {
    let flag_false = ["success", "ok"].iter().any(|key| {
        args.get(*key).is_some_and(|value| match value {
            Value::Bool(b) => !b,
            Value::Number(n) => n.as_f64() == Some(0.0),
            Value::String(s) => matches!(s.to_lowercase().as_str(), "false" | "no" | "0"),
            _ => false,
        })
    });

    let status_failed = args
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| matches!(s.to_lowercase().as_str(), "failed" | "failure" | "error"));

    if flag_false || status_failed {
        FinishOutcome::Failure
    } else {
        FinishOutcome::Success
    }
}

/// Body between `prefix` (case-insensitive) and its matching close paren.
///
/// Text after the close paren is ignored. An unclosed call yields the rest
/// of the text.
fn call_body<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &text[prefix.len()..];

    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    for (idx, c) in rest.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[..idx]);
                }
            }
            _ => {}
        }
    }

    Some(rest)
}

/// Split at top-level commas, ignoring commas inside quotes, brackets or parens.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0usize;

    for (idx, c) in body.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&body[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Position of the first `=` outside quotes.
fn find_assign(segment: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in segment.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '=' => return Some(idx),
            None => {}
        }
    }
    None
}

/// Parse `key=value, ...` into a JSON object.
///
/// A segment without `=` belongs to the previous value, so unquoted
/// messages containing commas survive.
fn parse_kwargs(body: &str) -> Map<String, Value> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for segment in split_top_level(body) {
        match find_assign(segment) {
            Some(eq) => {
                let key = segment[..eq].trim();
                if !key.is_empty() {
                    pairs.push((key.to_string(), segment[eq + 1..].to_string()));
                }
            }
            None => {
                if let Some((_, value)) = pairs.last_mut() {
                    value.push(',');
                    value.push_str(segment);
                }
            }
        }
    }

    pairs
        .into_iter()
        .map(|(key, raw)| (key, parse_value(raw.trim())))
        .collect()
}

/// Parse a value string into a JSON Value.
fn parse_value(raw: &str) -> Value {
    if let Some(inner) = strip_quotes(raw) {
        return json!(inner);
    }

    if raw.starts_with('[') && raw.ends_with(']') && raw.len() >= 2 {
        let inner = &raw[1..raw.len() - 1];
        if inner.trim().is_empty() {
            return json!([]);
        }
        let items: Vec<Value> = split_top_level(inner)
            .into_iter()
            .map(|item| parse_value(item.trim()))
            .collect();
        return json!(items);
    }

    if let Some(open) = raw.find('(') {
        let name = &raw[..open];
        if !name.is_empty()
            && raw.ends_with(')')
            && name.chars().all(|c| c.is_alphanumeric() || c == '_')
        {
            let mut args = parse_kwargs(&raw[open + 1..raw.len() - 1]);
            args.insert(CALL_KEY.to_string(), json!(name));
            return Value::Object(args);
        }
    }

    if let Ok(n) = raw.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return json!(f);
    }

    match raw {
        "true" | "True" => json!(true),
        "false" | "False" => json!(false),
        _ => json!(raw),
    }
}

fn strip_quotes(raw: &str) -> Option<&str> {
    let first = raw.chars().next()?;
    if (first == '"' || first == '\'') && raw.len() >= 2 && raw.ends_with(first) {
        Some(&raw[1..raw.len() - 1])
    } else {
        None
    }
}
