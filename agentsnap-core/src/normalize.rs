//! Payload normalization
//!
//! Recorded and live payloads differ in run-specific noise: timestamps,
//! generated identifiers, whitespace. The [`Normalizer`] rewrites a payload
//! into a canonical form so two runs of the same agent compare equal. The
//! same normalization is applied to the stored side and the live side before
//! any comparison, and applying it twice is the same as applying it once.
//!
//! # Field rules
//!
//! Rules address fields with dot-separated path patterns. Array elements are
//! addressed by their index. `*` matches exactly one segment and `**` matches
//! any number of segments (including none):
//!
//! - `messages.*.content` matches the content of every message
//! - `**.timestamp` matches a `timestamp` key at any depth
//!
//! The first matching rule wins. User rules for the payload kind are tried
//! first, then user rules for all kinds, then the built-in defaults.
//!
//! # Value patterns
//!
//! Regular expressions applied to every string value that no rule exempted.
//! By default UUIDs become `<uuid>` and RFC 3339 timestamps `<timestamp>`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{Result, SnapshotError};

/// Placeholder written in place of masked values
pub const MASK_PLACEHOLDER: &str = "<masked>";

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});

static TIMESTAMP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})").unwrap()
});

/// Kind of payload being normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Request,
    Response,
    Event,
    ToolCall,
}

impl PayloadKind {
    pub const ALL: [PayloadKind; 4] = [
        PayloadKind::Request,
        PayloadKind::Response,
        PayloadKind::Event,
        PayloadKind::ToolCall,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Request => "request",
            PayloadKind::Response => "response",
            PayloadKind::Event => "event",
            PayloadKind::ToolCall => "tool_call",
        }
    }
}

impl std::str::FromStr for PayloadKind {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(PayloadKind::Request),
            "response" => Ok(PayloadKind::Response),
            "event" | "events" => Ok(PayloadKind::Event),
            "tool_call" | "tool_calls" => Ok(PayloadKind::ToolCall),
            other => Err(SnapshotError::Configuration(format!(
                "Unknown payload kind '{}'",
                other
            ))),
        }
    }
}

/// What to do with a field matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeAction {
    /// Remove the field (array elements become `null` so positions are kept)
    Drop,
    /// Replace the value with [`MASK_PLACEHOLDER`]; `null` stays `null`
    Mask,
    /// Trim and collapse whitespace in strings, turn integral floats into integers
    Canonicalize,
    /// Leave the subtree untouched, shadowing any later rule or value pattern
    Keep,
}

/// A path pattern and the action applied to matching fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub path: String,
    pub action: NormalizeAction,
}

impl FieldRule {
    pub fn new(path: impl Into<String>, action: NormalizeAction) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }

    pub fn drop(path: impl Into<String>) -> Self {
        Self::new(path, NormalizeAction::Drop)
    }

    pub fn mask(path: impl Into<String>) -> Self {
        Self::new(path, NormalizeAction::Mask)
    }

    pub fn canonicalize(path: impl Into<String>) -> Self {
        Self::new(path, NormalizeAction::Canonicalize)
    }

    pub fn keep(path: impl Into<String>) -> Self {
        Self::new(path, NormalizeAction::Keep)
    }
}

/// Regex replacement applied to string values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePattern {
    pub pattern: String,
    pub replacement: String,
}

impl ValuePattern {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

/// Normalizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Apply the built-in rules and value patterns
    pub use_defaults: bool,

    /// Rules applied to every payload kind
    pub rules: Vec<FieldRule>,

    /// Rules for LLM requests
    pub request: Vec<FieldRule>,

    /// Rules for LLM responses and chunks
    pub response: Vec<FieldRule>,

    /// Rules for agent events
    pub event: Vec<FieldRule>,

    /// Rules for tool-call records
    pub tool_call: Vec<FieldRule>,

    /// Extra value patterns, applied before the defaults
    pub value_patterns: Vec<ValuePattern>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            use_defaults: true,
            rules: Vec::new(),
            request: Vec::new(),
            response: Vec::new(),
            event: Vec::new(),
            tool_call: Vec::new(),
            value_patterns: Vec::new(),
        }
    }
}

impl NormalizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with no built-in rules or patterns
    pub fn bare() -> Self {
        Self {
            use_defaults: false,
            ..Self::default()
        }
    }

    pub fn with_defaults(mut self, use_defaults: bool) -> Self {
        self.use_defaults = use_defaults;
        self
    }

    /// Add a rule for every payload kind
    pub fn with_rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Add a rule for one payload kind
    pub fn with_kind_rule(mut self, kind: PayloadKind, rule: FieldRule) -> Self {
        self.rules_for_mut(kind).push(rule);
        self
    }

    pub fn with_value_pattern(mut self, pattern: ValuePattern) -> Self {
        self.value_patterns.push(pattern);
        self
    }

    fn rules_for(&self, kind: PayloadKind) -> &[FieldRule] {
        match kind {
            PayloadKind::Request => &self.request,
            PayloadKind::Response => &self.response,
            PayloadKind::Event => &self.event,
            PayloadKind::ToolCall => &self.tool_call,
        }
    }

    fn rules_for_mut(&mut self, kind: PayloadKind) -> &mut Vec<FieldRule> {
        match kind {
            PayloadKind::Request => &mut self.request,
            PayloadKind::Response => &mut self.response,
            PayloadKind::Event => &mut self.event,
            PayloadKind::ToolCall => &mut self.tool_call,
        }
    }
}

/// Built-in rules for a payload kind (kind-specific rules first)
pub fn default_rules(kind: PayloadKind) -> Vec<FieldRule> {
    let mut rules = match kind {
        PayloadKind::Request => vec![
            FieldRule::mask("**.request_id"),
            FieldRule::mask("messages.*.tool_calls.*.id"),
            FieldRule::mask("messages.*.tool_call_id"),
            FieldRule::canonicalize("messages.*.content"),
        ],
        PayloadKind::Response => vec![
            FieldRule::mask("id"),
            FieldRule::drop("created"),
            FieldRule::mask("tool_calls.*.id"),
        ],
        PayloadKind::Event => vec![
            FieldRule::mask("**.task_id"),
            FieldRule::drop("**.duration_ms"),
            FieldRule::mask("**.tool_call_id"),
            FieldRule::mask("**.run_id"),
        ],
        PayloadKind::ToolCall => vec![FieldRule::mask("id"), FieldRule::drop("duration_ms")],
    };
    rules.push(FieldRule::drop("**.timestamp"));
    rules.push(FieldRule::drop("**.created_at"));
    rules
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Any,
    Deep,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    segments: Vec<Segment>,
    action: NormalizeAction,
}

impl CompiledRule {
    fn compile(rule: &FieldRule) -> Result<Self> {
        if rule.path.trim().is_empty() {
            return Err(SnapshotError::Configuration(
                "Normalizer rule path cannot be empty".to_string(),
            ));
        }

        let segments = rule
            .path
            .split('.')
            .map(|segment| match segment {
                "" => Err(SnapshotError::Configuration(format!(
                    "Normalizer rule path '{}' has an empty segment",
                    rule.path
                ))),
                "*" => Ok(Segment::Any),
                "**" => Ok(Segment::Deep),
                literal => Ok(Segment::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            segments,
            action: rule.action,
        })
    }

    fn matches(&self, path: &[String]) -> bool {
        matches_segments(&self.segments, path)
    }
}

fn matches_segments(pattern: &[Segment], path: &[String]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((Segment::Deep, rest)) => (0..=path.len()).any(|i| matches_segments(rest, &path[i..])),
        Some((segment, rest)) => match path.split_first() {
            None => false,
            Some((head, tail)) => {
                let head_matches = match segment {
                    Segment::Literal(literal) => literal == head,
                    Segment::Any | Segment::Deep => true,
                };
                head_matches && matches_segments(rest, tail)
            }
        },
    }
}

/// Compiled normalizer
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizerConfig,
    rules: [Vec<CompiledRule>; 4],
    patterns: Vec<(Regex, String)>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(NormalizerConfig::default()).expect("built-in normalizer rules compile")
    }
}

impl Normalizer {
    /// Compile a configuration, rejecting malformed paths and regexes
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        let mut rules: [Vec<CompiledRule>; 4] = Default::default();

        for kind in PayloadKind::ALL {
            let mut ordered: Vec<FieldRule> = config.rules_for(kind).to_vec();
            ordered.extend(config.rules.iter().cloned());
            if config.use_defaults {
                ordered.extend(default_rules(kind));
            }
            rules[kind_slot(kind)] = ordered
                .iter()
                .map(CompiledRule::compile)
                .collect::<Result<Vec<_>>>()?;
        }

        let mut patterns = config
            .value_patterns
            .iter()
            .map(|p| {
                Regex::new(&p.pattern)
                    .map(|regex| (regex, p.replacement.clone()))
                    .map_err(|e| {
                        SnapshotError::Configuration(format!(
                            "Invalid value pattern '{}': {}",
                            p.pattern, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if config.use_defaults {
            patterns.push((UUID_PATTERN.clone(), "<uuid>".to_string()));
            patterns.push((TIMESTAMP_PATTERN.clone(), "<timestamp>".to_string()));
        }

        Ok(Self {
            config,
            rules,
            patterns,
        })
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize a payload of the given kind
    pub fn normalize(&self, kind: PayloadKind, payload: &Value) -> Value {
        let mut path = Vec::new();
        self.rewrite(kind, &mut path, payload.clone(), false)
    }

    /// Normalize every payload in a slice
    pub fn normalize_all(&self, kind: PayloadKind, payloads: &[Value]) -> Vec<Value> {
        payloads.iter().map(|p| self.normalize(kind, p)).collect()
    }

    /// Serialize then normalize
    pub fn normalize_serialize<T: Serialize>(&self, kind: PayloadKind, payload: &T) -> Result<Value> {
        let value = serde_json::to_value(payload)?;
        Ok(self.normalize(kind, &value))
    }

    fn action_for(&self, kind: PayloadKind, path: &[String]) -> Option<NormalizeAction> {
        self.rules[kind_slot(kind)]
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.action)
    }

    fn rewrite(
        &self,
        kind: PayloadKind,
        path: &mut Vec<String>,
        value: Value,
        canonical: bool,
    ) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    path.push(key);
                    let rewritten = self.rewrite_child(kind, path, child, canonical);
                    if let Some(key) = path.pop()
                        && let Some(child) = rewritten
                    {
                        out.insert(key, child);
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    path.push(i.to_string());
                    out.push(
                        self.rewrite_child(kind, path, item, canonical)
                            .unwrap_or(Value::Null),
                    );
                    path.pop();
                }
                Value::Array(out)
            }
            Value::String(s) => Value::String(self.rewrite_string(s, canonical)),
            Value::Number(n) if canonical => canonical_number(n),
            other => other,
        }
    }

    fn rewrite_child(
        &self,
        kind: PayloadKind,
        path: &mut Vec<String>,
        value: Value,
        canonical: bool,
    ) -> Option<Value> {
        match self.action_for(kind, path) {
            Some(NormalizeAction::Drop) => None,
            Some(NormalizeAction::Mask) => Some(mask(value)),
            Some(NormalizeAction::Keep) => Some(value),
            Some(NormalizeAction::Canonicalize) => Some(self.rewrite(kind, path, value, true)),
            None => Some(self.rewrite(kind, path, value, canonical)),
        }
    }

    fn rewrite_string(&self, s: String, canonical: bool) -> String {
        // Patterns see collapsed text so a value split by a line break is
        // masked on the first pass
        let mut s = if canonical { collapse_whitespace(&s) } else { s };
        for (regex, replacement) in &self.patterns {
            if regex.is_match(&s) {
                s = regex.replace_all(&s, replacement.as_str()).into_owned();
            }
        }
        if canonical { collapse_whitespace(&s) } else { s }
    }
}

/// Normalize a payload with a one-off configuration
pub fn normalize(kind: PayloadKind, payload: &Value, config: &NormalizerConfig) -> Result<Value> {
    Ok(Normalizer::new(config.clone())?.normalize(kind, payload))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn kind_slot(kind: PayloadKind) -> usize {
    match kind {
        PayloadKind::Request => 0,
        PayloadKind::Response => 1,
        PayloadKind::Event => 2,
        PayloadKind::ToolCall => 3,
    }
}

fn mask(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        _ => Value::String(MASK_PLACEHOLDER.to_string()),
    }
}

fn canonical_number(n: Number) -> Value {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(f as i64),
        _ => Value::Number(n),
    }
}
