//! Structural diff of JSON payloads
//!
//! Every mismatch reported by the harness carries a [`StructuralDiff`]: the
//! list of leaf paths where the recorded and live payloads disagree, with the
//! expected (recorded) and actual (live) values at each path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Maximum number of differences rendered by `Display`
const DISPLAY_LIMIT: usize = 5;

/// One differing field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Field path, e.g. `messages[2].content`
    pub path: String,

    /// Recorded value (`None` when the field is absent from the fixture)
    pub expected: Option<Value>,

    /// Live value (`None` when the field is absent from the live payload)
    pub actual: Option<Value>,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() {
            "<root>"
        } else {
            &self.path
        };
        write!(
            f,
            "{}: expected {}, actual {}",
            path,
            render(self.expected.as_ref()),
            render(self.actual.as_ref())
        )
    }
}

/// Ordered list of field differences between two payloads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralDiff {
    pub differences: Vec<FieldDiff>,
}

impl StructuralDiff {
    /// Compute the diff of `expected` against `actual`.
    ///
    /// Objects are compared key by key (sorted union of keys), arrays by
    /// position. Any other pair of values is compared for equality.
    pub fn compute(expected: &Value, actual: &Value) -> Self {
        let mut differences = Vec::new();
        diff_values("", Some(expected), Some(actual), &mut differences);
        Self { differences }
    }

    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn len(&self) -> usize {
        self.differences.len()
    }

    /// First difference, if any
    pub fn first(&self) -> Option<&FieldDiff> {
        self.differences.first()
    }

    /// Find the difference at an exact path
    pub fn at(&self, path: &str) -> Option<&FieldDiff> {
        self.differences.iter().find(|d| d.path == path)
    }
}

impl fmt::Display for StructuralDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.differences.is_empty() {
            return write!(f, "  (no differences)");
        }

        for (i, diff) in self.differences.iter().take(DISPLAY_LIMIT).enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  {}", diff)?;
        }

        if self.differences.len() > DISPLAY_LIMIT {
            write!(
                f,
                "\n  ... and {} more",
                self.differences.len() - DISPLAY_LIMIT
            )?;
        }
        Ok(())
    }
}

fn diff_values(
    path: &str,
    expected: Option<&Value>,
    actual: Option<&Value>,
    out: &mut Vec<FieldDiff>,
) {
    match (expected, actual) {
        (Some(Value::Object(e)), Some(Value::Object(a))) => {
            let keys: BTreeSet<&String> = e.keys().chain(a.keys()).collect();
            for key in keys {
                diff_values(&join_path(path, key), e.get(key), a.get(key), out);
            }
        }
        (Some(Value::Array(e)), Some(Value::Array(a))) => {
            for i in 0..e.len().max(a.len()) {
                diff_values(&format!("{}[{}]", path, i), e.get(i), a.get(i), out);
            }
        }
        (e, a) if e == a => {}
        (e, a) => out.push(FieldDiff {
            path: path.to_string(),
            expected: e.cloned(),
            actual: a.cloned(),
        }),
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else if segment.is_empty() {
        prefix.to_string()
    } else if segment.starts_with('[') {
        format!("{}{}", prefix, segment)
    } else {
        format!("{}.{}", prefix, segment)
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        None => "<absent>".to_string(),
        Some(v) => {
            let text = v.to_string();
            if text.chars().count() > 80 {
                let truncated: String = text.chars().take(77).collect();
                format!("{}...", truncated)
            } else {
                text
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_payloads() {
        let value = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        assert!(StructuralDiff::compute(&value, &value).is_empty());
    }

    #[test]
    fn test_nested_path() {
        let expected = json!({"messages": [{"content": "a"}, {"content": "b"}, {"content": "c"}]});
        let actual = json!({"messages": [{"content": "a"}, {"content": "b"}, {"content": "x"}]});

        let diff = StructuralDiff::compute(&expected, &actual);
        assert_eq!(diff.len(), 1);
        let first = diff.first().unwrap();
        assert_eq!(first.path, "messages[2].content");
        assert_eq!(first.expected, Some(json!("c")));
        assert_eq!(first.actual, Some(json!("x")));
    }

    #[test]
    fn test_missing_and_extra_fields() {
        let expected = json!({"a": 1, "b": 2});
        let actual = json!({"b": 2, "c": 3});

        let diff = StructuralDiff::compute(&expected, &actual);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff.at("a").unwrap().actual, None);
        assert_eq!(diff.at("c").unwrap().expected, None);
    }

    #[test]
    fn test_array_length_difference() {
        let diff = StructuralDiff::compute(&json!([1, 2]), &json!([1, 2, 3]));
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.first().unwrap().path, "[2]");
    }

    #[test]
    fn test_type_change_reported_at_parent() {
        let diff = StructuralDiff::compute(&json!({"a": {"b": 1}}), &json!({"a": "flat"}));
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.first().unwrap().path, "a");
    }

    #[test]
    fn test_display_truncates() {
        let expected: Vec<i32> = (0..8).collect();
        let actual: Vec<i32> = (10..18).collect();
        let diff = StructuralDiff::compute(&json!(expected), &json!(actual));
        let rendered = diff.to_string();
        assert!(rendered.contains("[0]: expected 0, actual 10"));
        assert!(rendered.contains("... and 3 more"));
    }
}
