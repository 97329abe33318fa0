//! Structural comparison of expected and observed tool calls.
//!
//! Expected calls are grouped as alternatives, each a list of sequences, each
//! a list of calls. The first alternative that matches wins. Sequence order is
//! governed by [`MatchOptions::ordered`]; the order of calls inside a sequence
//! is always significant. Argument values in expectations are regex patterns
//! searched against the stringified actual value.

use regex::Regex;
use serde_json::Value;

use crate::types::{ToolCall, ToolCallSequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    pub ordered: bool,
    /// `false` tolerates extra argument keys and extra actual sequences.
    pub full_match: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            full_match: true,
        }
    }
}

impl MatchOptions {
    fn order_mode(&self) -> &'static str {
        if self.ordered {
            "ordered"
        } else {
            "unordered"
        }
    }

    fn match_mode(&self) -> &'static str {
        if self.full_match {
            "full"
        } else {
            "partial"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchStats {
    pub matched: usize,
    pub total: usize,
}

impl MatchStats {
    pub fn unmatched(&self) -> usize {
        self.total - self.matched
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlternativeMatch {
    pub success: bool,
    pub stats: Option<MatchStats>,
}

/// Tries every alternative in declaration order and explains the outcome.
pub fn evaluate_tool_calls(
    expected: &[Vec<ToolCallSequence>],
    actual: &[ToolCallSequence],
    options: MatchOptions,
) -> (bool, String) {
    for (index, alternative) in expected.iter().enumerate() {
        let outcome = compare_tool_calls(alternative, actual, options);
        if outcome.success {
            return (true, success_message(index, alternative, options, outcome.stats));
        }
    }

    tracing::debug!(
        alternatives = expected.len(),
        actual = %format_tool_calls(actual),
        "no tool call alternative matched"
    );
    (false, failure_message(expected, actual))
}

/// Compares one alternative (a list of sequences) against the actual sequences.
pub fn compare_tool_calls(
    expected: &[ToolCallSequence],
    actual: &[ToolCallSequence],
    options: MatchOptions,
) -> AlternativeMatch {
    if expected.is_empty() {
        return AlternativeMatch {
            success: actual.is_empty(),
            stats: None,
        };
    }

    let lenient = !options.full_match;

    if lenient {
        let matched = if options.ordered {
            ordered_subsequence_matches(expected, actual, lenient)
        } else {
            max_one_to_one_matches(expected, actual, lenient)
        };
        let stats = MatchStats {
            matched,
            total: expected.len(),
        };
        tracing::debug!(matched, total = stats.total, "partial tool call match");
        return AlternativeMatch {
            success: stats.matched == stats.total,
            stats: Some(stats),
        };
    }

    if expected.len() != actual.len() {
        tracing::debug!(
            expected = expected.len(),
            actual = actual.len(),
            "tool call sequence count mismatch"
        );
        return AlternativeMatch {
            success: false,
            stats: None,
        };
    }

    let success = if options.ordered {
        expected
            .iter()
            .zip(actual)
            .all(|(e, a)| sequence_matches(e, a, lenient))
    } else {
        max_one_to_one_matches(expected, actual, lenient) == expected.len()
    };

    AlternativeMatch {
        success,
        stats: None,
    }
}

/// Calls inside one sequence are compared positionally.
pub fn sequence_matches(expected: &[ToolCall], actual: &[ToolCall], allow_extra_keys: bool) -> bool {
    if expected.len() != actual.len() {
        tracing::debug!(
            expected = expected.len(),
            actual = actual.len(),
            "tool call count mismatch in sequence"
        );
        return false;
    }
    expected
        .iter()
        .zip(actual)
        .all(|(e, a)| call_matches(e, a, allow_extra_keys))
}

pub fn call_matches(expected: &ToolCall, actual: &ToolCall, allow_extra_keys: bool) -> bool {
    if expected.tool_name != actual.tool_name {
        tracing::debug!(
            expected = %expected.tool_name,
            actual = %actual.tool_name,
            "tool name mismatch"
        );
        return false;
    }

    for (key, pattern) in &expected.arguments {
        let Some(value) = actual.arguments.get(key) else {
            tracing::debug!(key = %key, "missing argument key");
            return false;
        };
        if !pattern_matches(pattern, value) {
            tracing::debug!(key = %key, "argument value mismatch");
            return false;
        }
    }

    if !allow_extra_keys {
        if let Some(extra) = actual
            .arguments
            .keys()
            .find(|key| !expected.arguments.contains_key(*key))
        {
            tracing::debug!(key = %extra, "additional argument key");
            return false;
        }
    }

    match (&expected.result, &actual.result) {
        (None, _) => true,
        (Some(_), None) => {
            tracing::debug!(tool = %expected.tool_name, "expected a result but call has none");
            false
        }
        (Some(pattern), Some(value)) => pattern_matches(pattern, value),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Invalid patterns never match.
fn pattern_matches(pattern: &Value, actual: &Value) -> bool {
    let pattern = stringify(pattern);
    match Regex::new(&pattern) {
        Ok(regex) => regex.is_match(&stringify(actual)),
        Err(e) => {
            tracing::debug!(pattern = %pattern, error = %e, "invalid regex pattern");
            false
        }
    }
}

/// Counts expected sequences found in `actual` in declaration order.
fn ordered_subsequence_matches(
    expected: &[ToolCallSequence],
    actual: &[ToolCallSequence],
    lenient: bool,
) -> usize {
    let mut cursor = 0;
    let mut matched = 0;
    for sequence in expected {
        if let Some(offset) = actual[cursor..]
            .iter()
            .position(|candidate| sequence_matches(sequence, candidate, lenient))
        {
            matched += 1;
            cursor += offset + 1;
        }
    }
    matched
}

/// Size of the largest one-to-one pairing between expected and actual sequences.
fn max_one_to_one_matches(
    expected: &[ToolCallSequence],
    actual: &[ToolCallSequence],
    lenient: bool,
) -> usize {
    let candidates: Vec<Vec<usize>> = expected
        .iter()
        .map(|sequence| {
            actual
                .iter()
                .enumerate()
                .filter(|(_, candidate)| sequence_matches(sequence, candidate, lenient))
                .map(|(j, _)| j)
                .collect()
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; actual.len()];
    let mut matched = 0;
    for i in 0..expected.len() {
        let mut visited = vec![false; actual.len()];
        if augment(i, &candidates, &mut owner, &mut visited) {
            matched += 1;
        }
    }
    matched
}

fn augment(
    i: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for &j in &candidates[i] {
        if visited[j] {
            continue;
        }
        visited[j] = true;
        let free = match owner[j] {
            None => true,
            Some(other) => augment(other, candidates, owner, visited),
        };
        if free {
            owner[j] = Some(i);
            return true;
        }
    }
    false
}

fn success_message(
    index: usize,
    alternative: &[ToolCallSequence],
    options: MatchOptions,
    stats: Option<MatchStats>,
) -> String {
    let pattern = if index == 0 {
        "Primary pattern".to_string()
    } else {
        format!("Alternative {}", index + 1)
    };

    let detail = if alternative.is_empty() {
        "No tool calls made (valid alternate skip scenario)".to_string()
    } else if let Some(stats) = stats {
        format!(
            "Tool calls: {}/{} matched, {} unmatched ({}, {})",
            stats.matched,
            stats.total,
            stats.unmatched(),
            options.match_mode(),
            options.order_mode()
        )
    } else {
        format!(
            "Tool calls match expected structure and arguments ({}, {})",
            options.match_mode(),
            options.order_mode()
        )
    };

    format!("{pattern} matched: {detail}")
}

fn failure_message(expected: &[Vec<ToolCallSequence>], actual: &[ToolCallSequence]) -> String {
    if actual.is_empty() {
        "No actual tool calls made and this is not set as an expected alternative".to_string()
    } else {
        format!(
            "Tool calls made but didn't match any of the {} expected pattern(s)",
            expected.len()
        )
    }
}

/// Multi-line rendering of observed calls for diagnostics.
fn format_tool_calls(tool_calls: &[ToolCallSequence]) -> String {
    if tool_calls.is_empty() {
        return "No tool calls".to_string();
    }
    tool_calls
        .iter()
        .enumerate()
        .map(|(i, sequence)| {
            let mut out = format!("Sequence {}:", i + 1);
            for (j, call) in sequence.iter().enumerate() {
                let args = serde_json::to_string(&call.arguments).unwrap_or_default();
                out.push_str(&format!("\n  Tool {}: {}({})", j + 1, call.tool_name, args));
            }
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> ToolCall {
        ToolCall::new(name)
    }

    fn single(calls: &[&str]) -> Vec<ToolCallSequence> {
        calls.iter().map(|name| vec![call(name)]).collect()
    }

    #[test]
    fn ordered_by_default() {
        let expected = vec![single(&["tool1", "tool2"])];

        let (ok, reason) =
            evaluate_tool_calls(&expected, &single(&["tool1", "tool2"]), MatchOptions::default());
        assert!(ok);
        assert_eq!(
            reason,
            "Primary pattern matched: Tool calls match expected structure and arguments (full, ordered)"
        );

        let (ok, _) =
            evaluate_tool_calls(&expected, &single(&["tool2", "tool1"]), MatchOptions::default());
        assert!(!ok);
    }

    #[test]
    fn unordered_accepts_any_sequence_order() {
        let expected = vec![single(&["tool1", "tool2"])];
        let options = MatchOptions {
            ordered: false,
            ..MatchOptions::default()
        };
        assert!(evaluate_tool_calls(&expected, &single(&["tool1", "tool2"]), options).0);
        assert!(evaluate_tool_calls(&expected, &single(&["tool2", "tool1"]), options).0);
    }

    #[test]
    fn unordered_requires_equal_duplicate_counts() {
        let expected = vec![single(&["a", "a", "b"])];
        let options = MatchOptions {
            ordered: false,
            ..MatchOptions::default()
        };
        assert!(evaluate_tool_calls(&expected, &single(&["b", "a", "a"]), options).0);
        assert!(!evaluate_tool_calls(&expected, &single(&["a", "b", "b"]), options).0);
    }

    #[test]
    fn unordered_pairs_same_name_calls_by_arguments() {
        let expected = vec![vec![
            vec![call("get").with_argument("id", ".*")],
            vec![call("get").with_argument("id", "^7$")],
        ]];
        let actual = vec![
            vec![call("get").with_argument("id", "7")],
            vec![call("get").with_argument("id", "9")],
        ];
        let options = MatchOptions {
            ordered: false,
            ..MatchOptions::default()
        };
        assert!(evaluate_tool_calls(&expected, &actual, options).0);
    }

    #[test]
    fn order_inside_a_sequence_always_matters() {
        let expected = vec![vec![vec![call("a"), call("b")]]];
        let actual = vec![vec![call("b"), call("a")]];
        let options = MatchOptions {
            ordered: false,
            ..MatchOptions::default()
        };
        assert!(!evaluate_tool_calls(&expected, &actual, options).0);
    }

    #[test]
    fn empty_alternative_matches_no_calls() {
        let expected = vec![single(&["tool_a"]), Vec::new()];
        let (ok, reason) = evaluate_tool_calls(&expected, &[], MatchOptions::default());
        assert!(ok);
        assert_eq!(
            reason,
            "Alternative 2 matched: No tool calls made (valid alternate skip scenario)"
        );
    }

    #[test]
    fn empty_alternative_does_not_match_real_calls() {
        let expected = vec![single(&["tool_a"]), Vec::new()];
        let (ok, reason) =
            evaluate_tool_calls(&expected, &single(&["tool_b"]), MatchOptions::default());
        assert!(!ok);
        assert_eq!(
            reason,
            "Tool calls made but didn't match any of the 2 expected pattern(s)"
        );
    }

    #[test]
    fn later_alternative_is_named() {
        let expected = vec![single(&["tool_a"]), single(&["tool_b"])];
        let (ok, reason) =
            evaluate_tool_calls(&expected, &single(&["tool_b"]), MatchOptions::default());
        assert!(ok);
        assert!(reason.starts_with("Alternative 2 matched:"), "{reason}");
    }

    #[test]
    fn no_calls_without_skip_alternative_fails() {
        let expected = vec![single(&["tool_a"])];
        let (ok, reason) = evaluate_tool_calls(&expected, &[], MatchOptions::default());
        assert!(!ok);
        assert_eq!(
            reason,
            "No actual tool calls made and this is not set as an expected alternative"
        );
    }

    #[test]
    fn argument_patterns_and_extra_keys() {
        let expected = vec![vec![vec![call("get_pod").with_argument("name", "pod-\\d+")]]];
        let exact = vec![vec![call("get_pod").with_argument("name", "pod-123")]];
        let extra = vec![vec![call("get_pod")
            .with_argument("name", "pod-123")
            .with_argument("extra", "x")]];

        assert!(evaluate_tool_calls(&expected, &exact, MatchOptions::default()).0);
        assert!(!evaluate_tool_calls(&expected, &extra, MatchOptions::default()).0);

        let partial = MatchOptions {
            full_match: false,
            ..MatchOptions::default()
        };
        let (ok, reason) = evaluate_tool_calls(&expected, &extra, partial);
        assert!(ok);
        assert_eq!(
            reason,
            "Primary pattern matched: Tool calls: 1/1 matched, 0 unmatched (partial, ordered)"
        );
    }

    #[test]
    fn missing_argument_key_fails() {
        let expected = vec![vec![vec![call("get_pod").with_argument("namespace", "default")]]];
        let actual = vec![vec![call("get_pod").with_argument("name", "x")]];
        assert!(!evaluate_tool_calls(&expected, &actual, MatchOptions::default()).0);
    }

    #[test]
    fn invalid_regex_is_a_mismatch() {
        let expected = vec![vec![vec![call("get").with_argument("name", "pod-[")]]];
        let actual = vec![vec![call("get").with_argument("name", "pod-[")]];
        assert!(!evaluate_tool_calls(&expected, &actual, MatchOptions::default()).0);
    }

    #[test]
    fn non_string_values_are_stringified() {
        let expected = vec![vec![vec![call("scale").with_argument("replicas", 3)]]];
        let actual = vec![vec![call("scale").with_argument("replicas", 3)]];
        assert!(evaluate_tool_calls(&expected, &actual, MatchOptions::default()).0);
    }

    #[test]
    fn result_pattern_is_checked_when_expected() {
        let expected = vec![vec![vec![call("create").with_result("created")]]];
        let ok_actual = vec![vec![call("create").with_result("namespace created")]];
        let no_result = vec![vec![call("create")]];
        assert!(evaluate_tool_calls(&expected, &ok_actual, MatchOptions::default()).0);
        assert!(!evaluate_tool_calls(&expected, &no_result, MatchOptions::default()).0);
    }

    #[test]
    fn partial_match_tolerates_extra_sequences() {
        let expected = vec![single(&["a", "c"])];
        let actual = single(&["a", "b", "c"]);
        let partial = MatchOptions {
            full_match: false,
            ordered: true,
        };
        assert!(evaluate_tool_calls(&expected, &actual, partial).0);

        let reversed = single(&["c", "b", "a"]);
        assert!(!evaluate_tool_calls(&expected, &reversed, partial).0);
        assert!(
            evaluate_tool_calls(
                &expected,
                &reversed,
                MatchOptions {
                    full_match: false,
                    ordered: false
                }
            )
            .0
        );
    }

    #[test]
    fn partial_match_reports_stats_on_failure_path() {
        let outcome = compare_tool_calls(
            &single(&["a", "z"]),
            &single(&["a", "b"]),
            MatchOptions {
                full_match: false,
                ordered: false,
            },
        );
        assert!(!outcome.success);
        assert_eq!(outcome.stats, Some(MatchStats { matched: 1, total: 2 }));
    }

    #[test]
    fn formats_calls_for_logging() {
        assert_eq!(format_tool_calls(&[]), "No tool calls");
        let text = format_tool_calls(&[vec![call("a").with_argument("k", "v")]]);
        assert_eq!(text, "Sequence 1:\n  Tool 1: a({\"k\":\"v\"})");
    }
}
