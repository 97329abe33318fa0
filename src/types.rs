use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::PathBuf,
};

use indexmap::IndexMap;
use schemars::{gen::SchemaGenerator, schema::Schema, JsonSchema};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Metric id to metadata, in declaration order.
pub type MetadataMap = IndexMap<String, MetricMetadata>;

/// One tool invocation, either expected or observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments: BTreeMap::new(),
            result: None,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<Value>) -> Self {
        self.result = Some(result.into());
        self
    }
}

pub type ToolCallSequence = Vec<ToolCall>;

/// Acceptable tool-call patterns for a turn. Any one alternative suffices.
///
/// Accepts both the alternatives form (`[[[call]], []]`) and the single-pattern
/// shorthand (`[[call], [call]]`), always serializing as alternatives.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExpectedToolCalls(Vec<Vec<ToolCallSequence>>);

#[derive(Deserialize, JsonSchema)]
#[serde(untagged)]
enum ExpectedToolCallsRepr {
    Alternatives(Vec<Vec<ToolCallSequence>>),
    Single(Vec<ToolCallSequence>),
}

impl ExpectedToolCalls {
    pub fn new(alternatives: Vec<Vec<ToolCallSequence>>) -> Self {
        Self(alternatives)
    }

    pub fn single(sequences: Vec<ToolCallSequence>) -> Self {
        Self(vec![sequences])
    }

    pub fn alternatives(&self) -> &[Vec<ToolCallSequence>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Vec<ToolCallSequence>>> for ExpectedToolCalls {
    fn from(alternatives: Vec<Vec<ToolCallSequence>>) -> Self {
        Self(alternatives)
    }
}

impl<'de> Deserialize<'de> for ExpectedToolCalls {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match ExpectedToolCallsRepr::deserialize(deserializer)? {
            ExpectedToolCallsRepr::Alternatives(alternatives) => Self(alternatives),
            ExpectedToolCallsRepr::Single(sequences) => Self(vec![sequences]),
        })
    }
}

impl JsonSchema for ExpectedToolCalls {
    fn schema_name() -> String {
        "ExpectedToolCalls".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        ExpectedToolCallsRepr::json_schema(gen)
    }
}

/// Per-metric configuration: threshold, default flag, and matcher options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MetricMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MetricMetadata {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold: Some(threshold),
            ..Self::default()
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TurnSpec {
    pub turn_id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallSequence>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_keywords: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_tool_calls: Option<ExpectedToolCalls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Unset uses system defaults, empty skips the turn, a list is taken verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_metrics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub turn_metrics_metadata: MetadataMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub api_input_tokens: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub api_output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_duration: Option<f64>,
    #[serde(skip)]
    pub invalid_metrics: BTreeSet<String>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl TurnSpec {
    pub fn new(turn_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            query: query.into(),
            attachments: Vec::new(),
            response: None,
            tool_calls: None,
            contexts: None,
            expected_response: None,
            expected_keywords: None,
            expected_intent: None,
            expected_tool_calls: None,
            conversation_id: None,
            turn_metrics: None,
            turn_metrics_metadata: MetadataMap::new(),
            verify_script: None,
            api_input_tokens: 0,
            api_output_tokens: 0,
            time_to_first_token: None,
            streaming_duration: None,
            invalid_metrics: BTreeSet::new(),
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_turn_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.turn_metrics = Some(metrics.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_metric_metadata(mut self, metric: impl Into<String>, metadata: MetricMetadata) -> Self {
        self.turn_metrics_metadata.insert(metric.into(), metadata);
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallSequence>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn with_expected_tool_calls(mut self, expected: ExpectedToolCalls) -> Self {
        self.expected_tool_calls = Some(expected);
        self
    }

    pub fn with_expected_keywords(mut self, groups: Vec<Vec<String>>) -> Self {
        self.expected_keywords = Some(groups);
        self
    }

    pub fn is_metric_invalid(&self, metric: &str) -> bool {
        self.invalid_metrics.contains(metric)
    }
}

/// One declared conversation: an ordered, fixed sequence of turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConversationSpec {
    pub conversation_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_metrics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub conversation_metrics_metadata: MetadataMap,
    pub turns: Vec<TurnSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_script: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_on_failure: Option<bool>,
    #[serde(skip)]
    pub invalid_metrics: BTreeSet<String>,
}

impl ConversationSpec {
    pub fn new(conversation_group_id: impl Into<String>, turns: Vec<TurnSpec>) -> Self {
        Self {
            conversation_group_id: conversation_group_id.into(),
            description: None,
            tag: None,
            conversation_metrics: None,
            conversation_metrics_metadata: MetadataMap::new(),
            turns,
            setup_script: None,
            cleanup_script: None,
            skip_on_failure: None,
            invalid_metrics: BTreeSet::new(),
        }
    }

    pub fn with_conversation_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conversation_metrics = Some(metrics.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_setup_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.setup_script = Some(path.into());
        self
    }

    pub fn with_cleanup_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.cleanup_script = Some(path.into());
        self
    }

    pub fn is_metric_invalid(&self, metric: &str) -> bool {
        self.invalid_metrics.contains(metric)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricLevel {
    Turn,
    Conversation,
}

impl fmt::Display for MetricLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Turn => f.write_str("turn"),
            Self::Conversation => f.write_str("conversation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl Verdict {
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TurnRef<'a> {
    pub index: usize,
    pub turn: &'a TurnSpec,
}

/// A single (conversation, optional turn, metric) unit of work.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub conversation: &'a ConversationSpec,
    pub metric_identifier: &'a str,
    pub turn: Option<TurnRef<'a>>,
}

impl<'a> EvaluationRequest<'a> {
    pub fn for_turn(
        conversation: &'a ConversationSpec,
        metric_identifier: &'a str,
        index: usize,
        turn: &'a TurnSpec,
    ) -> Self {
        Self {
            conversation,
            metric_identifier,
            turn: Some(TurnRef { index, turn }),
        }
    }

    pub fn for_conversation(conversation: &'a ConversationSpec, metric_identifier: &'a str) -> Self {
        Self {
            conversation,
            metric_identifier,
            turn: None,
        }
    }

    pub fn is_conversation(&self) -> bool {
        self.turn.is_none()
    }

    pub fn level(&self) -> MetricLevel {
        if self.is_conversation() {
            MetricLevel::Conversation
        } else {
            MetricLevel::Turn
        }
    }

    pub fn turn_data(&self) -> Option<&'a TurnSpec> {
        self.turn.map(|t| t.turn)
    }

    pub fn turn_id(&self) -> Option<&'a str> {
        self.turn.map(|t| t.turn.turn_id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub conversation_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub turn_id: Option<String>,
    pub metric_identifier: String,
    pub result: Verdict,
    pub score: Option<f64>,
    pub threshold: Option<f64>,
    pub reason: String,
    pub query: String,
    pub response: String,
    pub execution_time: f64,
    #[serde(default)]
    pub api_input_tokens: u64,
    #[serde(default)]
    pub api_output_tokens: u64,
    #[serde(default)]
    pub judge_llm_input_tokens: u64,
    #[serde(default)]
    pub judge_llm_output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_keywords: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_tool_calls: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_metadata: Option<String>,
}

impl EvaluationResult {
    /// Bare result carrying ids, the turn's query and an empty response.
    pub fn new(
        conversation: &ConversationSpec,
        turn: Option<&TurnSpec>,
        metric_identifier: impl Into<String>,
        result: Verdict,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            conversation_group_id: conversation.conversation_group_id.clone(),
            tag: conversation.tag.clone(),
            turn_id: turn.map(|t| t.turn_id.clone()),
            metric_identifier: metric_identifier.into(),
            result,
            score: None,
            threshold: None,
            reason: reason.into(),
            query: turn.map(|t| t.query.clone()).unwrap_or_default(),
            response: String::new(),
            execution_time: 0.0,
            api_input_tokens: 0,
            api_output_tokens: 0,
            judge_llm_input_tokens: 0,
            judge_llm_output_tokens: 0,
            time_to_first_token: None,
            streaming_duration: None,
            tool_calls: None,
            contexts: None,
            expected_response: None,
            expected_intent: None,
            expected_keywords: None,
            expected_tool_calls: None,
            metrics_metadata: None,
        }
    }

    /// Copies the turn's response, agent accounting and timings.
    pub fn with_turn_echo(mut self, turn: Option<&TurnSpec>) -> Self {
        if let Some(turn) = turn {
            self.response = turn.response.clone().unwrap_or_default();
            self.api_input_tokens = turn.api_input_tokens;
            self.api_output_tokens = turn.api_output_tokens;
            self.time_to_first_token = turn.time_to_first_token;
            self.streaming_duration = turn.streaming_duration;
        }
        self
    }

    pub fn is_turn_level(&self) -> bool {
        self.turn_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Judge token usage collected for exactly one metric evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounter {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, usage: &TokenUsage) {
        self.input_tokens += u64::from(usage.prompt_tokens);
        self.output_tokens += u64::from(usage.completion_tokens);
    }
}
