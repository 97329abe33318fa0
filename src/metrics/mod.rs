pub mod custom;
pub mod keywords;
pub mod manager;
pub mod script;
pub mod tool_eval;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;

use crate::{
    error::ScoreError,
    judge::JudgeModel,
    script::ScriptExecutor,
    types::{EvaluationRequest, MetricMetadata, TokenCounter},
};

pub use custom::{parse_score_response, JudgedMetrics};
pub use keywords::evaluate_keywords;
pub use manager::{MetricManager, MetricsSummary, DEFAULT_THRESHOLD};
pub use tool_eval::{compare_tool_calls, evaluate_tool_calls, MatchOptions};

/// What a scorer produced. `score == None` means the metric could not be
/// computed and `reason` says why.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricOutcome {
    pub score: Option<f64>,
    pub reason: String,
}

impl MetricOutcome {
    pub fn scored(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score: Some(score),
            reason: reason.into(),
        }
    }

    pub fn unscored(reason: impl Into<String>) -> Self {
        Self {
            score: None,
            reason: reason.into(),
        }
    }
}

/// A scoring framework backed by a judge model.
#[async_trait]
pub trait JudgedFramework: Send + Sync {
    async fn evaluate(
        &self,
        metric_name: &str,
        request: &EvaluationRequest<'_>,
        metadata: Option<&MetricMetadata>,
        tokens: &mut TokenCounter,
    ) -> Result<MetricOutcome, ScoreError>;
}

#[async_trait]
impl JudgedFramework for JudgedMetrics {
    async fn evaluate(
        &self,
        metric_name: &str,
        request: &EvaluationRequest<'_>,
        _metadata: Option<&MetricMetadata>,
        tokens: &mut TokenCounter,
    ) -> Result<MetricOutcome, ScoreError> {
        JudgedMetrics::evaluate(self, metric_name, request, tokens).await
    }
}

/// The three ways a metric gets scored.
#[derive(Clone)]
pub enum Scorer {
    /// Prompted judge model.
    Judged(Arc<dyn JudgedFramework>),
    /// Deterministic comparison of turn data.
    Structural,
    /// External verification script.
    Scripted(Arc<dyn ScriptExecutor>),
}

impl fmt::Debug for Scorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

impl Scorer {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Judged(_) => "judged",
            Self::Structural => "structural",
            Self::Scripted(_) => "scripted",
        }
    }

    /// Scripted metrics act on live systems and only make sense against the agent API.
    pub fn requires_api(&self) -> bool {
        matches!(self, Self::Scripted(_))
    }

    pub async fn evaluate(
        &self,
        metric_name: &str,
        request: &EvaluationRequest<'_>,
        metadata: Option<&MetricMetadata>,
        tokens: &mut TokenCounter,
    ) -> Result<MetricOutcome, ScoreError> {
        match self {
            Self::Judged(framework) => framework.evaluate(metric_name, request, metadata, tokens).await,
            Self::Structural => Ok(evaluate_structural(metric_name, request, metadata)),
            Self::Scripted(executor) => {
                Ok(script::evaluate_action(executor.as_ref(), metric_name, request).await)
            }
        }
    }
}

fn evaluate_structural(
    metric_name: &str,
    request: &EvaluationRequest<'_>,
    metadata: Option<&MetricMetadata>,
) -> MetricOutcome {
    match metric_name {
        "tool_eval" => evaluate_tool_eval(request, metadata),
        "keywords_eval" => evaluate_keywords_eval(request),
        other => MetricOutcome::unscored(format!("Unsupported custom metric: {other}")),
    }
}

fn evaluate_tool_eval(request: &EvaluationRequest<'_>, metadata: Option<&MetricMetadata>) -> MetricOutcome {
    let Some(turn) = request.turn_data() else {
        return MetricOutcome::unscored("Tool evaluation is a turn-level metric");
    };
    let Some(expected) = turn.expected_tool_calls.as_ref().filter(|e| !e.is_empty()) else {
        return MetricOutcome::unscored("No expected tool calls provided for tool evaluation");
    };

    let options = MatchOptions {
        ordered: metadata.and_then(|m| m.ordered).unwrap_or(true),
        full_match: metadata.and_then(|m| m.full_match).unwrap_or(true),
    };
    let actual = turn.tool_calls.as_deref().unwrap_or_default();
    let (success, details) = evaluate_tool_calls(expected.alternatives(), actual, options);
    MetricOutcome::scored(if success { 1.0 } else { 0.0 }, details)
}

fn evaluate_keywords_eval(request: &EvaluationRequest<'_>) -> MetricOutcome {
    let Some(turn) = request.turn_data() else {
        return MetricOutcome::unscored("Keywords evaluation is a turn-level metric");
    };
    let Some(ref groups) = turn.expected_keywords else {
        return MetricOutcome::unscored("No expected keywords provided for keywords evaluation");
    };
    let (score, reason) = evaluate_keywords(groups, turn.response.as_deref().unwrap_or_default());
    MetricOutcome::scored(score, reason)
}

/// Splits `framework:name`; both halves must be non-empty.
pub fn split_metric_identifier(metric: &str) -> Option<(&str, &str)> {
    let (framework, name) = metric.split_once(':')?;
    (!framework.is_empty() && !name.is_empty()).then_some((framework, name))
}

/// Routes metric identifiers to scorers: exact ids first, then the framework prefix.
#[derive(Debug, Clone, Default)]
pub struct ScorerRegistry {
    metrics: BTreeMap<String, Scorer>,
    frameworks: BTreeMap<String, Scorer>,
    known: BTreeSet<String>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural and scripted metrics, plus the judged ones when a judge is available.
    pub fn builtin(judge: Option<Arc<dyn JudgeModel>>, executor: Arc<dyn ScriptExecutor>) -> Self {
        let mut registry = Self::new()
            .register_metric("custom:tool_eval", Scorer::Structural)
            .register_metric("custom:keywords_eval", Scorer::Structural)
            .register_framework("script", Scorer::Scripted(executor))
            .with_known_metric("script:action_eval");

        if let Some(judge) = judge {
            registry = registry.register_framework(
                "custom",
                Scorer::Judged(Arc::new(JudgedMetrics::new(judge))),
            );
            for name in JudgedMetrics::SUPPORTED {
                registry = registry.with_known_metric(format!("custom:{name}"));
            }
        }
        registry
    }

    pub fn register_metric(mut self, metric: impl Into<String>, scorer: Scorer) -> Self {
        let metric = metric.into();
        self.known.insert(metric.clone());
        self.metrics.insert(metric, scorer);
        self
    }

    pub fn register_framework(mut self, framework: impl Into<String>, scorer: Scorer) -> Self {
        self.frameworks.insert(framework.into(), scorer);
        self
    }

    /// Declares a metric served by a framework-level scorer.
    pub fn with_known_metric(mut self, metric: impl Into<String>) -> Self {
        self.known.insert(metric.into());
        self
    }

    pub fn scorer_for(&self, metric: &str) -> Option<&Scorer> {
        self.metrics.get(metric).or_else(|| {
            split_metric_identifier(metric).and_then(|(framework, _)| self.frameworks.get(framework))
        })
    }

    pub fn is_known(&self, metric: &str) -> bool {
        self.known.contains(metric)
    }

    pub fn known_metrics(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        error::ScriptError,
        judge::ScriptedJudge,
        types::{ConversationSpec, ExpectedToolCalls, ToolCall, TurnSpec},
    };

    struct NeverRun;

    #[async_trait]
    impl ScriptExecutor for NeverRun {
        async fn run_script(&self, path: &Path) -> Result<bool, ScriptError> {
            Err(ScriptError::NotFound(path.to_path_buf()))
        }
    }

    fn registry(with_judge: bool) -> ScorerRegistry {
        let judge: Option<Arc<dyn JudgeModel>> =
            with_judge.then(|| Arc::new(ScriptedJudge::new([])) as Arc<dyn JudgeModel>);
        ScorerRegistry::builtin(judge, Arc::new(NeverRun))
    }

    #[test]
    fn routes_exact_ids_before_frameworks() {
        let registry = registry(true);
        assert_eq!(registry.scorer_for("custom:tool_eval").map(Scorer::kind), Some("structural"));
        assert_eq!(
            registry.scorer_for("custom:answer_correctness").map(Scorer::kind),
            Some("judged")
        );
        assert_eq!(registry.scorer_for("script:action_eval").map(Scorer::kind), Some("scripted"));
        assert!(registry.scorer_for("ragas:faithfulness").is_none());
        assert!(registry.scorer_for("not-an-id").is_none());
    }

    #[test]
    fn judged_metrics_are_unknown_without_a_judge() {
        assert!(registry(true).is_known("custom:intent_eval"));
        assert!(!registry(false).is_known("custom:intent_eval"));
        assert!(registry(false).is_known("custom:keywords_eval"));
        assert!(registry(false).scorer_for("custom:answer_correctness").is_none());
    }

    #[test]
    fn splits_identifiers() {
        assert_eq!(split_metric_identifier("ragas:faithfulness"), Some(("ragas", "faithfulness")));
        assert_eq!(split_metric_identifier("ragas:"), None);
        assert_eq!(split_metric_identifier("faithfulness"), None);
    }

    #[tokio::test]
    async fn tool_eval_uses_metadata_options() {
        let turn = TurnSpec::new("t1", "q")
            .with_tool_calls(vec![vec![ToolCall::new("b")], vec![ToolCall::new("a")]])
            .with_expected_tool_calls(ExpectedToolCalls::single(vec![
                vec![ToolCall::new("a")],
                vec![ToolCall::new("b")],
            ]));
        let conv = ConversationSpec::new("c", vec![turn]);
        let request = EvaluationRequest::for_turn(&conv, "custom:tool_eval", 0, &conv.turns[0]);

        let ordered = Scorer::Structural
            .evaluate("tool_eval", &request, None, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(ordered.score, Some(0.0));

        let unordered_meta = MetricMetadata {
            ordered: Some(false),
            ..MetricMetadata::default()
        };
        let unordered = Scorer::Structural
            .evaluate("tool_eval", &request, Some(&unordered_meta), &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(unordered.score, Some(1.0));
    }

    #[tokio::test]
    async fn tool_eval_runs_skip_alternative_without_actual_calls() {
        let turn = TurnSpec::new("t1", "q").with_expected_tool_calls(ExpectedToolCalls::new(vec![
            vec![vec![ToolCall::new("a")]],
            vec![],
        ]));
        let conv = ConversationSpec::new("c", vec![turn]);
        let request = EvaluationRequest::for_turn(&conv, "custom:tool_eval", 0, &conv.turns[0]);

        let outcome = Scorer::Structural
            .evaluate("tool_eval", &request, None, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(outcome.score, Some(1.0));
        assert!(outcome.reason.contains("Alternative 2"), "{}", outcome.reason);
    }

    #[tokio::test]
    async fn structural_metrics_need_expectations() {
        let conv = ConversationSpec::new("c", vec![TurnSpec::new("t1", "q").with_response("r")]);
        let request = EvaluationRequest::for_turn(&conv, "custom:keywords_eval", 0, &conv.turns[0]);

        let outcome = Scorer::Structural
            .evaluate("keywords_eval", &request, None, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(outcome.score, None);

        let conv_request = EvaluationRequest::for_conversation(&conv, "custom:tool_eval");
        let outcome = Scorer::Structural
            .evaluate("tool_eval", &conv_request, None, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, "Tool evaluation is a turn-level metric");
    }
}
